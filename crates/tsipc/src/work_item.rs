//! Work-item and completion records of the shared-memory handoff.
//!
//! These are the payloads of the `<id>work_items_` and `<id>completions_`
//! queues and of the distributor's `WORK_ITEM` payload frame. The encoding
//! is fixed little-endian, independent of the host ABI.

use thiserror::Error;

/// Decoding error for handoff records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The record has the wrong length.
    #[error("record of {actual} bytes, expected {expected}")]
    Length {
        /// Received length.
        actual: usize,
        /// Required length.
        expected: usize,
    },
}

/// A reference to one built timeslice, sent from the assembler to a
/// consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItemRecord {
    /// Global timeslice index.
    pub timeslice_index: u64,
    /// Position in the descriptor arenas (same for every component).
    pub descriptor_position: u64,
    /// Size exponent of one per-input data arena.
    pub data_buffer_size_exp: u8,
    /// Size exponent of one per-input descriptor arena.
    pub desc_buffer_size_exp: u8,
    /// Number of components (= number of input nodes).
    pub num_components: u8,
}

impl WorkItemRecord {
    /// Encoded record length in bytes.
    pub const ENCODED_LEN: usize = 19;

    /// Encodes into the fixed wire layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.timeslice_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.descriptor_position.to_le_bytes());
        buf[16] = self.data_buffer_size_exp;
        buf[17] = self.desc_buffer_size_exp;
        buf[18] = self.num_components;
        buf
    }

    /// Decodes from the fixed wire layout.
    pub fn decode(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(RecordError::Length {
                actual: buf.len(),
                expected: Self::ENCODED_LEN,
            });
        }
        Ok(Self {
            timeslice_index: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            descriptor_position: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            data_buffer_size_exp: buf[16],
            desc_buffer_size_exp: buf[17],
            num_components: buf[18],
        })
    }
}

/// A consumer's notice that a timeslice slot may be recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Position in the descriptor arenas being released.
    pub descriptor_position: u64,
}

impl CompletionRecord {
    /// Encoded record length in bytes.
    pub const ENCODED_LEN: usize = 8;

    /// Encodes into the fixed wire layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        self.descriptor_position.to_le_bytes()
    }

    /// Decodes from the fixed wire layout.
    pub fn decode(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(RecordError::Length {
                actual: buf.len(),
                expected: Self::ENCODED_LEN,
            });
        }
        Ok(Self {
            descriptor_position: u64::from_le_bytes(buf.try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_roundtrip() {
        let record = WorkItemRecord {
            timeslice_index: 123_456,
            descriptor_position: 42,
            data_buffer_size_exp: 27,
            desc_buffer_size_exp: 19,
            num_components: 4,
        };
        assert_eq!(WorkItemRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_completion_roundtrip() {
        let record = CompletionRecord {
            descriptor_position: 7,
        };
        assert_eq!(CompletionRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn test_decode_length_mismatch() {
        assert!(matches!(
            WorkItemRecord::decode(&[0u8; 18]),
            Err(RecordError::Length {
                actual: 18,
                expected: 19
            })
        ));
        assert!(CompletionRecord::decode(&[0u8; 9]).is_err());
    }
}
