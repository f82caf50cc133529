//! Private-data blocks exchanged during the connection handshake.

use super::loopback::RegionHandle;

/// Sent by the input side with its connect request: a single identity byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputNodeInfo {
    /// The input node's index.
    pub index: u8,
}

impl InputNodeInfo {
    /// Encodes the private-data block.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.index]
    }

    /// Decodes the private-data block.
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            index: *data.first()?,
        })
    }
}

/// Sent back by the compute side on accept: arena handles and geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeNodeInfo {
    /// Echo of the input identity this connection serves.
    pub index: u8,
    /// Size exponent of the data arena (bytes).
    pub data_buffer_size_exp: u8,
    /// Size exponent of the descriptor arena (entries).
    pub desc_buffer_size_exp: u8,
    /// Access handle of the data arena.
    pub data_handle: RegionHandle,
    /// Access handle of the descriptor arena.
    pub desc_handle: RegionHandle,
}

impl ComputeNodeInfo {
    const ENCODED_LEN: usize = 19;

    /// Encodes the private-data block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.push(self.index);
        buf.push(self.data_buffer_size_exp);
        buf.push(self.desc_buffer_size_exp);
        buf.extend_from_slice(&self.data_handle.raw().to_le_bytes());
        buf.extend_from_slice(&self.desc_handle.raw().to_le_bytes());
        buf
    }

    /// Decodes the private-data block.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            index: data[0],
            data_buffer_size_exp: data[1],
            desc_buffer_size_exp: data[2],
            data_handle: RegionHandle::from_raw(u64::from_le_bytes(
                data[3..11].try_into().ok()?,
            )),
            desc_handle: RegionHandle::from_raw(u64::from_le_bytes(
                data[11..19].try_into().ok()?,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_info_roundtrip() {
        let info = InputNodeInfo { index: 3 };
        assert_eq!(InputNodeInfo::decode(&info.encode()), Some(info));
        assert_eq!(InputNodeInfo::decode(&[]), None);
    }

    #[test]
    fn test_compute_info_roundtrip() {
        let info = ComputeNodeInfo {
            index: 7,
            data_buffer_size_exp: 27,
            desc_buffer_size_exp: 19,
            data_handle: RegionHandle::from_raw(11),
            desc_handle: RegionHandle::from_raw(12),
        };
        assert_eq!(ComputeNodeInfo::decode(&info.encode()), Some(info));
        assert_eq!(ComputeNodeInfo::decode(&[0u8; 5]), None);
    }
}
