//! Work-request identifiers.
//!
//! Completions carry a single opaque `u64` chosen by the poster. The fabric
//! packs everything it needs to route a completion without back-pointers:
//! `(verb:8 | connection:16 | timeslice:40)`.

/// The message kinds of a connection, as tagged in work-request ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    /// Remote write of payload into the compute data arena.
    WriteData = 1,
    /// Second payload segment after a wrap split.
    WriteDataWrap = 2,
    /// The fenced commit record into the compute descriptor arena.
    WriteDesc = 3,
    /// Input-side send of a write-pointer update.
    SendWritePointer = 4,
    /// Input-side receive of an acknowledgement.
    ReceiveAck = 5,
    /// Compute-side send of an acknowledgement.
    SendAck = 6,
    /// Compute-side receive of a write-pointer update.
    ReceiveWritePointer = 7,
    /// Compute-side send of the final acknowledgement.
    SendFinalize = 8,
}

impl Verb {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::WriteData,
            2 => Self::WriteDataWrap,
            3 => Self::WriteDesc,
            4 => Self::SendWritePointer,
            5 => Self::ReceiveAck,
            6 => Self::SendAck,
            7 => Self::ReceiveWritePointer,
            8 => Self::SendFinalize,
            _ => return None,
        })
    }
}

/// A decoded work-request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId {
    /// Message kind.
    pub verb: Verb,
    /// Connection index within the owning group.
    pub connection: u16,
    /// Timeslice index (only meaningful for `WriteDesc`).
    pub timeslice: u64,
}

impl RequestId {
    /// Packs a request id. The timeslice index must fit in 40 bits.
    pub fn pack(verb: Verb, connection: u16, timeslice: u64) -> u64 {
        debug_assert!(timeslice < (1 << 40), "timeslice index exceeds 40 bits");
        (verb as u64) | (u64::from(connection) << 8) | (timeslice << 24)
    }

    /// Unpacks a request id; `None` for a verb this fabric never posts.
    pub fn unpack(wr_id: u64) -> Option<Self> {
        Some(Self {
            verb: Verb::from_u8((wr_id & 0xFF) as u8)?,
            connection: ((wr_id >> 8) & 0xFFFF) as u16,
            timeslice: wr_id >> 24,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let wr_id = RequestId::pack(Verb::WriteDesc, 513, 0x12_3456_789A);
        let id = RequestId::unpack(wr_id).unwrap();
        assert_eq!(id.verb, Verb::WriteDesc);
        assert_eq!(id.connection, 513);
        assert_eq!(id.timeslice, 0x12_3456_789A);
    }

    #[test]
    fn test_unpack_rejects_unknown_verb() {
        assert!(RequestId::unpack(0).is_none());
        assert!(RequestId::unpack(0xFF).is_none());
    }

    #[test]
    fn test_verbs_are_distinguishable() {
        let verbs = [
            Verb::WriteData,
            Verb::WriteDataWrap,
            Verb::WriteDesc,
            Verb::SendWritePointer,
            Verb::ReceiveAck,
            Verb::SendAck,
            Verb::ReceiveWritePointer,
            Verb::SendFinalize,
        ];
        for verb in verbs {
            let id = RequestId::unpack(RequestId::pack(verb, 7, 9)).unwrap();
            assert_eq!(id.verb, verb);
        }
    }
}
