//! Fixed-layout descriptors of the timeslice-building fabric.
//!
//! These structs are written byte-for-byte into arenas that other processes
//! (and, through the transport, other hosts) read. They are `#[repr(C)]`
//! with explicitly padding-free field layouts; the compile-time assertions
//! below pin the sizes.

use serde::{Deserialize, Serialize};

/// Descriptor of a single microslice in an input node's descriptor arena.
///
/// The `offset` is a cumulative byte position in the input node's data
/// arena; it grows monotonically within an input and is never reduced
/// modulo the arena size until the moment of access.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicrosliceDescriptor {
    /// Header format identifier.
    pub hdr_id: u8,
    /// Header format version.
    pub hdr_ver: u8,
    /// Equipment identifier.
    pub eq_id: u16,
    /// Status and error flags.
    pub flags: u16,
    /// Subsystem identifier.
    pub sys_id: u8,
    /// Subsystem format version.
    pub sys_ver: u8,
    /// Microslice index.
    pub idx: u64,
    /// CRC-32 of the payload (populated by the source, not checked here).
    pub crc: u32,
    /// Content size in bytes.
    pub size: u32,
    /// Offset of the payload start in the input node's data arena.
    pub offset: u64,
}

const _: () = assert!(std::mem::size_of::<MicrosliceDescriptor>() == 32);

/// Descriptor of one timeslice component in a compute node's descriptor
/// arena — the commit record of the write chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimesliceComponentDescriptor {
    /// Index of the owning timeslice.
    pub ts_num: u64,
    /// Offset of this component in the compute node's data arena.
    pub offset: u64,
    /// Content size in bytes (payload plus microslice descriptor table).
    pub size: u64,
    /// Number of microslices in this component (core + overlap).
    pub num_microslices: u64,
}

const _: () = assert!(std::mem::size_of::<TimesliceComponentDescriptor>() == 32);

/// Descriptor of a fully built timeslice on a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimesliceDescriptor {
    /// Global timeslice index.
    pub index: u64,
    /// Position in the descriptor arenas (same for every component).
    pub ts_pos: u64,
    /// Number of core microslices (without the overlap).
    pub num_core_microslices: u32,
    /// Number of components, one per input node.
    pub num_components: u32,
}

/// A pair of cumulative buffer positions, exchanged in credit messages.
///
/// Counts are 64-bit totals since connection start and never wrap
/// numerically; addressing reduces them modulo the buffer size. The
/// all-ones pair is the *final* sentinel: the sender will write no more.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPosition {
    /// Position in the data arena, in bytes.
    pub data: u64,
    /// Position in the descriptor arena, in entries.
    pub desc: u64,
}

const _: () = assert!(std::mem::size_of::<BufferPosition>() == 16);

impl BufferPosition {
    /// The *final* sentinel position.
    pub const FINAL: Self = Self {
        data: u64::MAX,
        desc: u64::MAX,
    };

    /// Returns true if this is the final sentinel.
    #[inline]
    pub fn is_final(&self) -> bool {
        *self == Self::FINAL
    }

    /// Serializes into the 16-byte little-endian wire record.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.data.to_le_bytes());
        buf[8..].copy_from_slice(&self.desc.to_le_bytes());
        buf
    }

    /// Deserializes from the 16-byte little-endian wire record.
    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        Self {
            data: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            desc: u64::from_le_bytes(buf[8..].try_into().unwrap()),
        }
    }
}

/// Views a fixed-layout descriptor as its raw bytes.
///
/// Restricted to the padding-free `#[repr(C)]` types of this module via the
/// sealed marker trait below.
pub fn as_bytes<T: FixedLayout>(value: &T) -> &[u8] {
    // SAFETY: FixedLayout types are repr(C), Copy and padding-free, so every
    // byte of the representation is initialized.
    unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

/// Marker for padding-free `#[repr(C)]` wire structs.
pub trait FixedLayout: Copy + private::Sealed {}

impl FixedLayout for MicrosliceDescriptor {}
impl FixedLayout for TimesliceComponentDescriptor {}
impl FixedLayout for BufferPosition {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::MicrosliceDescriptor {}
    impl Sealed for super::TimesliceComponentDescriptor {}
    impl Sealed for super::BufferPosition {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microslice_descriptor_layout() {
        // field offsets are part of the wire format
        let d = MicrosliceDescriptor::default();
        let base = (&d as *const MicrosliceDescriptor).cast::<u8>() as usize;
        assert_eq!((&d.idx as *const u64).cast::<u8>() as usize - base, 8);
        assert_eq!((&d.crc as *const u32).cast::<u8>() as usize - base, 16);
        assert_eq!((&d.size as *const u32).cast::<u8>() as usize - base, 20);
        assert_eq!((&d.offset as *const u64).cast::<u8>() as usize - base, 24);
    }

    #[test]
    fn test_buffer_position_roundtrip() {
        let pos = BufferPosition {
            data: 0x0123_4567_89ab_cdef,
            desc: 42,
        };
        assert_eq!(BufferPosition::from_bytes(&pos.to_bytes()), pos);
    }

    #[test]
    fn test_final_sentinel() {
        assert!(BufferPosition::FINAL.is_final());
        assert!(!BufferPosition::default().is_final());
        let wire = BufferPosition::FINAL.to_bytes();
        assert!(BufferPosition::from_bytes(&wire).is_final());
    }

    #[test]
    fn test_as_bytes_length() {
        let d = MicrosliceDescriptor::default();
        assert_eq!(as_bytes(&d).len(), 32);
        let t = TimesliceComponentDescriptor::default();
        assert_eq!(as_bytes(&t).len(), 32);
    }
}
