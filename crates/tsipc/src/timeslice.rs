//! Timeslice access: zero-copy views over the compute arenas and owned,
//! serializable copies.
//!
//! On-arena layout of one component (always contiguous, the fabric's skip
//! rule guarantees it): the concatenated microslice payloads first, then
//! the table of microslice descriptors. The descriptor table starts at an
//! arbitrary byte offset, so microslice descriptors are read unaligned.

use crate::desc::{MicrosliceDescriptor, TimesliceComponentDescriptor};
use crate::work_item::WorkItemRecord;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Read access to one built timeslice.
pub trait Timeslice {
    /// Global timeslice index.
    fn index(&self) -> u64;

    /// Number of components (= number of input nodes).
    fn num_components(&self) -> usize;

    /// The component descriptor of component `c`.
    fn component_descriptor(&self, c: usize) -> TimesliceComponentDescriptor;

    /// The full component region: payloads followed by the descriptor table.
    fn component_data(&self, c: usize) -> &[u8];

    /// Number of microslices in component `c` (core + overlap).
    fn num_microslices(&self, c: usize) -> u64 {
        self.component_descriptor(c).num_microslices
    }

    /// The microslice descriptor `m` of component `c`.
    fn microslice_descriptor(&self, c: usize, m: u64) -> MicrosliceDescriptor {
        let tcd = self.component_descriptor(c);
        let data = self.component_data(c);
        let table_start = content_len(&tcd);
        let at = table_start + (m as usize) * std::mem::size_of::<MicrosliceDescriptor>();
        assert!(m < tcd.num_microslices, "microslice index out of range");
        // SAFETY: `at` is in bounds (m checked above, table sized by
        // num_microslices); unaligned read of a padding-free repr(C) struct.
        unsafe {
            data.as_ptr()
                .add(at)
                .cast::<MicrosliceDescriptor>()
                .read_unaligned()
        }
    }

    /// The payload bytes of microslice `m` of component `c`.
    fn content(&self, c: usize, m: u64) -> &[u8] {
        let desc = self.microslice_descriptor(c, m);
        let first = self.microslice_descriptor(c, 0);
        let start = (desc.offset - first.offset) as usize;
        &self.component_data(c)[start..start + desc.size as usize]
    }
}

/// Payload length of a component (total size minus the descriptor table).
fn content_len(tcd: &TimesliceComponentDescriptor) -> usize {
    (tcd.size as usize)
        - (tcd.num_microslices as usize) * std::mem::size_of::<MicrosliceDescriptor>()
}

/// Zero-copy view of a timeslice in the compute node's arenas.
///
/// The arenas concatenate the per-input rings: component `c` lives in the
/// sub-ring starting at element `c << size_exp` of the respective arena.
pub struct TimesliceView<'a> {
    record: WorkItemRecord,
    data_base: *const u8,
    desc_base: *const TimesliceComponentDescriptor,
    _arena: PhantomData<&'a u8>,
}

// SAFETY: the view is read-only over memory whose writers are quiesced by
// the handoff protocol (the slot is not recycled until the completion).
unsafe impl Send for TimesliceView<'_> {}
unsafe impl Sync for TimesliceView<'_> {}

impl<'a> TimesliceView<'a> {
    /// Creates a view from a work-item record and the two arena bases.
    ///
    /// # Safety
    ///
    /// `data_base` and `desc_base` must point to arenas of
    /// `num_components << size_exp` elements that outlive `'a`, and the
    /// record must refer to a committed, not yet recycled timeslice.
    pub unsafe fn new(
        record: WorkItemRecord,
        data_base: *const u8,
        desc_base: *const TimesliceComponentDescriptor,
    ) -> Self {
        Self {
            record,
            data_base,
            desc_base,
            _arena: PhantomData,
        }
    }

    /// The work-item record this view was built from.
    pub fn work_item(&self) -> WorkItemRecord {
        self.record
    }

    /// Position in the descriptor arenas.
    pub fn descriptor_position(&self) -> u64 {
        self.record.descriptor_position
    }

    fn desc_ptr(&self, c: usize) -> *const TimesliceComponentDescriptor {
        let size = 1u64 << self.record.desc_buffer_size_exp;
        let slot = self.record.descriptor_position & (size - 1);
        // SAFETY: in bounds per the construction contract.
        unsafe { self.desc_base.add((c as u64 * size + slot) as usize) }
    }
}

impl Timeslice for TimesliceView<'_> {
    fn index(&self) -> u64 {
        self.record.timeslice_index
    }

    fn num_components(&self) -> usize {
        self.record.num_components as usize
    }

    fn component_descriptor(&self, c: usize) -> TimesliceComponentDescriptor {
        assert!(c < self.num_components(), "component index out of range");
        // SAFETY: arena entries are 32-byte records at aligned offsets.
        unsafe { *self.desc_ptr(c) }
    }

    fn component_data(&self, c: usize) -> &[u8] {
        let tcd = self.component_descriptor(c);
        let size = 1u64 << self.record.data_buffer_size_exp;
        let start = c as u64 * size + (tcd.offset & (size - 1));
        // SAFETY: the component is contiguous by the skip rule and in
        // bounds per the construction contract.
        unsafe { std::slice::from_raw_parts(self.data_base.add(start as usize), tcd.size as usize) }
    }
}

impl std::fmt::Debug for TimesliceView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimesliceView")
            .field("index", &self.index())
            .field("num_components", &self.num_components())
            .finish_non_exhaustive()
    }
}

/// One owned component of a [`StorableTimeslice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorableComponent {
    /// The component descriptor as committed by the fabric.
    pub descriptor: TimesliceComponentDescriptor,
    /// The component region (payloads + descriptor table), byte-exact.
    pub data: Vec<u8>,
}

/// An owned timeslice, detached from the arenas.
///
/// Serialization round-trips byte-exactly: a deserialized copy compares
/// equal and yields the same accessor results as the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorableTimeslice {
    index: u64,
    components: Vec<StorableComponent>,
}

impl StorableTimeslice {
    /// Creates an empty timeslice with the given global index.
    pub fn new(index: u64) -> Self {
        Self {
            index,
            components: Vec::new(),
        }
    }

    /// Appends a component built from microslices, producing the on-arena
    /// representation (payloads followed by the descriptor table).
    ///
    /// `offset` is the component's nominal position in the compute data
    /// arena; views derive per-microslice positions from descriptor offsets
    /// only, so any value is acceptable for detached timeslices.
    pub fn append_component(
        &mut self,
        offset: u64,
        microslices: &[(MicrosliceDescriptor, &[u8])],
    ) {
        let mut data = Vec::new();
        for (_, content) in microslices {
            data.extend_from_slice(content);
        }
        for (desc, _) in microslices {
            data.extend_from_slice(crate::desc::as_bytes(desc));
        }
        let descriptor = TimesliceComponentDescriptor {
            ts_num: self.index,
            offset,
            size: data.len() as u64,
            num_microslices: microslices.len() as u64,
        };
        self.components.push(StorableComponent { descriptor, data });
    }

    /// Copies a timeslice out of any [`Timeslice`] implementation.
    pub fn copy_from<T: Timeslice + ?Sized>(ts: &T) -> Self {
        let components = (0..ts.num_components())
            .map(|c| StorableComponent {
                descriptor: ts.component_descriptor(c),
                data: ts.component_data(c).to_vec(),
            })
            .collect();
        Self {
            index: ts.index(),
            components,
        }
    }
}

impl Timeslice for StorableTimeslice {
    fn index(&self) -> u64 {
        self.index
    }

    fn num_components(&self) -> usize {
        self.components.len()
    }

    fn component_descriptor(&self, c: usize) -> TimesliceComponentDescriptor {
        self.components[c].descriptor
    }

    fn component_data(&self, c: usize) -> &[u8] {
        &self.components[c].data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_timeslice() -> StorableTimeslice {
        let mut offset = 0u64;
        let microslices: Vec<(MicrosliceDescriptor, Vec<u8>)> = (0..3u64)
            .map(|m| {
                let content: Vec<u8> = (0..8 + m as u8).collect();
                let desc = MicrosliceDescriptor {
                    hdr_id: 0xdd,
                    hdr_ver: 0x01,
                    idx: 100 + m,
                    size: content.len() as u32,
                    offset,
                    ..Default::default()
                };
                offset += content.len() as u64;
                (desc, content)
            })
            .collect();

        let mut ts = StorableTimeslice::new(5);
        let borrowed: Vec<(MicrosliceDescriptor, &[u8])> = microslices
            .iter()
            .map(|(d, c)| (*d, c.as_slice()))
            .collect();
        ts.append_component(0, &borrowed);
        ts
    }

    #[test]
    fn test_accessors() {
        let ts = sample_timeslice();
        assert_eq!(ts.index(), 5);
        assert_eq!(ts.num_components(), 1);
        assert_eq!(ts.num_microslices(0), 3);
        assert_eq!(ts.microslice_descriptor(0, 1).idx, 101);
        assert_eq!(ts.content(0, 0), &(0..8).collect::<Vec<u8>>()[..]);
        assert_eq!(ts.content(0, 2).len(), 10);
    }

    #[test]
    fn test_view_matches_storable() {
        let ts = sample_timeslice();
        // lay the component into a fake pair of arenas
        let data_exp = 10u8;
        let desc_exp = 4u8;
        let mut data_arena = vec![0u8; 1 << data_exp];
        let mut desc_arena = vec![TimesliceComponentDescriptor::default(); 1 << desc_exp];

        let tcd = ts.component_descriptor(0);
        data_arena[..tcd.size as usize].copy_from_slice(ts.component_data(0));
        desc_arena[3] = tcd; // descriptor position 3

        let record = WorkItemRecord {
            timeslice_index: 5,
            descriptor_position: 3,
            data_buffer_size_exp: data_exp,
            desc_buffer_size_exp: desc_exp,
            num_components: 1,
        };
        let view =
            unsafe { TimesliceView::new(record, data_arena.as_ptr(), desc_arena.as_ptr()) };

        assert_eq!(StorableTimeslice::copy_from(&view), ts);
        assert_eq!(view.content(0, 2), ts.content(0, 2));
    }
}
