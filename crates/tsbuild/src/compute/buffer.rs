//! The compute node's timeslice buffer: the named shared-memory arenas
//! and the record queues of the legacy handoff path.
//!
//! The data arena concatenates one ring per input node (`num_inputs <<
//! data_exp` bytes), likewise the descriptor arena; workers map both
//! read-only by identifier. The per-input slices are handed to the
//! transport as registered regions and to the assembler as wrap-around
//! views.

use crate::error::BuildError;
use log::debug;
use tsipc::desc::TimesliceComponentDescriptor;
use tsipc::queue::ShmQueue;
use tsipc::receiver::shm_names;
use tsipc::shm::SharedRegion;
use tsipc::work_item::{CompletionRecord, WorkItemRecord};
use wrapring::RingBufferView;

/// Shared-memory arenas and handoff queues of one compute instance.
pub struct TimesliceBuffer {
    identifier: String,
    num_inputs: u32,
    data_buffer_size_exp: u32,
    desc_buffer_size_exp: u32,
    data_region: SharedRegion,
    desc_region: SharedRegion,
    work_items: ShmQueue,
    completions: ShmQueue,
}

impl TimesliceBuffer {
    /// Creates the four named objects of a compute instance.
    pub fn new(
        identifier: &str,
        data_buffer_size_exp: u32,
        desc_buffer_size_exp: u32,
        num_inputs: u32,
    ) -> Result<Self, BuildError> {
        let [data_name, desc_name, items_name, completions_name] = shm_names(identifier);
        let data_len = (num_inputs as usize) << data_buffer_size_exp;
        let desc_len = ((num_inputs as usize) << desc_buffer_size_exp)
            * std::mem::size_of::<TimesliceComponentDescriptor>();

        debug!(
            "timeslice buffer {identifier}: {data_len} + {desc_len} bytes shared memory"
        );
        let data_region = SharedRegion::create(&data_name, data_len)?;
        let desc_region = SharedRegion::create(&desc_name, desc_len)?;
        // sized so that every outstanding descriptor slot can be queued,
        // sends on the handoff paths never block
        let queue_capacity = 1usize << desc_buffer_size_exp;
        let work_items = ShmQueue::create(&items_name, queue_capacity, WorkItemRecord::ENCODED_LEN)?;
        let completions =
            ShmQueue::create(&completions_name, queue_capacity, CompletionRecord::ENCODED_LEN)?;

        Ok(Self {
            identifier: identifier.to_owned(),
            num_inputs,
            data_buffer_size_exp,
            desc_buffer_size_exp,
            data_region,
            desc_region,
            work_items,
            completions,
        })
    }

    /// The shared-memory identifier workers attach to.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Number of per-input rings in the arenas.
    pub fn num_inputs(&self) -> u32 {
        self.num_inputs
    }

    /// Data arena size exponent per input.
    pub fn data_buffer_size_exp(&self) -> u32 {
        self.data_buffer_size_exp
    }

    /// Descriptor arena size exponent per input.
    pub fn desc_buffer_size_exp(&self) -> u32 {
        self.desc_buffer_size_exp
    }

    /// Raw pointer to input `index`'s data ring (for region registration).
    pub fn data_ptr(&self, index: u16) -> *mut u8 {
        debug_assert!(u32::from(index) < self.num_inputs);
        // SAFETY: index checked against the arena layout.
        unsafe {
            self.data_region
                .as_mut_ptr()
                .add((index as usize) << self.data_buffer_size_exp)
        }
    }

    /// Bytes per input data ring.
    pub fn data_bytes_per_input(&self) -> usize {
        1usize << self.data_buffer_size_exp
    }

    /// Raw pointer to input `index`'s descriptor ring.
    pub fn desc_ptr(&self, index: u16) -> *mut TimesliceComponentDescriptor {
        debug_assert!(u32::from(index) < self.num_inputs);
        // SAFETY: index checked against the arena layout.
        unsafe {
            self.desc_region
                .as_mut_ptr()
                .cast::<TimesliceComponentDescriptor>()
                .add((index as usize) << self.desc_buffer_size_exp)
        }
    }

    /// Bytes per input descriptor ring.
    pub fn desc_bytes_per_input(&self) -> usize {
        (1usize << self.desc_buffer_size_exp)
            * std::mem::size_of::<TimesliceComponentDescriptor>()
    }

    /// Wrap-around view of input `index`'s descriptor ring.
    pub fn desc_view(&self, index: u16) -> RingBufferView<TimesliceComponentDescriptor> {
        // SAFETY: the region outlives self and has 2^exp entries per input.
        unsafe { RingBufferView::new(self.desc_ptr(index), self.desc_buffer_size_exp) }
            .expect("descriptor view geometry")
    }

    /// Wrap-around view of input `index`'s data ring.
    pub fn data_view(&self, index: u16) -> RingBufferView<u8> {
        // SAFETY: the region outlives self and has 2^exp bytes per input.
        unsafe { RingBufferView::new(self.data_ptr(index), self.data_buffer_size_exp) }
            .expect("data view geometry")
    }

    /// Publishes a work item on the record-queue path.
    pub fn publish_work_item(&self, record: &WorkItemRecord) -> Result<(), BuildError> {
        self.work_items.send(&record.encode())?;
        Ok(())
    }

    /// Publishes the zero-length end-of-stream sentinel.
    pub fn publish_end_of_stream(&self) -> Result<(), BuildError> {
        self.work_items.send(&[])?;
        Ok(())
    }

    /// Polls the completion queue of the record-queue path.
    pub fn try_completion(&self) -> Option<u64> {
        let record = self.work_completion_record()?;
        Some(record.descriptor_position)
    }

    fn work_completion_record(&self) -> Option<CompletionRecord> {
        let bytes = self.completions.try_recv().ok()??;
        CompletionRecord::decode(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_identifier(tag: &str) -> String {
        format!("tsbuild_buf_{}_{}_", tag, std::process::id())
    }

    #[test]
    fn test_arena_layout() {
        let buffer = TimesliceBuffer::new(&unique_identifier("layout"), 12, 4, 3).unwrap();
        assert_eq!(buffer.data_bytes_per_input(), 4096);
        assert_eq!(buffer.desc_bytes_per_input(), 16 * 32);
        // per-input rings are disjoint and ordered
        let d0 = buffer.data_ptr(0) as usize;
        let d1 = buffer.data_ptr(1) as usize;
        let d2 = buffer.data_ptr(2) as usize;
        assert_eq!(d1 - d0, 4096);
        assert_eq!(d2 - d1, 4096);
    }

    #[test]
    fn test_desc_view_addresses_ring() {
        let buffer = TimesliceBuffer::new(&unique_identifier("view"), 10, 3, 2).unwrap();
        let view = buffer.desc_view(1);
        let descriptor = TimesliceComponentDescriptor {
            ts_num: 9,
            offset: 5,
            size: 6,
            num_microslices: 1,
        };
        view.write_at(11, descriptor); // slot 3 of input 1's ring
        // the raw arena shows it at input offset 1*8 + 3
        let raw = unsafe { *buffer.desc_ptr(1).add(3) };
        assert_eq!(raw, descriptor);
    }

    #[test]
    fn test_work_item_queue_roundtrip() {
        let buffer = TimesliceBuffer::new(&unique_identifier("queue"), 10, 3, 1).unwrap();
        let record = WorkItemRecord {
            timeslice_index: 4,
            descriptor_position: 4,
            data_buffer_size_exp: 10,
            desc_buffer_size_exp: 3,
            num_components: 1,
        };
        buffer.publish_work_item(&record).unwrap();
        // a consumer answers on the completion queue
        let receiver_side = tsipc::queue::ShmQueue::open(&shm_names(buffer.identifier())[3]).unwrap();
        receiver_side
            .send(
                &CompletionRecord {
                    descriptor_position: 4,
                }
                .encode(),
            )
            .unwrap();
        assert_eq!(buffer.try_completion(), Some(4));
        assert_eq!(buffer.try_completion(), None);
    }
}
