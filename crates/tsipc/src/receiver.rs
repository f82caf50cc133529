//! Subprocess-side access to a compute node's shared-memory handoff.
//!
//! A `TimesliceReceiver` attaches to the four named objects of a compute
//! instance — `<id>data_`, `<id>desc_`, `<id>work_items_`,
//! `<id>completions_` — and yields one built timeslice at a time. Dropping
//! the returned handle reports the completion, releasing the arena slot.
//!
//! The zero-length record on the work-item queue is the end-of-stream
//! sentinel; every consumer that reads it puts it back for its siblings.

use crate::desc::TimesliceComponentDescriptor;
use crate::queue::{QueueError, ShmQueue};
use crate::shm::{SharedRegion, ShmError};
use crate::timeslice::TimesliceView;
use crate::work_item::{CompletionRecord, RecordError, WorkItemRecord};
use log::debug;
use thiserror::Error;

/// Error type for the receiving side of the handoff.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// Shared-memory attach failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// Queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A work-item record did not decode.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Names of the four shared objects of a compute instance.
pub fn shm_names(identifier: &str) -> [String; 4] {
    [
        format!("{identifier}data_"),
        format!("{identifier}desc_"),
        format!("{identifier}work_items_"),
        format!("{identifier}completions_"),
    ]
}

/// Receives built timeslices from a compute node over shared memory.
pub struct TimesliceReceiver {
    data_region: SharedRegion,
    desc_region: SharedRegion,
    work_items: ShmQueue,
    completions: ShmQueue,
    eos: bool,
}

impl TimesliceReceiver {
    /// Attaches to the named objects of the compute instance `identifier`.
    pub fn connect(identifier: &str) -> Result<Self, ReceiverError> {
        let [data_name, desc_name, items_name, completions_name] = shm_names(identifier);
        Ok(Self {
            data_region: SharedRegion::open(&data_name)?,
            desc_region: SharedRegion::open(&desc_name)?,
            work_items: ShmQueue::open(&items_name)?,
            completions: ShmQueue::open(&completions_name)?,
            eos: false,
        })
    }

    /// Returns the next timeslice, blocking, or `None` at end of stream.
    pub fn get(&mut self) -> Result<Option<ReceivedTimeslice<'_>>, ReceiverError> {
        if self.eos {
            return Ok(None);
        }
        let record = self.work_items.recv()?;
        if record.is_empty() {
            debug!("received end-of-stream sentinel, re-emitting");
            self.work_items.send(&[])?;
            self.eos = true;
            return Ok(None);
        }
        let work_item = WorkItemRecord::decode(&record)?;
        // SAFETY: the regions stay mapped for the life of self, and the
        // assembler does not recycle the slot until our completion arrives.
        let view = unsafe {
            TimesliceView::new(
                work_item,
                self.data_region.as_ptr(),
                self.desc_region.as_ptr().cast::<TimesliceComponentDescriptor>(),
            )
        };
        Ok(Some(ReceivedTimeslice {
            view,
            completions: &self.completions,
        }))
    }
}

/// A timeslice held by a consumer; dropping it releases the arena slot.
pub struct ReceivedTimeslice<'a> {
    view: TimesliceView<'a>,
    completions: &'a ShmQueue,
}

impl<'a> std::ops::Deref for ReceivedTimeslice<'a> {
    type Target = TimesliceView<'a>;

    fn deref(&self) -> &Self::Target {
        &self.view
    }
}

impl Drop for ReceivedTimeslice<'_> {
    fn drop(&mut self) {
        let completion = CompletionRecord {
            descriptor_position: self.view.descriptor_position(),
        };
        let _ = self.completions.send(&completion.encode());
    }
}
