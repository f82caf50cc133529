//! Timeslice IPC layer.
//!
//! Everything that crosses a process boundary lives here: the fixed-layout
//! descriptors written into the fabric's arenas, the named shared-memory
//! regions and record queues of a compute node, the worker control protocol,
//! and the item distributor that fans built timeslices out to workers.
//!
//! The layering is strict: this crate knows nothing about transports or
//! credit — it deals in finished timeslices and their delivery to local
//! consumers.

pub mod archive;
pub mod desc;
pub mod distributor;
pub mod itemproto;
pub mod producer;
pub mod socket;
pub mod timeslice;
pub mod work_item;
pub mod worker;

#[cfg(unix)]
pub mod queue;
#[cfg(unix)]
pub mod receiver;
#[cfg(unix)]
pub mod shm;

pub use desc::{
    BufferPosition, MicrosliceDescriptor, TimesliceComponentDescriptor, TimesliceDescriptor,
};
pub use distributor::ItemDistributor;
pub use itemproto::{ItemId, ProtocolTiming, WorkerParameters, WorkerQueuePolicy, FINAL_ITEM_ID};
pub use producer::ItemProducer;
pub use timeslice::{StorableTimeslice, Timeslice, TimesliceView};
pub use work_item::{CompletionRecord, WorkItemRecord};
pub use worker::{ItemWorker, WorkerItem};
