//! The compute-side endpoint of one timeslice-building connection.
//!
//! The transport writes this connection's slice of the arenas remotely;
//! the endpoint only mirrors the credit state: it records inbound write
//! pointers, echoes acknowledgements, and answers the final sentinel once
//! the node as a whole is ready.

use crate::transport::Endpoint;
use crate::wrid::{RequestId, Verb};
use log::{debug, error, trace};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tsipc::desc::{BufferPosition, TimesliceComponentDescriptor};
use wrapring::RingBufferView;

/// Outcome of an inbound write-pointer update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Regular update, write pointer recorded.
    Advanced,
    /// The final sentinel arrived; the node decides when to answer it.
    FinalReceived,
}

/// One additional slot avoids a race between the ack send and the next
/// echo triggered by an already-delivered update.
const MAX_PENDING_SENDS: u32 = 2;

/// The compute-node endpoint of a single `(input, compute)` connection.
pub struct ComputeNodeConnection {
    index: u16,
    compute_index: u64,
    endpoint: Endpoint,
    desc: RingBufferView<TimesliceComponentDescriptor>,
    cn_wp: Mutex<BufferPosition>,
    cn_ack: Mutex<BufferPosition>,
    pending_send_requests: AtomicU32,
    final_received: AtomicBool,
    done: AtomicBool,
}

impl ComputeNodeConnection {
    /// Wraps an accepted endpoint; arms the first write-pointer receive.
    pub fn new(
        index: u16,
        compute_index: u64,
        endpoint: Endpoint,
        desc: RingBufferView<TimesliceComponentDescriptor>,
    ) -> Self {
        endpoint.post_recv(RequestId::pack(Verb::ReceiveWritePointer, index, 0));
        Self {
            index,
            compute_index,
            endpoint,
            desc,
            cn_wp: Mutex::new(BufferPosition::default()),
            cn_ack: Mutex::new(BufferPosition::default()),
            pending_send_requests: AtomicU32::new(0),
            final_received: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// The connection index (= input node index).
    pub fn index(&self) -> u16 {
        self.index
    }

    /// The current inbound write pointer.
    pub fn write_pointer(&self) -> BufferPosition {
        *self.cn_wp.lock().unwrap()
    }

    /// True once the input announced the final sentinel.
    pub fn final_received(&self) -> bool {
        self.final_received.load(Ordering::Acquire)
    }

    /// True once the final acknowledgement send completed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// True while acknowledgement sends are in flight.
    pub fn sends_pending(&self) -> bool {
        self.pending_send_requests.load(Ordering::Acquire) != 0
    }

    /// Processes an inbound write-pointer update.
    pub fn on_complete_recv(&self, payload: [u8; 16]) -> RecvOutcome {
        let pos = BufferPosition::from_bytes(&payload);
        if pos.is_final() {
            debug!(
                "[c{}] [{}] received final write pointer",
                self.compute_index, self.index
            );
            self.final_received.store(true, Ordering::Release);
            return RecvOutcome::FinalReceived;
        }
        trace!(
            "[c{}] [{}] write pointer update: data={} desc={}",
            self.compute_index,
            self.index,
            pos.data,
            pos.desc
        );
        *self.cn_wp.lock().unwrap() = pos;
        self.endpoint
            .post_recv(RequestId::pack(Verb::ReceiveWritePointer, self.index, 0));
        self.post_send_ack(*self.cn_ack.lock().unwrap(), false);
        RecvOutcome::Advanced
    }

    /// An acknowledgement send completed.
    pub fn on_complete_send(&self) {
        self.pending_send_requests.fetch_sub(1, Ordering::AcqRel);
    }

    /// The final acknowledgement send completed: the connection is done.
    pub fn on_complete_send_finalize(&self) {
        self.pending_send_requests.fetch_sub(1, Ordering::AcqRel);
        self.done.store(true, Ordering::Release);
    }

    /// Raises the consumer acknowledgement to `ack_desc` descriptor
    /// entries; the data position follows from the last released
    /// component. Sent to the input with the next echo.
    pub fn inc_ack_pointers(&self, ack_desc: u64) {
        let mut ack = self.cn_ack.lock().unwrap();
        ack.desc = ack_desc;
        ack.data = if ack_desc == 0 {
            0
        } else {
            let released = *self.desc.at(ack_desc - 1);
            released.offset + released.size
        };
    }

    /// Echoes the final sentinel; called once the node has drained.
    pub fn send_final_ack(&self) {
        debug!(
            "[c{}] [{}] sending final acknowledgement",
            self.compute_index, self.index
        );
        self.post_send_ack(BufferPosition::FINAL, true);
    }

    /// Initiates disconnection.
    pub fn disconnect(&self) {
        self.endpoint.disconnect();
    }

    fn post_send_ack(&self, pos: BufferPosition, finalize: bool) {
        let pending = self.pending_send_requests.fetch_add(1, Ordering::AcqRel);
        if pending >= MAX_PENDING_SENDS {
            // cannot happen under the one-in-flight rule
            error!(
                "[c{}] [{}] pending send requests exceeded",
                self.compute_index, self.index
            );
        }
        let verb = if finalize {
            Verb::SendFinalize
        } else {
            Verb::SendAck
        };
        self.endpoint
            .post_send(RequestId::pack(verb, self.index, 0), pos.to_bytes(), true);
    }
}
