//! Transport primitives of the fabric.
//!
//! The fabric is written against a small remote-direct-write contract:
//!
//! - reliable, in-order connections with a write verb that places bytes at
//!   an explicit offset in a registered remote region, with per-write
//!   signaled/unsignaled and fenced flags;
//! - 16-byte message sends matched to receives armed by the other side;
//! - completion events carrying an opaque `wr_id` chosen by the poster;
//! - connection-manager events (address/route resolution, connect request,
//!   established, rejected, disconnected) with a private-data block
//!   exchanged during the handshake.
//!
//! The backend provided here is an in-process loopback fabric: remote
//! writes are performed at post time, directly from the poster's gather
//! list into the registered region (ring to ring, no intermediate
//! allocation), and channel delivery of the subsequent messages provides
//! the fence/visibility ordering the protocol relies on.

mod info;
mod loopback;

pub use info::{ComputeNodeInfo, InputNodeInfo};
pub use loopback::{ConnectRequest, Endpoint, GatherWrite, Network, RegionHandle};

use crossbeam_channel::Receiver;

/// Completion status of a posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The operation completed.
    Success,
    /// The operation was flushed by a disconnect; ignored by convention.
    Flush,
    /// The operation failed; the connection is unusable.
    Error,
}

/// A completion event, retrieved from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The opaque id the poster attached to the operation.
    pub wr_id: u64,
    /// Outcome.
    pub status: CompletionStatus,
    /// For receive completions: the delivered 16-byte record.
    pub recv_payload: Option<[u8; 16]>,
}

/// A connection-manager event.
#[derive(Debug)]
pub enum CmEvent {
    /// The target address resolved.
    AddressResolved {
        /// Local connection index.
        conn: u16,
    },
    /// The route to the target resolved.
    RouteResolved {
        /// Local connection index.
        conn: u16,
    },
    /// An inbound connection request (listening side only).
    ConnectRequest(ConnectRequest),
    /// The connection is up.
    Established {
        /// Local connection index.
        conn: u16,
        /// Private data from the peer (reply data on the initiating side).
        private_data: Vec<u8>,
        /// The endpoint, on the initiating side (the accepting side got
        /// its endpoint from [`ConnectRequest::accept`]).
        endpoint: Option<Endpoint>,
    },
    /// The peer rejected the connection request.
    Rejected {
        /// Local connection index.
        conn: u16,
    },
    /// The connection went down.
    Disconnected {
        /// Local connection index.
        conn: u16,
    },
}

/// The receiving half of a completion queue.
pub type CompletionQueue = Receiver<Completion>;
