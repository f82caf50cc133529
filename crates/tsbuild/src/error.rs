//! Error taxonomy of the fabric.
//!
//! Configuration problems are user errors and reported before anything
//! starts. Transport-local problems abort the process. Credit-protocol
//! violations indicate a peer bug and are fatal for the connection.

use thiserror::Error;

/// Invalid configuration, reported to the user at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A node list is empty.
    #[error("no {0} nodes configured")]
    EmptyNodeList(&'static str),
    /// An index does not refer to a configured node.
    #[error("{kind} index {index} out of range (have {count} nodes)")]
    IndexOutOfRange {
        /// Node kind.
        kind: &'static str,
        /// The offending index.
        index: usize,
        /// Configured node count.
        count: usize,
    },
    /// A size parameter is zero or out of range.
    #[error("invalid size parameter {name}: {value}")]
    InvalidSize {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: u64,
    },
    /// The input descriptor buffer cannot hold a single timeslice.
    #[error("descriptor buffer of 2^{desc_exp} entries cannot hold a timeslice of {needed} microslices")]
    TimesliceDoesNotFit {
        /// Configured descriptor buffer size exponent.
        desc_exp: u32,
        /// Microslices per timeslice including overlap.
        needed: u64,
    },
}

/// Failures of the remote-direct-write transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No listener at the target address.
    #[error("remote address unreachable: {0}")]
    Unreachable(String),
    /// The connection attempt was rejected too many times.
    #[error("connection rejected after {0} attempts")]
    Rejected(u32),
    /// A remote write addressed memory outside the registered region.
    #[error("remote write out of bounds: offset {offset} + len {len} > region {region_len}")]
    WriteOutOfBounds {
        /// Remote offset of the write.
        offset: u64,
        /// Total gather length.
        len: u64,
        /// Registered region length.
        region_len: u64,
    },
    /// A post referenced an unregistered memory region.
    #[error("unknown memory region handle {0}")]
    UnknownRegion(u64),
    /// The peer endpoint is gone.
    #[error("connection is down")]
    Down,
}

/// Failures of the credit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreditError {
    /// A request exceeds what the remote buffer can ever hold.
    #[error("requested space ({data} bytes, {desc} entries) exceeds buffer capacity ({data_capacity}, {desc_capacity})")]
    CreditExhausted {
        /// Requested data bytes.
        data: u64,
        /// Requested descriptor entries.
        desc: u64,
        /// Remote data capacity.
        data_capacity: u64,
        /// Remote descriptor capacity.
        desc_capacity: u64,
    },
    /// The peer acknowledged backwards on at least one axis — a peer
    /// bug, fatal.
    #[error("acknowledgement moved backwards: (data {from_data}, desc {from_desc}) -> (data {to_data}, desc {to_desc})")]
    AckRegression {
        /// Previously acknowledged data position (bytes).
        from_data: u64,
        /// Previously acknowledged descriptor position (entries).
        from_desc: u64,
        /// Offered data position (bytes).
        to_data: u64,
        /// Offered descriptor position (entries).
        to_desc: u64,
    },
}

/// Top-level error for node runs.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Credit protocol error.
    #[error(transparent)]
    Credit(#[from] CreditError),
    /// Shared-memory failure on the compute node.
    #[cfg(unix)]
    #[error(transparent)]
    Shm(#[from] tsipc::shm::ShmError),
    /// Record-queue failure on the compute node.
    #[cfg(unix)]
    #[error(transparent)]
    Queue(#[from] tsipc::queue::QueueError),
    /// Ring geometry failure.
    #[error(transparent)]
    Ring(#[from] wrapring::RingError),
}
