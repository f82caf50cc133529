//! The worker control protocol.
//!
//! Text verbs over multipart message framing between the item distributor
//! and its workers:
//!
//! ```text
//! REGISTER <stride> <offset> <policy:0|1|2> <group_id> <client_name>
//! WORK_ITEM <id>        (optional second frame: binary payload)
//! COMPLETE <id>
//! HEARTBEAT
//! DISCONNECT
//! ```
//!
//! All non-empty fields are required; unknown prefixes are a protocol
//! violation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Identifier of a work item (the timeslice index for the fabric).
pub type ItemId = u64;

/// Sentinel item id announcing end of stream.
pub const FINAL_ITEM_ID: ItemId = ItemId::MAX;

/// Error type for protocol handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A control message did not parse.
    #[error("invalid {verb} message: {message:?}")]
    InvalidMessage {
        /// The verb that failed to parse.
        verb: &'static str,
        /// The offending message text.
        message: String,
    },
    /// A message with an unknown verb arrived.
    #[error("unknown message type: {0:?}")]
    UnknownVerb(String),
    /// A completion arrived for an item the worker does not hold.
    #[error("invalid work completion for item {0}")]
    InvalidCompletion(ItemId),
    /// The peer stopped answering heartbeats.
    #[error("connection heartbeat expired")]
    HeartbeatExpired,
    /// An unexpected extra message frame arrived.
    #[error("unexpected multipart message")]
    UnexpectedMultipart,
}

/// Queueing behavior of a worker for items it cannot take immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerQueuePolicy {
    /// Queue every matching item.
    QueueAll,
    /// Keep only the most recent matching item queued.
    PrebufferOne,
    /// Drop items that cannot be delivered immediately.
    Skip,
}

impl fmt::Display for WorkerQueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            Self::QueueAll => 0,
            Self::PrebufferOne => 1,
            Self::Skip => 2,
        };
        write!(f, "{v}")
    }
}

impl FromStr for WorkerQueuePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Self::QueueAll),
            "1" => Ok(Self::PrebufferOne),
            "2" => Ok(Self::Skip),
            _ => Err(()),
        }
    }
}

/// Registration parameters of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParameters {
    /// The worker receives item `i` iff `i % stride == offset`.
    pub stride: u64,
    /// See `stride`.
    pub offset: u64,
    /// Queueing behavior when the worker is busy.
    pub queue_policy: WorkerQueuePolicy,
    /// Workers sharing a non-zero group id share one item stream.
    pub group_id: u64,
    /// Human-readable client name.
    pub client_name: String,
}

impl WorkerParameters {
    /// Formats the REGISTER message for these parameters.
    pub fn to_register_message(&self) -> String {
        format!(
            "REGISTER {} {} {} {} {}",
            self.stride, self.offset, self.queue_policy, self.group_id, self.client_name
        )
    }

    /// Parses a REGISTER message.
    pub fn from_register_message(message: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidMessage {
            verb: "REGISTER",
            message: message.to_owned(),
        };
        let mut fields = message.split_ascii_whitespace();
        if fields.next() != Some("REGISTER") {
            return Err(invalid());
        }
        let stride: u64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let offset: u64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let queue_policy = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(invalid)?;
        let group_id: u64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let client_name = fields.collect::<Vec<_>>().join(" ");
        if stride == 0 || client_name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            stride,
            offset,
            queue_policy,
            group_id,
            client_name,
        })
    }

    /// Compact single-line description for logging.
    pub fn description(&self) -> String {
        format!(
            "{} (s{}/o{}/p{}/g{})",
            self.client_name, self.stride, self.offset, self.queue_policy, self.group_id
        )
    }
}

/// Parses a `WORK_ITEM <id>` or `COMPLETE <id>` message.
pub fn parse_id_message(verb: &'static str, message: &str) -> Result<ItemId, ProtocolError> {
    let rest = message
        .strip_prefix(verb)
        .and_then(|r| r.strip_prefix(' '))
        .ok_or_else(|| ProtocolError::InvalidMessage {
            verb,
            message: message.to_owned(),
        })?;
    rest.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidMessage {
            verb,
            message: message.to_owned(),
        })
}

/// Timing constants of the heartbeat machinery.
///
/// The defaults match production behavior; tests shorten them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTiming {
    /// Distributor poll timeout (upper bound on heartbeat latency).
    pub distributor_poll_timeout: Duration,
    /// Idle time after which the distributor pings a worker.
    pub distributor_heartbeat_interval: Duration,
    /// Worker-side poll timeout.
    pub worker_poll_timeout: Duration,
    /// Silence after which a worker declares the connection dead.
    pub worker_heartbeat_timeout: Duration,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            distributor_poll_timeout: Duration::from_millis(100),
            distributor_heartbeat_interval: Duration::from_secs(1),
            worker_poll_timeout: Duration::from_millis(100),
            worker_heartbeat_timeout: Duration::from_secs(5),
        }
    }
}
