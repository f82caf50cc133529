//! In-process message endpoints for the item distribution control plane.
//!
//! Two shapes, mirroring the original deployment's socket roles:
//!
//! - a *pair*: exclusive, bidirectional, used producer ↔ distributor;
//! - a *router*: one distributor endpoint facing many worker endpoints,
//!   each addressed by a stable identity, with connect/disconnect
//!   notifications.
//!
//! Messages are multipart (a list of byte frames). Endpoints are backed by
//! unbounded channels; a dropped peer surfaces as a disconnect rather than
//! an error on the blocking paths.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// One frame of a multipart message.
pub type Frame = Vec<u8>;
/// A multipart message.
pub type Message = Vec<Frame>;

/// Error type for socket operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The peer endpoint no longer exists.
    #[error("peer disconnected")]
    Disconnected,
    /// A routed send addressed an unknown identity.
    #[error("no connected peer with identity {0:?}")]
    UnknownPeer(String),
}

/// Builds a message from string frames.
pub fn message_from_str(text: &str) -> Message {
    vec![text.as_bytes().to_vec()]
}

/// Reads a message frame as UTF-8 text (lossy).
pub fn frame_as_str(frame: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(frame)
}

// ---------------------------------------------------------------------
// PAIR
// ---------------------------------------------------------------------

/// One side of an exclusive bidirectional message link.
pub struct PairSocket {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// Creates a connected pair of endpoints.
pub fn pair() -> (PairSocket, PairSocket) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (
        PairSocket { tx: a_tx, rx: b_rx },
        PairSocket { tx: b_tx, rx: a_rx },
    )
}

impl PairSocket {
    /// Sends a message to the peer.
    pub fn send(&self, message: Message) -> Result<(), SocketError> {
        self.tx.send(message).map_err(|_| SocketError::Disconnected)
    }

    /// Receives a message, blocking.
    pub fn recv(&self) -> Result<Message, SocketError> {
        self.rx.recv().map_err(|_| SocketError::Disconnected)
    }

    /// Receives a message if one is immediately available.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// The raw inbound channel, for `select!` composition.
    pub fn receiver(&self) -> &Receiver<Message> {
        &self.rx
    }
}

// ---------------------------------------------------------------------
// ROUTER / DEALER
// ---------------------------------------------------------------------

static CONNECTION_NONCE: AtomicU64 = AtomicU64::new(1);

/// Event arriving at a router endpoint.
#[derive(Debug)]
pub enum RouterEvent {
    /// A peer attached (or re-attached) under an identity.
    Connected {
        /// Peer identity.
        identity: String,
        /// Connection instance, to pair with a later disconnect.
        nonce: u64,
        /// Channel for messages to this peer.
        peer_tx: Sender<Message>,
    },
    /// A message from a connected peer.
    Message {
        /// Peer identity.
        identity: String,
        /// The message frames.
        message: Message,
    },
    /// A peer endpoint was dropped.
    Disconnected {
        /// Peer identity.
        identity: String,
        /// Connection instance that ended.
        nonce: u64,
    },
}

/// A peer-facing event after router bookkeeping.
#[derive(Debug)]
pub enum PeerEvent {
    /// A message from the identified peer.
    Message(String, Message),
    /// The identified peer disconnected.
    Disconnected(String),
}

/// The many-peer endpoint. Single-threaded by construction.
pub struct RouterSocket {
    events_rx: Receiver<RouterEvent>,
    peers: HashMap<String, (u64, Sender<Message>)>,
}

/// A cloneable handle peers use to attach to a router.
#[derive(Clone)]
pub struct RouterBinding {
    events_tx: Sender<RouterEvent>,
}

/// Creates a router endpoint and the binding peers connect through.
pub fn router() -> (RouterSocket, RouterBinding) {
    let (events_tx, events_rx) = unbounded();
    (
        RouterSocket {
            events_rx,
            peers: HashMap::new(),
        },
        RouterBinding { events_tx },
    )
}

impl RouterSocket {
    /// The raw event channel, for `select!` composition.
    pub fn events(&self) -> &Receiver<RouterEvent> {
        &self.events_rx
    }

    /// Folds a raw event into the peer table, surfacing peer activity.
    ///
    /// Stale disconnects (an old endpoint of a re-attached identity) are
    /// absorbed here and yield `None`.
    pub fn process(&mut self, event: RouterEvent) -> Option<PeerEvent> {
        match event {
            RouterEvent::Connected {
                identity,
                nonce,
                peer_tx,
            } => {
                self.peers.insert(identity, (nonce, peer_tx));
                None
            }
            RouterEvent::Message { identity, message } => {
                Some(PeerEvent::Message(identity, message))
            }
            RouterEvent::Disconnected { identity, nonce } => {
                match self.peers.get(&identity) {
                    Some((current, _)) if *current == nonce => {
                        self.peers.remove(&identity);
                        Some(PeerEvent::Disconnected(identity))
                    }
                    // a newer endpoint took over the identity, or the peer
                    // was already dropped from the table
                    _ => None,
                }
            }
        }
    }

    /// Sends a message to the identified peer.
    pub fn send(&self, identity: &str, message: Message) -> Result<(), SocketError> {
        let (_, peer_tx) = self
            .peers
            .get(identity)
            .ok_or_else(|| SocketError::UnknownPeer(identity.to_owned()))?;
        peer_tx
            .send(message)
            .map_err(|_| SocketError::Disconnected)
    }

    /// Drops a peer from the table without an event.
    pub fn forget(&mut self, identity: &str) {
        self.peers.remove(identity);
    }
}

/// A worker-side endpoint attached to a router under an identity.
pub struct DealerSocket {
    identity: String,
    nonce: u64,
    events_tx: Sender<RouterEvent>,
    rx: Receiver<Message>,
}

impl DealerSocket {
    /// Attaches to the router. Re-attaching an identity replaces the
    /// previous endpoint.
    pub fn connect(binding: &RouterBinding, identity: &str) -> Result<Self, SocketError> {
        let (peer_tx, rx) = unbounded();
        let nonce = CONNECTION_NONCE.fetch_add(1, Ordering::Relaxed);
        binding
            .events_tx
            .send(RouterEvent::Connected {
                identity: identity.to_owned(),
                nonce,
                peer_tx,
            })
            .map_err(|_| SocketError::Disconnected)?;
        Ok(Self {
            identity: identity.to_owned(),
            nonce,
            events_tx: binding.events_tx.clone(),
            rx,
        })
    }

    /// Sends a message to the router.
    pub fn send(&self, message: Message) -> Result<(), SocketError> {
        self.events_tx
            .send(RouterEvent::Message {
                identity: self.identity.clone(),
                message,
            })
            .map_err(|_| SocketError::Disconnected)
    }

    /// Receives a message, giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, SocketError> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SocketError::Disconnected),
        }
    }

    /// This endpoint's identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        let _ = self.events_tx.send(RouterEvent::Disconnected {
            identity: self.identity.clone(),
            nonce: self.nonce,
        });
    }
}
