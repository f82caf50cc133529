//! The in-process loopback backend.
//!
//! One `Network` value is the explicit context connecting all node
//! instances of a process; there is no process-global state. Compute
//! groups register listeners by port; input groups initiate connects. A
//! successful handshake produces one [`Endpoint`] per side, both halves of
//! a shared link.
//!
//! Ordering model: a remote write is executed at post time on the
//! poster's thread, straight from the gather list into the registered
//! region. Messages posted afterwards travel through a channel, so a
//! receiver that observes a message also observes every write posted
//! before it on the same connection — which is exactly the fence
//! guarantee the commit protocol needs. Cross-connection ordering is not
//! provided (and not required).

use super::{CmEvent, Completion, CompletionStatus};
use crate::error::TransportError;
use crate::wrid::RequestId;
use crossbeam_channel::Sender;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Access handle of a registered memory region (the "remote key").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(u64);

impl RegionHandle {
    /// The raw handle value, for private-data encoding.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuilds a handle from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

struct Region {
    ptr: usize,
    len: u64,
}

/// The in-process fabric connecting node instances.
pub struct Network {
    listeners: Mutex<HashMap<u16, Sender<CmEvent>>>,
    regions: Mutex<HashMap<u64, Region>>,
    next_region: AtomicU64,
}

impl Network {
    /// Creates an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            next_region: AtomicU64::new(1),
        })
    }

    /// Registers a listener: connection requests for `port` are delivered
    /// to `cm_tx` as [`CmEvent::ConnectRequest`].
    pub fn listen(&self, port: u16, cm_tx: Sender<CmEvent>) {
        debug!("listening on port {port}");
        self.listeners.lock().unwrap().insert(port, cm_tx);
    }

    /// Removes a listener.
    pub fn unlisten(&self, port: u16) {
        self.listeners.lock().unwrap().remove(&port);
    }

    /// Registers a memory region for remote writes.
    ///
    /// # Safety contract
    ///
    /// The region must stay valid and writable until deregistered; the
    /// credit protocol is what keeps remote writers inside the slots they
    /// own.
    pub fn register_region(&self, ptr: *mut u8, len: usize) -> RegionHandle {
        let handle = RegionHandle(self.next_region.fetch_add(1, Ordering::Relaxed));
        self.regions.lock().unwrap().insert(
            handle.0,
            Region {
                ptr: ptr as usize,
                len: len as u64,
            },
        );
        handle
    }

    /// Deregisters a memory region.
    pub fn deregister_region(&self, handle: RegionHandle) {
        self.regions.lock().unwrap().remove(&handle.0);
    }

    /// Initiates a connection to `port`.
    ///
    /// Emits the resolution events, then either delivers a connect request
    /// to the listener or a [`CmEvent::Rejected`] back to the caller (no
    /// listener counts as a rejection so startup order does not matter;
    /// the attempt cap turns persistent absence into an error).
    pub fn connect(
        self: &Arc<Self>,
        port: u16,
        conn: u16,
        private_data: Vec<u8>,
        cq_tx: Sender<Completion>,
        cm_tx: Sender<CmEvent>,
    ) {
        let _ = cm_tx.send(CmEvent::AddressResolved { conn });
        let _ = cm_tx.send(CmEvent::RouteResolved { conn });

        let listener = self.listeners.lock().unwrap().get(&port).cloned();
        let request = ConnectRequest {
            network: Arc::clone(self),
            private_data,
            initiator_conn: conn,
            initiator_cq: cq_tx,
            initiator_cm: cm_tx.clone(),
        };
        match listener {
            Some(listener_tx) => {
                if listener_tx.send(CmEvent::ConnectRequest(request)).is_err() {
                    let _ = cm_tx.send(CmEvent::Rejected { conn });
                }
            }
            None => {
                trace!("no listener on port {port}, rejecting connect");
                let _ = cm_tx.send(CmEvent::Rejected { conn });
            }
        }
    }

    fn resolve_region(&self, handle: RegionHandle) -> Result<(usize, u64), TransportError> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .get(&handle.0)
            .ok_or(TransportError::UnknownRegion(handle.0))?;
        Ok((region.ptr, region.len))
    }
}

/// An inbound connection request at a listener.
pub struct ConnectRequest {
    network: Arc<Network>,
    private_data: Vec<u8>,
    initiator_conn: u16,
    initiator_cq: Sender<Completion>,
    initiator_cm: Sender<CmEvent>,
}

impl ConnectRequest {
    /// The private data carried with the request.
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Accepts the request, returning the accepting side's endpoint.
    ///
    /// `reply_private_data` is delivered to the initiator with its
    /// `Established` event, together with the other endpoint half.
    pub fn accept(
        self,
        local_conn: u16,
        reply_private_data: Vec<u8>,
        local_cq: Sender<Completion>,
        local_cm: Sender<CmEvent>,
    ) -> Endpoint {
        let link = Arc::new(LinkState {
            a_to_b: MsgDir::new(local_cq.clone()),
            b_to_a: MsgDir::new(self.initiator_cq.clone()),
            closed: AtomicBool::new(false),
        });

        let initiator_endpoint = Endpoint {
            network: Arc::clone(&self.network),
            link: Arc::clone(&link),
            is_initiator: true,
            local_cq: self.initiator_cq,
            local_cm: self.initiator_cm.clone(),
            peer_cm: local_cm.clone(),
            local_conn: self.initiator_conn,
            peer_conn: local_conn,
        };
        let acceptor_endpoint = Endpoint {
            network: self.network,
            link,
            is_initiator: false,
            local_cq,
            local_cm: local_cm.clone(),
            peer_cm: self.initiator_cm.clone(),
            local_conn,
            peer_conn: self.initiator_conn,
        };

        let _ = self.initiator_cm.send(CmEvent::Established {
            conn: self.initiator_conn,
            private_data: reply_private_data,
            endpoint: Some(initiator_endpoint),
        });
        let _ = local_cm.send(CmEvent::Established {
            conn: local_conn,
            private_data: Vec::new(),
            endpoint: None,
        });
        acceptor_endpoint
    }

    /// Rejects the request; the initiator receives [`CmEvent::Rejected`].
    pub fn reject(self) {
        let _ = self.initiator_cm.send(CmEvent::Rejected {
            conn: self.initiator_conn,
        });
    }
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("initiator_conn", &self.initiator_conn)
            .field("private_data_len", &self.private_data.len())
            .finish_non_exhaustive()
    }
}

struct DirState {
    queued: VecDeque<[u8; 16]>,
    recvs: VecDeque<u64>,
}

struct MsgDir {
    inner: Mutex<DirState>,
    receiver_cq: Sender<Completion>,
}

impl MsgDir {
    fn new(receiver_cq: Sender<Completion>) -> Self {
        Self {
            inner: Mutex::new(DirState {
                queued: VecDeque::new(),
                recvs: VecDeque::new(),
            }),
            receiver_cq,
        }
    }

    /// Sender side: deliver to an armed receive or park the message.
    fn deliver(&self, payload: [u8; 16]) {
        let mut state = self.inner.lock().unwrap();
        if let Some(wr_id) = state.recvs.pop_front() {
            drop(state);
            let _ = self.receiver_cq.send(Completion {
                wr_id,
                status: CompletionStatus::Success,
                recv_payload: Some(payload),
            });
        } else {
            // receiver-not-ready: hold until a receive is armed
            state.queued.push_back(payload);
        }
    }

    /// Receiver side: arm a receive, consuming a parked message if any.
    fn arm(&self, wr_id: u64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(payload) = state.queued.pop_front() {
            drop(state);
            let _ = self.receiver_cq.send(Completion {
                wr_id,
                status: CompletionStatus::Success,
                recv_payload: Some(payload),
            });
        } else {
            state.recvs.push_back(wr_id);
        }
    }
}

struct LinkState {
    /// Messages initiator -> acceptor.
    a_to_b: MsgDir,
    /// Messages acceptor -> initiator.
    b_to_a: MsgDir,
    closed: AtomicBool,
}

/// One gather write of a chain posted with
/// [`Endpoint::post_write_chain`].
pub struct GatherWrite<'a> {
    /// Opaque completion id.
    pub wr_id: u64,
    /// Target region.
    pub region: RegionHandle,
    /// Byte offset within the target region.
    pub remote_offset: u64,
    /// Gather list; segments land back to back at the remote offset.
    pub segments: Vec<&'a [u8]>,
    /// Whether a completion is generated for this write.
    pub signaled: bool,
    /// Whether all prior writes of the chain must be visible first
    /// (trivially satisfied here: the chain executes in order).
    pub fence: bool,
}

/// One side of an established connection.
pub struct Endpoint {
    network: Arc<Network>,
    link: Arc<LinkState>,
    is_initiator: bool,
    local_cq: Sender<Completion>,
    local_cm: Sender<CmEvent>,
    peer_cm: Sender<CmEvent>,
    local_conn: u16,
    peer_conn: u16,
}

impl Endpoint {
    /// The local connection index this endpoint reports events under.
    pub fn conn_index(&self) -> u16 {
        self.local_conn
    }

    fn outbound(&self) -> &MsgDir {
        if self.is_initiator {
            &self.link.a_to_b
        } else {
            &self.link.b_to_a
        }
    }

    fn inbound(&self) -> &MsgDir {
        if self.is_initiator {
            &self.link.b_to_a
        } else {
            &self.link.a_to_b
        }
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::Acquire)
    }

    fn flush_completion(&self, wr_id: u64) {
        let _ = self.local_cq.send(Completion {
            wr_id,
            status: CompletionStatus::Flush,
            recv_payload: None,
        });
    }

    /// Posts a 16-byte message send.
    pub fn post_send(&self, wr_id: u64, payload: [u8; 16], signaled: bool) {
        if self.is_closed() {
            if signaled {
                self.flush_completion(wr_id);
            }
            return;
        }
        if let Some(id) = RequestId::unpack(wr_id) {
            trace!(
                "[{}] post send {:?} (conn {})",
                self.local_conn,
                id.verb,
                id.connection
            );
        }
        self.outbound().deliver(payload);
        if signaled {
            let _ = self.local_cq.send(Completion {
                wr_id,
                status: CompletionStatus::Success,
                recv_payload: None,
            });
        }
    }

    /// Arms a 16-byte message receive.
    pub fn post_recv(&self, wr_id: u64) {
        if self.is_closed() {
            self.flush_completion(wr_id);
            return;
        }
        self.inbound().arm(wr_id);
    }

    /// Posts a chain of remote writes.
    ///
    /// Writes execute in order on this thread; each signaled write yields
    /// a completion on the poster's queue. The receiving side learns of
    /// the data only through a subsequent message (the commit protocol).
    pub fn post_write_chain(&self, chain: &[GatherWrite<'_>]) -> Result<(), TransportError> {
        if self.is_closed() {
            for write in chain {
                if write.signaled {
                    self.flush_completion(write.wr_id);
                }
            }
            return Ok(());
        }
        for write in chain {
            let (ptr, region_len) = self.network.resolve_region(write.region)?;
            let total: u64 = write.segments.iter().map(|s| s.len() as u64).sum();
            if write.remote_offset + total > region_len {
                warn!(
                    "[{}] write chain out of bounds (verb {:?})",
                    self.local_conn,
                    RequestId::unpack(write.wr_id).map(|id| id.verb)
                );
                return Err(TransportError::WriteOutOfBounds {
                    offset: write.remote_offset,
                    len: total,
                    region_len,
                });
            }
            let mut offset = write.remote_offset as usize;
            for segment in &write.segments {
                // SAFETY: the region registration contract guarantees
                // ptr..ptr+region_len stays valid; bounds were checked
                // above; the credit protocol excludes concurrent readers
                // of these slots.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        segment.as_ptr(),
                        (ptr as *mut u8).add(offset),
                        segment.len(),
                    );
                }
                offset += segment.len();
            }
            if write.signaled {
                let _ = self.local_cq.send(Completion {
                    wr_id: write.wr_id,
                    status: CompletionStatus::Success,
                    recv_payload: None,
                });
            }
        }
        Ok(())
    }

    /// Initiates disconnection; both sides receive `Disconnected`.
    pub fn disconnect(&self) {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("[{}] disconnect", self.local_conn);
        let _ = self.peer_cm.send(CmEvent::Disconnected {
            conn: self.peer_conn,
        });
        let _ = self.local_cm.send(CmEvent::Disconnected {
            conn: self.local_conn,
        });
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_conn", &self.local_conn)
            .field("peer_conn", &self.peer_conn)
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn handshake(
        network: &Arc<Network>,
    ) -> (
        Endpoint,
        Endpoint,
        crossbeam_channel::Receiver<Completion>,
        crossbeam_channel::Receiver<Completion>,
    ) {
        let (input_cq_tx, input_cq_rx) = unbounded();
        let (input_cm_tx, input_cm_rx) = unbounded();
        let (compute_cq_tx, compute_cq_rx) = unbounded();
        let (compute_cm_tx, compute_cm_rx) = unbounded();

        network.listen(9000, compute_cm_tx.clone());
        network.connect(9000, 0, vec![42], input_cq_tx, input_cm_tx);

        // initiator sees resolution events first
        assert!(matches!(
            input_cm_rx.recv().unwrap(),
            CmEvent::AddressResolved { conn: 0 }
        ));
        assert!(matches!(
            input_cm_rx.recv().unwrap(),
            CmEvent::RouteResolved { conn: 0 }
        ));

        let request = match compute_cm_rx.recv().unwrap() {
            CmEvent::ConnectRequest(request) => request,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(request.private_data(), &[42]);
        let compute_end = request.accept(5, vec![7, 7], compute_cq_tx, compute_cm_tx);

        let input_end = match input_cm_rx.recv().unwrap() {
            CmEvent::Established {
                conn: 0,
                private_data,
                endpoint: Some(endpoint),
            } => {
                assert_eq!(private_data, vec![7, 7]);
                endpoint
            }
            other => panic!("unexpected event: {other:?}"),
        };
        (input_end, compute_end, input_cq_rx, compute_cq_rx)
    }

    #[test]
    fn test_handshake_and_messages() {
        let network = Network::new();
        let (input_end, compute_end, input_cq, compute_cq) = handshake(&network);

        // armed receive gets the message with its own wr_id
        compute_end.post_recv(701);
        input_end.post_send(401, [9u8; 16], true);

        let send_completion = input_cq.recv().unwrap();
        assert_eq!(send_completion.wr_id, 401);
        assert_eq!(send_completion.status, CompletionStatus::Success);

        let recv_completion = compute_cq.recv().unwrap();
        assert_eq!(recv_completion.wr_id, 701);
        assert_eq!(recv_completion.recv_payload, Some([9u8; 16]));
    }

    #[test]
    fn test_message_parks_until_receive_armed() {
        let network = Network::new();
        let (input_end, compute_end, _input_cq, compute_cq) = handshake(&network);

        input_end.post_send(1, [1u8; 16], false);
        assert!(compute_cq.is_empty());
        compute_end.post_recv(2);
        assert_eq!(compute_cq.recv().unwrap().recv_payload, Some([1u8; 16]));
    }

    #[test]
    fn test_remote_write_lands_in_region() {
        let network = Network::new();
        let (input_end, _compute_end, input_cq, _compute_cq) = handshake(&network);

        let mut arena = vec![0u8; 64];
        let handle = network.register_region(arena.as_mut_ptr(), arena.len());

        let payload_a = [1u8, 2, 3];
        let payload_b = [4u8, 5];
        input_end
            .post_write_chain(&[
                GatherWrite {
                    wr_id: 10,
                    region: handle,
                    remote_offset: 8,
                    segments: vec![&payload_a, &payload_b],
                    signaled: false,
                    fence: false,
                },
                GatherWrite {
                    wr_id: 11,
                    region: handle,
                    remote_offset: 32,
                    segments: vec![&payload_b],
                    signaled: true,
                    fence: true,
                },
            ])
            .unwrap();

        assert_eq!(&arena[8..13], &[1, 2, 3, 4, 5]);
        assert_eq!(&arena[32..34], &[4, 5]);
        let completion = input_cq.recv().unwrap();
        assert_eq!(completion.wr_id, 11);
    }

    #[test]
    fn test_write_out_of_bounds_rejected() {
        let network = Network::new();
        let (input_end, _compute_end, _input_cq, _compute_cq) = handshake(&network);

        let mut arena = vec![0u8; 16];
        let handle = network.register_region(arena.as_mut_ptr(), arena.len());
        let payload = [0u8; 8];
        let result = input_end.post_write_chain(&[GatherWrite {
            wr_id: 1,
            region: handle,
            remote_offset: 12,
            segments: vec![&payload],
            signaled: false,
            fence: false,
        }]);
        assert!(matches!(
            result,
            Err(TransportError::WriteOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_no_listener_is_rejected() {
        let network = Network::new();
        let (cq_tx, _cq_rx) = unbounded();
        let (cm_tx, cm_rx) = unbounded();
        network.connect(9999, 3, vec![], cq_tx, cm_tx);
        // resolution events, then the rejection
        assert!(matches!(cm_rx.recv().unwrap(), CmEvent::AddressResolved { .. }));
        assert!(matches!(cm_rx.recv().unwrap(), CmEvent::RouteResolved { .. }));
        assert!(matches!(cm_rx.recv().unwrap(), CmEvent::Rejected { conn: 3 }));
    }

    #[test]
    fn test_disconnect_flushes_posts() {
        let network = Network::new();
        let (input_end, compute_end, input_cq, _compute_cq) = handshake(&network);

        input_end.disconnect();
        input_end.post_send(55, [0u8; 16], true);
        let completion = input_cq.recv().unwrap();
        assert_eq!(completion.wr_id, 55);
        assert_eq!(completion.status, CompletionStatus::Flush);

        // the peer also observes the closed link
        compute_end.post_recv(66);
        // no delivery will happen; nothing to assert beyond no panic
    }
}
