//! The timeslice builder: accepts one connection per input node, watches
//! the committed-component frontier, and feeds finished timeslices to the
//! chosen handoff path.
//!
//! The *red lantern* is the smallest per-input committed timeslice
//! position; every position below it has all components in place and is
//! emitted as a work item exactly once. Completions coming back from the
//! consumers advance a second frontier which is fed into the
//! per-connection acknowledgements, eventually releasing producer-side
//! space.

use crate::compute::connection::{ComputeNodeConnection, RecvOutcome};
use crate::compute::TimesliceBuffer;
use crate::error::BuildError;
use crate::params::Parameters;
use crate::transport::{
    CmEvent, Completion, CompletionStatus, ComputeNodeInfo, InputNodeInfo, Network,
};
use crate::wrid::{RequestId, Verb};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tsipc::producer::ItemProducer;
use tsipc::work_item::WorkItemRecord;
use tsipc::FINAL_ITEM_ID;
use wrapring::RingBuffer;

/// Cadence of progress reports.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// How built timeslices reach their consumers.
pub enum ItemHandoff {
    /// The named record queues, for subprocess receivers.
    Queues,
    /// An item distributor fed through its producer socket.
    Distributor(ItemProducer),
    /// No consumers: complete every item immediately (commissioning runs
    /// without workers).
    Discard(Mutex<VecDeque<u64>>),
}

impl ItemHandoff {
    /// A discarding handoff.
    pub fn discard() -> Self {
        Self::Discard(Mutex::new(VecDeque::new()))
    }

    fn publish(&self, record: &WorkItemRecord, buffer: &TimesliceBuffer) -> Result<(), BuildError> {
        match self {
            Self::Queues => buffer.publish_work_item(record),
            Self::Distributor(producer) => {
                producer.send_work_item(record.timeslice_index, &record.encode());
                Ok(())
            }
            Self::Discard(pending) => {
                pending.lock().unwrap().push_back(record.descriptor_position);
                Ok(())
            }
        }
    }

    fn try_completion(&self, buffer: &TimesliceBuffer, num_compute_nodes: u64) -> Option<u64> {
        match self {
            Self::Queues => buffer.try_completion(),
            Self::Distributor(producer) => loop {
                let id = producer.try_receive_completion()?;
                if id != FINAL_ITEM_ID {
                    // the global index maps back to the descriptor position
                    break Some(id / num_compute_nodes);
                }
            },
            Self::Discard(pending) => pending.lock().unwrap().pop_front(),
        }
    }

    fn publish_end_of_stream(&self, buffer: &TimesliceBuffer) -> Result<(), BuildError> {
        match self {
            Self::Queues => buffer.publish_end_of_stream(),
            Self::Distributor(producer) => {
                producer.send_end_of_stream();
                Ok(())
            }
            Self::Discard(_) => Ok(()),
        }
    }
}

struct CompletionTracker {
    /// Out-of-order completion window; slot `p` records `p` once position
    /// `p` was completed by a consumer.
    window: RingBuffer<u64>,
    acked: u64,
}

struct BuilderShared {
    compute_index: u64,
    num_inputs: u32,
    num_compute_nodes: u64,
    buffer: TimesliceBuffer,
    handoff: ItemHandoff,
    conns: Vec<OnceLock<Arc<ComputeNodeConnection>>>,
    completely_written: Mutex<u64>,
    completed: Mutex<CompletionTracker>,
    connections_done: AtomicUsize,
    pump_done: AtomicBool,
    stop: Arc<AtomicBool>,
}

/// One compute node's builder: a timeslice buffer and a group of
/// connections from all input nodes.
pub struct TimesliceBuilder {
    shared: Arc<BuilderShared>,
    network: Arc<Network>,
    port: u16,
    cq_tx: Sender<Completion>,
    cq_rx: Receiver<Completion>,
    cm_tx: Sender<CmEvent>,
    cm_rx: Receiver<CmEvent>,
    region_handles: Mutex<Vec<crate::transport::RegionHandle>>,
}

impl TimesliceBuilder {
    /// Creates the builder for `compute_index` over a fresh buffer.
    pub fn new(
        params: &Parameters,
        compute_index: u64,
        buffer: TimesliceBuffer,
        handoff: ItemHandoff,
        network: Arc<Network>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, BuildError> {
        let (cq_tx, cq_rx) = unbounded();
        let (cm_tx, cm_rx) = unbounded();
        let num_inputs = params.num_inputs() as u32;
        let completed = CompletionTracker {
            window: RingBuffer::new(params.cn_desc_buffer_size_exp)?,
            acked: 0,
        };
        Ok(Self {
            shared: Arc::new(BuilderShared {
                compute_index,
                num_inputs,
                num_compute_nodes: params.num_computes() as u64,
                buffer,
                handoff,
                conns: (0..num_inputs).map(|_| OnceLock::new()).collect(),
                completely_written: Mutex::new(0),
                completed: Mutex::new(completed),
                connections_done: AtomicUsize::new(0),
                pump_done: AtomicBool::new(false),
                stop,
            }),
            network,
            port: params.base_port + compute_index as u16,
            cq_tx,
            cq_rx,
            cm_tx,
            cm_rx,
            region_handles: Mutex::new(Vec::new()),
        })
    }

    /// The shared-memory identifier of this builder's buffer.
    pub fn identifier(&self) -> String {
        self.shared.buffer.identifier().to_owned()
    }

    /// The current red lantern (number of deliverable timeslices).
    pub fn red_lantern(&self) -> u64 {
        *self.shared.completely_written.lock().unwrap()
    }

    /// The number of completed (consumer-released) timeslices.
    pub fn completed(&self) -> u64 {
        self.shared.completed.lock().unwrap().acked
    }

    /// The builder thread main function: accept, assemble, drain.
    pub fn run(&self) -> Result<(), BuildError> {
        let shared = &self.shared;
        self.network.listen(self.port, self.cm_tx.clone());
        self.accept_all()?;

        let pump = {
            let shared = Arc::clone(shared);
            let cq_rx = self.cq_rx.clone();
            thread::Builder::new()
                .name(format!("cn_pump_{}", shared.compute_index))
                .spawn(move || completion_loop(&shared, &cq_rx))
                .expect("spawning completion pump")
        };

        self.assemble_loop();

        shared.pump_done.store(true, Ordering::Release);
        pump.join().expect("joining completion pump");
        self.teardown();
        info!(
            "[c{}] builder done: {} timeslices built, {} completed",
            shared.compute_index,
            self.red_lantern(),
            self.completed()
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CONNECTION MANAGEMENT
    // ---------------------------------------------------------------------

    fn accept_all(&self) -> Result<(), BuildError> {
        let shared = &self.shared;
        let mut connected = 0u32;
        while connected < shared.num_inputs {
            if shared.stop.load(Ordering::Relaxed) {
                return Err(crate::error::TransportError::Down.into());
            }
            match self.cm_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(CmEvent::ConnectRequest(request)) => self.on_connect_request(request),
                Ok(CmEvent::Established { conn, .. }) => {
                    debug!("[c{}] [{conn}] connection established", shared.compute_index);
                    connected += 1;
                }
                Ok(other) => {
                    warn!(
                        "[c{}] unexpected cm event during accept: {other:?}",
                        shared.compute_index
                    );
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(crate::error::TransportError::Down.into())
                }
            }
        }
        info!(
            "[c{}] all {} input connections up",
            shared.compute_index, shared.num_inputs
        );
        Ok(())
    }

    fn on_connect_request(&self, request: crate::transport::ConnectRequest) {
        let shared = &self.shared;
        let Some(info) = InputNodeInfo::decode(request.private_data()) else {
            error!(
                "[c{}] connect request with malformed private data",
                shared.compute_index
            );
            request.reject();
            return;
        };
        let index = u16::from(info.index);
        if u32::from(index) >= shared.num_inputs || shared.conns[index as usize].get().is_some() {
            error!(
                "[c{}] connect request for invalid input index {index}",
                shared.compute_index
            );
            request.reject();
            return;
        }

        // register this input's arena slices for remote writes
        let data_handle = self
            .network
            .register_region(shared.buffer.data_ptr(index), shared.buffer.data_bytes_per_input());
        let desc_handle = self.network.register_region(
            shared.buffer.desc_ptr(index).cast::<u8>(),
            shared.buffer.desc_bytes_per_input(),
        );
        self.region_handles
            .lock()
            .unwrap()
            .extend([data_handle, desc_handle]);

        let reply = ComputeNodeInfo {
            index: info.index,
            data_buffer_size_exp: shared.buffer.data_buffer_size_exp() as u8,
            desc_buffer_size_exp: shared.buffer.desc_buffer_size_exp() as u8,
            data_handle,
            desc_handle,
        };
        let endpoint = request.accept(index, reply.encode(), self.cq_tx.clone(), self.cm_tx.clone());
        let connection = Arc::new(ComputeNodeConnection::new(
            index,
            shared.compute_index,
            endpoint,
            shared.buffer.desc_view(index),
        ));
        debug!(
            "[c{}] [{index}] accepted connection from input {}",
            shared.compute_index, info.index
        );
        let _ = shared.conns[index as usize].set(connection);
    }

    fn teardown(&self) {
        // deregister arenas and stop listening; the named segments unlink
        // with the buffer (mappings of attached workers stay valid)
        for handle in self.region_handles.lock().unwrap().drain(..) {
            self.network.deregister_region(handle);
        }
        self.network.unlisten(self.port);
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut open = self.shared.num_inputs;
        while open > 0 && Instant::now() < deadline {
            match self.cm_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(CmEvent::Disconnected { conn }) => {
                    trace!("[c{}] [{conn}] disconnected", self.shared.compute_index);
                    open -= 1;
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    // ---------------------------------------------------------------------
    // ASSEMBLY LOOP
    // ---------------------------------------------------------------------

    fn assemble_loop(&self) {
        let shared = &self.shared;
        let mut finalized = false;
        let mut last_status = Instant::now();
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let advanced = self.handle_ts_completion();

            if !finalized && self.ready_to_finalize() {
                debug!(
                    "[c{}] drained, issuing final work item and acknowledgements",
                    shared.compute_index
                );
                if let Err(err) = shared.handoff.publish_end_of_stream(&shared.buffer) {
                    error!("[c{}] end-of-stream publish failed: {err}", shared.compute_index);
                }
                for conn in &shared.conns {
                    if let Some(conn) = conn.get() {
                        conn.send_final_ack();
                    }
                }
                finalized = true;
            }

            if shared.connections_done.load(Ordering::Acquire) == shared.num_inputs as usize {
                break;
            }
            if shared.stop.load(Ordering::Relaxed) {
                // bounded drain, then leave
                let deadline =
                    *grace_deadline.get_or_insert_with(|| Instant::now() + Duration::from_secs(5));
                if Instant::now() > deadline {
                    warn!("[c{}] abandoning drain on stop", shared.compute_index);
                    break;
                }
            }
            if last_status.elapsed() >= STATUS_INTERVAL {
                info!(
                    "[c{}] {} timeslices built, {} completed",
                    shared.compute_index,
                    self.red_lantern(),
                    self.completed()
                );
                last_status = Instant::now();
            }
            if !advanced {
                thread::sleep(Duration::from_micros(200));
            }
        }
    }

    /// Drains consumer completions into the resequencer and propagates the
    /// advanced frontier into every connection's acknowledgement.
    fn handle_ts_completion(&self) -> bool {
        let shared = &self.shared;
        let mut advanced = false;
        while let Some(position) = shared
            .handoff
            .try_completion(&shared.buffer, shared.num_compute_nodes)
        {
            let mut tracker = shared.completed.lock().unwrap();
            if position == tracker.acked {
                loop {
                    tracker.acked += 1;
                    if *tracker.window.at(tracker.acked) <= position {
                        break;
                    }
                }
            } else {
                tracker.window.write_at(position, position);
            }
            advanced = true;
        }
        if advanced {
            let acked = shared.completed.lock().unwrap().acked;
            trace!("[c{}] consumer frontier at {acked}", shared.compute_index);
            for conn in &shared.conns {
                if let Some(conn) = conn.get() {
                    conn.inc_ack_pointers(acked);
                }
            }
        }
        advanced
    }

    /// The conservative final condition: every input announced the
    /// sentinel, no acknowledgement sends are in flight, and every emitted
    /// work item has been completed by its consumers.
    fn ready_to_finalize(&self) -> bool {
        let shared = &self.shared;
        let all_final = shared
            .conns
            .iter()
            .all(|c| c.get().is_some_and(|c| c.final_received()));
        if !all_final {
            return false;
        }
        let sends_pending = shared
            .conns
            .iter()
            .any(|c| c.get().is_some_and(|c| c.sends_pending()));
        if sends_pending {
            return false;
        }
        let written = *shared.completely_written.lock().unwrap();
        let completed = shared.completed.lock().unwrap().acked;
        completed >= written
    }
}

// ---------------------------------------------------------------------
// COMPLETION PUMP
// ---------------------------------------------------------------------

fn completion_loop(shared: &Arc<BuilderShared>, cq_rx: &Receiver<Completion>) {
    loop {
        match cq_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(completion) => on_completion(shared, completion),
            Err(RecvTimeoutError::Timeout) => {
                if shared.pump_done.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.pump_done.load(Ordering::Acquire) && cq_rx.is_empty() {
            break;
        }
    }
    debug!("[c{}] completion loop done", shared.compute_index);
}

fn on_completion(shared: &Arc<BuilderShared>, completion: Completion) {
    match completion.status {
        CompletionStatus::Success => {}
        CompletionStatus::Flush => return,
        CompletionStatus::Error => {
            error!(
                "[c{}] completion error for wr_id {}",
                shared.compute_index, completion.wr_id
            );
            shared.stop.store(true, Ordering::Release);
            return;
        }
    }
    let Some(id) = RequestId::unpack(completion.wr_id) else {
        error!(
            "[c{}] completion for unknown wr_id {}",
            shared.compute_index, completion.wr_id
        );
        return;
    };
    let Some(conn) = shared.conns[id.connection as usize].get() else {
        error!(
            "[c{}] completion for unknown connection {}",
            shared.compute_index, id.connection
        );
        return;
    };
    match id.verb {
        Verb::ReceiveWritePointer => {
            let Some(payload) = completion.recv_payload else {
                error!(
                    "[c{}] receive completion without payload",
                    shared.compute_index
                );
                return;
            };
            match conn.on_complete_recv(payload) {
                RecvOutcome::Advanced => check_completely_written(shared),
                RecvOutcome::FinalReceived => {}
            }
        }
        Verb::SendAck => conn.on_complete_send(),
        Verb::SendFinalize => {
            conn.on_complete_send_finalize();
            shared.connections_done.fetch_add(1, Ordering::AcqRel);
        }
        other => {
            error!(
                "[c{}] completion for unexpected verb {other:?}",
                shared.compute_index
            );
        }
    }
}

/// Advances the red lantern and emits one work item per newly complete
/// timeslice position.
fn check_completely_written(shared: &Arc<BuilderShared>) {
    let mut red_lantern = u64::MAX;
    for conn in &shared.conns {
        let Some(conn) = conn.get() else { return };
        red_lantern = red_lantern.min(conn.write_pointer().desc);
    }

    let mut written = shared.completely_written.lock().unwrap();
    while *written < red_lantern {
        let position = *written;
        let record = WorkItemRecord {
            timeslice_index: shared.compute_index + position * shared.num_compute_nodes,
            descriptor_position: position,
            data_buffer_size_exp: shared.buffer.data_buffer_size_exp() as u8,
            desc_buffer_size_exp: shared.buffer.desc_buffer_size_exp() as u8,
            num_components: shared.num_inputs as u8,
        };
        trace!(
            "[c{}] timeslice {} complete at position {position}",
            shared.compute_index,
            record.timeslice_index
        );
        if let Err(err) = shared.handoff.publish(&record, &shared.buffer) {
            error!("[c{}] work item publish failed: {err}", shared.compute_index);
            shared.stop.store(true, Ordering::Release);
            return;
        }
        *written += 1;
    }
}
