//! The input channel sender: drives the build loop of one input node
//! across all compute nodes.
//!
//! Thread layout (per input node): the data source's producer thread, the
//! sender main thread running [`InputChannelSender::run`], and a
//! completion pump draining the group's completion queue. Connection
//! management happens on the main thread before and after the build loop.

use crate::error::{BuildError, TransportError};
use crate::input::InputChannelConnection;
use crate::params::Parameters;
use crate::source::DataSource;
use crate::transport::{
    CmEvent, Completion, CompletionStatus, InputNodeInfo, Network,
};
use crate::wrid::{RequestId, Verb};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam_utils::Backoff;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tsipc::desc::MicrosliceDescriptor;
use wrapring::RingBuffer;

/// Upper bound on send work requests per connection queue.
const MAX_SEND_WR: u32 = 8000;
/// Completion queue depth of one connection group.
const NUM_CQE: u32 = 8192;
/// Bounded connection-establishment retries.
const MAX_CONNECT_ATTEMPTS: u32 = 7;
/// Cadence of periodic write-pointer synchronization.
const SYNC_INTERVAL: Duration = Duration::from_millis(10);
/// Cadence of progress reports.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

struct AckTracker {
    /// Out-of-order completion window; slot `t` records `t` once the
    /// descriptor write of timeslice `t` completed.
    window: RingBuffer<u64>,
    acked_desc: u64,
    acked_data: u64,
    cached_acked_desc: u64,
    cached_acked_data: u64,
}

struct SenderShared {
    input_index: u64,
    timeslice_size: u32,
    max_timeslice_number: u64,
    min_acked_desc: u64,
    min_acked_data: u64,
    data_source: Arc<dyn DataSource>,
    conns: Vec<InputChannelConnection>,
    ack: Mutex<AckTracker>,
    connections_done: AtomicUsize,
    all_done: AtomicBool,
    done_lock: Mutex<bool>,
    done_cond: Condvar,
    stop: Arc<AtomicBool>,
}

/// One input node's sender: an input ring, a data source, and a group of
/// timeslice-building connections to all compute nodes.
pub struct InputChannelSender {
    shared: Arc<SenderShared>,
    network: Arc<Network>,
    params: Parameters,
    cq_tx: Sender<Completion>,
    cq_rx: Receiver<Completion>,
    cm_tx: Sender<CmEvent>,
    cm_rx: Receiver<CmEvent>,
}

impl InputChannelSender {
    /// Creates the sender for `input_index` over an established data
    /// source.
    pub fn new(
        params: &Parameters,
        input_index: u64,
        data_source: Arc<dyn DataSource>,
        network: Arc<Network>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, BuildError> {
        let num_computes = params.num_computes() as u32;
        // limit pending write chains so neither the send queue nor the
        // shared completion queue can overflow
        let max_pending_write_requests =
            ((MAX_SEND_WR - 1) / 3).min((NUM_CQE - 1) / num_computes.max(1));

        let conns = (0..params.num_computes() as u16)
            .map(|index| {
                InputChannelConnection::new(
                    index,
                    input_index,
                    params.cn_data_buffer_size_exp,
                    params.cn_desc_buffer_size_exp,
                    max_pending_write_requests,
                )
            })
            .collect();

        let window_size =
            data_source.desc_buffer().size() / params.timeslice_size as usize + 1;
        let ack = AckTracker {
            window: RingBuffer::with_minimum_size(window_size)?,
            acked_desc: 0,
            acked_data: 0,
            cached_acked_desc: 0,
            cached_acked_data: 0,
        };

        let (cq_tx, cq_rx) = unbounded();
        let (cm_tx, cm_rx) = unbounded();
        Ok(Self {
            shared: Arc::new(SenderShared {
                input_index,
                timeslice_size: params.timeslice_size,
                max_timeslice_number: params.max_timeslice_number,
                min_acked_desc: data_source.desc_buffer().size() as u64 / 4,
                min_acked_data: data_source.data_buffer().bytes() as u64 / 4,
                data_source,
                conns,
                ack: Mutex::new(ack),
                connections_done: AtomicUsize::new(0),
                all_done: AtomicBool::new(false),
                done_lock: Mutex::new(false),
                done_cond: Condvar::new(),
                stop,
            }),
            network,
            params: params.clone(),
            cq_tx,
            cq_rx,
            cm_tx,
            cm_rx,
        })
    }

    /// The sender thread main function: connect, build, finalize, drain,
    /// disconnect.
    pub fn run(&self) -> Result<(), BuildError> {
        let shared = &self.shared;
        self.connect_all()?;

        let pump = {
            let shared = Arc::clone(shared);
            let cq_rx = self.cq_rx.clone();
            thread::Builder::new()
                .name(format!("in_pump_{}", shared.input_index))
                .spawn(move || completion_loop(&shared, &cq_rx))
                .expect("spawning completion pump")
        };

        let time_begin = Instant::now();
        let loop_result = self.sender_loop();
        debug!("[i{}] sender loop done", shared.input_index);

        for conn in &shared.conns {
            conn.finalize();
        }
        if loop_result.is_err() {
            // no orderly handshake on a failed run; release the pump
            shared.all_done.store(true, Ordering::Release);
            let mut flag = shared.done_lock.lock().unwrap();
            *flag = true;
            shared.done_cond.notify_all();
            drop(flag);
        }
        self.wait_all_done();
        let runtime = time_begin.elapsed();

        for conn in &shared.conns {
            conn.disconnect();
        }
        self.drain_disconnects();
        pump.join().expect("joining completion pump");

        self.summary(runtime);
        loop_result
    }

    // ---------------------------------------------------------------------
    // CONNECTION MANAGEMENT
    // ---------------------------------------------------------------------

    fn connect_all(&self) -> Result<(), BuildError> {
        let shared = &self.shared;
        let num = shared.conns.len();
        let mut attempts = vec![0u32; num];
        for index in 0..num as u16 {
            self.initiate_connect(index);
        }

        let mut connected = 0usize;
        while connected < num {
            if shared.stop.load(Ordering::Relaxed) {
                return Err(TransportError::Down.into());
            }
            let event = match self.cm_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Down.into()),
            };
            match event {
                CmEvent::AddressResolved { conn } | CmEvent::RouteResolved { conn } => {
                    trace!("[i{}] [{conn}] resolution event", shared.input_index);
                }
                CmEvent::Established {
                    conn,
                    private_data,
                    endpoint: Some(endpoint),
                } => {
                    shared.conns[conn as usize].on_established(endpoint, &private_data);
                    connected += 1;
                }
                CmEvent::Rejected { conn } => {
                    attempts[conn as usize] += 1;
                    if attempts[conn as usize] >= MAX_CONNECT_ATTEMPTS {
                        return Err(TransportError::Rejected(attempts[conn as usize]).into());
                    }
                    debug!(
                        "[i{}] [{conn}] connect rejected, retrying",
                        shared.input_index
                    );
                    thread::sleep(Duration::from_millis(20));
                    self.initiate_connect(conn);
                }
                other => {
                    warn!(
                        "[i{}] unexpected cm event during connect: {other:?}",
                        shared.input_index
                    );
                }
            }
        }
        info!(
            "[i{}] connected to {num} compute nodes",
            shared.input_index
        );
        Ok(())
    }

    fn initiate_connect(&self, index: u16) {
        let info = InputNodeInfo {
            index: self.shared.input_index as u8,
        };
        self.network.connect(
            self.params.base_port + index,
            index,
            info.encode(),
            self.cq_tx.clone(),
            self.cm_tx.clone(),
        );
    }

    fn drain_disconnects(&self) {
        let mut open = self.shared.conns.len();
        let deadline = Instant::now() + Duration::from_secs(1);
        while open > 0 && Instant::now() < deadline {
            match self.cm_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(CmEvent::Disconnected { conn }) => {
                    trace!("[i{}] [{conn}] disconnected", self.shared.input_index);
                    open -= 1;
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    // ---------------------------------------------------------------------
    // BUILD LOOP
    // ---------------------------------------------------------------------

    fn sender_loop(&self) -> Result<(), BuildError> {
        let shared = &self.shared;
        let mut timeslice = 0u64;
        let mut previous_desc_idx = 0u64;
        let mut backoff = Backoff::new();
        let mut last_sync = Instant::now();
        let mut last_status = Instant::now();

        while timeslice < shared.max_timeslice_number {
            if shared.stop.load(Ordering::Relaxed) {
                info!("[i{}] stop requested", shared.input_index);
                break;
            }
            if last_sync.elapsed() >= SYNC_INTERVAL {
                for conn in &shared.conns {
                    conn.try_sync_buffer_positions();
                }
                last_sync = Instant::now();
            }
            if last_status.elapsed() >= STATUS_INTERVAL {
                self.report_status(timeslice);
                last_status = Instant::now();
            }

            if self.try_send_timeslice(timeslice, &mut previous_desc_idx)? {
                timeslice += 1;
                backoff.reset();
            } else if backoff.is_completed() {
                thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }

    /// Attempts to post timeslice `timeslice`; false means try again.
    fn try_send_timeslice(
        &self,
        timeslice: u64,
        previous_desc_idx: &mut u64,
    ) -> Result<bool, BuildError> {
        let shared = &self.shared;
        let desc_buffer = shared.data_source.desc_buffer();
        let desc_offset = timeslice * u64::from(shared.timeslice_size);
        let desc_length = u64::from(shared.timeslice_size) + u64::from(self.params.overlap_size);

        // the timeslice is complete once the descriptor one past its end
        // carries a fresh index (the source writes in order)
        let bound_desc = *desc_buffer.at(desc_offset + desc_length);
        if bound_desc.idx <= *previous_desc_idx {
            return Ok(false);
        }

        let data_offset = desc_buffer.at(desc_offset).offset;
        let data_end = bound_desc.offset;
        debug_assert!(data_end >= data_offset);
        let data_length = data_end - data_offset;
        let total_length =
            data_length + desc_length * std::mem::size_of::<MicrosliceDescriptor>() as u64;

        let cn = (timeslice % shared.conns.len() as u64) as usize;
        let conn = &shared.conns[cn];

        if !conn.write_request_available() {
            return Ok(false);
        }

        let skip = conn.skip_required(total_length);
        let total_length = total_length + skip;

        if !conn.check_for_buffer_space(total_length, 1)? {
            return Ok(false);
        }

        *previous_desc_idx = bound_desc.idx;

        trace!(
            "[i{}] sender working on timeslice {timeslice}, descs {desc_offset}..{}, bytes {data_offset}..{data_end}",
            shared.input_index,
            desc_offset + desc_length - 1
        );

        self.post_send_data(
            timeslice,
            cn,
            desc_offset,
            desc_length,
            data_offset,
            data_length,
            skip,
        )?;
        conn.inc_write_pointers(total_length, 1);
        Ok(true)
    }

    /// Builds the gather list (split around the input ring wraps) and
    /// posts the write chain.
    #[allow(clippy::too_many_arguments)]
    fn post_send_data(
        &self,
        timeslice: u64,
        cn: usize,
        desc_offset: u64,
        desc_length: u64,
        data_offset: u64,
        data_length: u64,
        skip: u64,
    ) -> Result<(), TransportError> {
        let shared = &self.shared;
        let data_ring = shared.data_source.data_buffer();
        let desc_ring = shared.data_source.desc_buffer();

        // payload: one chunk, or two around the data-arena wrap
        let mut data_segments: Vec<&[u8]> = Vec::with_capacity(2);
        if data_length > 0 {
            let first = (data_length as usize).min(data_ring.contiguous_len(data_offset));
            data_segments.push(data_ring.slice(data_offset, first));
            if (first as u64) < data_length {
                data_segments
                    .push(data_ring.slice(data_offset + first as u64, (data_length - first as u64) as usize));
            }
        }

        // descriptor table: one chunk, or two around the descriptor-arena
        // wrap
        let mut desc_segments: Vec<&[u8]> = Vec::with_capacity(2);
        let first = (desc_length as usize).min(desc_ring.contiguous_len(desc_offset));
        desc_segments.push(descriptor_bytes(desc_ring.slice(desc_offset, first)));
        if (first as u64) < desc_length {
            desc_segments.push(descriptor_bytes(desc_ring.slice(
                desc_offset + first as u64,
                (desc_length - first as u64) as usize,
            )));
        }

        shared.conns[cn].send_data(
            &data_segments,
            &desc_segments,
            timeslice,
            desc_length,
            data_length,
            skip,
        )
    }

    // ---------------------------------------------------------------------
    // SHUTDOWN & REPORTING
    // ---------------------------------------------------------------------

    fn wait_all_done(&self) {
        let shared = &self.shared;
        let mut done = shared.done_lock.lock().unwrap();
        let abandon_after = Instant::now() + Duration::from_secs(10);
        while !*done {
            if shared.stop.load(Ordering::Relaxed) && Instant::now() > abandon_after {
                warn!(
                    "[i{}] abandoning finalize handshake",
                    shared.input_index
                );
                shared.all_done.store(true, Ordering::Release);
                break;
            }
            let (guard, _) = shared
                .done_cond
                .wait_timeout(done, Duration::from_millis(100))
                .unwrap();
            done = guard;
        }
    }

    fn report_status(&self, timeslice: u64) {
        let ack = self.shared.ack.lock().unwrap();
        info!(
            "[i{}] sender at timeslice {timeslice}, {} acked descs, {} acked ts",
            self.shared.input_index,
            ack.acked_desc,
            ack.acked_desc / u64::from(self.shared.timeslice_size)
        );
    }

    fn summary(&self, runtime: Duration) {
        let shared = &self.shared;
        let bytes: u64 = shared.conns.iter().map(|c| c.total_bytes_sent()).sum();
        let requests: u64 = shared.conns.iter().map(|c| c.send_requests()).sum();
        let rate = bytes as f64 / runtime.as_secs_f64().max(f64::EPSILON) / 1e6;
        info!(
            "[i{}] summary: {bytes} bytes sent in {} requests ({rate:.1} MB/s)",
            shared.input_index, requests
        );
    }
}

/// Reinterprets a microslice descriptor slice as raw bytes for gathering.
fn descriptor_bytes(descs: &[MicrosliceDescriptor]) -> &[u8] {
    // SAFETY: MicrosliceDescriptor is a padding-free repr(C) struct.
    unsafe {
        std::slice::from_raw_parts(
            descs.as_ptr().cast::<u8>(),
            std::mem::size_of_val(descs),
        )
    }
}

// ---------------------------------------------------------------------
// COMPLETION PUMP
// ---------------------------------------------------------------------

fn completion_loop(shared: &Arc<SenderShared>, cq_rx: &Receiver<Completion>) {
    loop {
        match cq_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(completion) => on_completion(shared, completion),
            Err(RecvTimeoutError::Timeout) => {
                if shared.all_done.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.all_done.load(Ordering::Acquire) && cq_rx.is_empty() {
            break;
        }
    }
    debug!("[i{}] completion loop done", shared.input_index);
}

fn on_completion(shared: &Arc<SenderShared>, completion: Completion) {
    match completion.status {
        CompletionStatus::Success => {}
        // flushed work requests of a disconnecting connection
        CompletionStatus::Flush => return,
        CompletionStatus::Error => {
            error!(
                "[i{}] completion error for wr_id {}",
                shared.input_index, completion.wr_id
            );
            shared.stop.store(true, Ordering::Release);
            return;
        }
    }
    let Some(id) = RequestId::unpack(completion.wr_id) else {
        error!(
            "[i{}] completion for unknown wr_id {}",
            shared.input_index, completion.wr_id
        );
        return;
    };
    match id.verb {
        Verb::WriteDesc => {
            shared.conns[id.connection as usize].on_complete_write();
            ack_timeslice(shared, id.timeslice);
        }
        Verb::ReceiveAck => {
            let Some(payload) = completion.recv_payload else {
                error!("[i{}] receive completion without payload", shared.input_index);
                return;
            };
            match shared.conns[id.connection as usize].on_complete_recv(payload) {
                Ok(true) => {
                    let done = shared.connections_done.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(
                        "[i{}] [{}] final ack, {done}/{} connections done",
                        shared.input_index,
                        id.connection,
                        shared.conns.len()
                    );
                    if done == shared.conns.len() {
                        shared.all_done.store(true, Ordering::Release);
                        let mut flag = shared.done_lock.lock().unwrap();
                        *flag = true;
                        shared.done_cond.notify_all();
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    // peer bug, unrecoverable
                    error!("[i{}] credit protocol violation: {err}", shared.input_index);
                    shared.stop.store(true, Ordering::Release);
                }
            }
        }
        Verb::SendWritePointer => {}
        other => {
            error!(
                "[i{}] completion for unexpected verb {other:?}",
                shared.input_index
            );
        }
    }
}

/// Advances the contiguous-acknowledged frontier with timeslice `ts` and
/// releases input-ring space to the data source in hysteresis batches.
fn ack_timeslice(shared: &Arc<SenderShared>, ts: u64) {
    let timeslice_size = u64::from(shared.timeslice_size);
    let mut tracker = shared.ack.lock().unwrap();

    let mut acked_ts = tracker.acked_desc / timeslice_size;
    if ts == acked_ts {
        loop {
            acked_ts += 1;
            if *tracker.window.at(acked_ts) <= ts {
                break;
            }
        }
    } else {
        tracker.window.write_at(ts, ts);
    }

    tracker.acked_data = shared
        .data_source
        .desc_buffer()
        .at(acked_ts * timeslice_size)
        .offset;
    tracker.acked_desc = acked_ts * timeslice_size;

    if tracker.acked_data >= tracker.cached_acked_data + shared.min_acked_data
        || tracker.acked_desc >= tracker.cached_acked_desc + shared.min_acked_desc
    {
        tracker.cached_acked_data = tracker.acked_data;
        tracker.cached_acked_desc = tracker.acked_desc;
        let (data, desc) = (tracker.acked_data, tracker.acked_desc);
        drop(tracker);
        shared.data_source.update_ack_pointers(data, desc);
        trace!(
            "[i{}] released source space: data={data} desc={desc}",
            shared.input_index
        );
    }
}
