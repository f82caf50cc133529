//! The item worker client.
//!
//! A worker attaches to the distributor's router endpoint, registers its
//! parameters, and consumes work items through the blocking
//! [`ItemWorker::get`]. Completions are reported implicitly: dropping a
//! [`WorkerItem`] queues a `COMPLETE`, which is flushed on the next `get`.
//!
//! On connection loss, a missed heartbeat, or a protocol violation, the
//! worker tears its endpoint down, reconnects, re-registers and flushes
//! the queued completions.

use crate::itemproto::{
    parse_id_message, ItemId, ProtocolError, ProtocolTiming, WorkerParameters, FINAL_ITEM_ID,
};
use crate::socket::{frame_as_str, message_from_str, DealerSocket, RouterBinding};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};
use std::time::Instant;

/// A work item held by a worker; dropping it completes the item.
pub struct WorkerItem {
    id: ItemId,
    payload: Vec<u8>,
    completed_tx: Sender<ItemId>,
}

impl WorkerItem {
    /// The item id.
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// The optional binary payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Drop for WorkerItem {
    fn drop(&mut self) {
        let _ = self.completed_tx.send(self.id);
    }
}

/// Blocking client of the item distributor.
pub struct ItemWorker {
    binding: RouterBinding,
    identity: String,
    parameters: WorkerParameters,
    timing: ProtocolTiming,
    socket: Option<DealerSocket>,
    completed_tx: Sender<ItemId>,
    completed_rx: Receiver<ItemId>,
    last_heartbeat: Instant,
    stopped: bool,
}

impl ItemWorker {
    /// Creates a worker and connects it immediately.
    pub fn new(
        binding: RouterBinding,
        identity: &str,
        parameters: WorkerParameters,
        timing: ProtocolTiming,
    ) -> Self {
        let (completed_tx, completed_rx) = unbounded();
        let mut worker = Self {
            binding,
            identity: identity.to_owned(),
            parameters,
            timing,
            socket: None,
            completed_tx,
            completed_rx,
            last_heartbeat: Instant::now(),
            stopped: false,
        };
        worker.connect();
        worker
    }

    /// The registration parameters.
    pub fn parameters(&self) -> &WorkerParameters {
        &self.parameters
    }

    /// Stops the worker; subsequent `get` calls return `None`.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Returns the next work item, blocking, or `None` at end of stream.
    pub fn get(&mut self) -> Option<WorkerItem> {
        while !self.stopped {
            if self.socket.is_none() {
                self.connect();
            }
            match self.poll_once() {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(err) => {
                    error!("protocol error: {err}");
                    self.teardown();
                }
            }
        }
        None
    }

    fn poll_once(&mut self) -> Result<Option<WorkerItem>, ProtocolError> {
        self.send_pending_completions();

        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        match socket.recv_timeout(self.timing.worker_poll_timeout) {
            Ok(Some(message)) => {
                self.reset_heartbeat_time();
                let text = message
                    .first()
                    .map(|frame| frame_as_str(frame).into_owned())
                    .unwrap_or_default();

                if text.starts_with("WORK_ITEM ") {
                    let id = parse_id_message("WORK_ITEM", &text)?;
                    if id == FINAL_ITEM_ID {
                        debug!("worker {} reached end of stream", self.identity);
                        self.stopped = true;
                        return Ok(None);
                    }
                    let payload = message.get(1).cloned().unwrap_or_default();
                    return Ok(Some(WorkerItem {
                        id,
                        payload,
                        completed_tx: self.completed_tx.clone(),
                    }));
                }
                if message.len() > 1 {
                    return Err(ProtocolError::UnexpectedMultipart);
                }
                if text.starts_with("HEARTBEAT") {
                    self.send_heartbeat();
                    Ok(None)
                } else if text.starts_with("DISCONNECT") {
                    debug!("worker {} disconnected by distributor", self.identity);
                    self.socket = None;
                    Ok(None)
                } else {
                    Err(ProtocolError::UnknownVerb(text))
                }
            }
            Ok(None) => {
                if self.heartbeat_is_expired() {
                    return Err(ProtocolError::HeartbeatExpired);
                }
                Ok(None)
            }
            Err(_) => {
                // distributor gone for good
                self.stopped = true;
                Ok(None)
            }
        }
    }

    fn connect(&mut self) {
        match DealerSocket::connect(&self.binding, &self.identity) {
            Ok(socket) => {
                let register = self.parameters.to_register_message();
                if socket.send(message_from_str(&register)).is_ok() {
                    self.socket = Some(socket);
                    self.reset_heartbeat_time();
                } else {
                    self.stopped = true;
                }
            }
            Err(_) => self.stopped = true,
        }
    }

    fn teardown(&mut self) {
        self.socket = None;
        // queued completions refer to a dead registration
        while self.completed_rx.try_recv().is_ok() {}
    }

    fn send_pending_completions(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        while let Ok(id) = self.completed_rx.try_recv() {
            if socket
                .send(message_from_str(&format!("COMPLETE {id}")))
                .is_err()
            {
                self.stopped = true;
                return;
            }
            self.last_heartbeat = Instant::now();
        }
    }

    fn send_heartbeat(&mut self) {
        if let Some(socket) = self.socket.as_ref() {
            if socket.send(message_from_str("HEARTBEAT")).is_err() {
                self.stopped = true;
            }
        }
        self.last_heartbeat = Instant::now();
    }

    fn heartbeat_is_expired(&self) -> bool {
        self.last_heartbeat.elapsed() > self.timing.worker_heartbeat_timeout
    }

    fn reset_heartbeat_time(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::ItemDistributor;
    use crate::itemproto::WorkerQueuePolicy;
    use crate::socket::{pair, router, PairSocket};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn short_timing() -> ProtocolTiming {
        ProtocolTiming {
            distributor_poll_timeout: Duration::from_millis(5),
            distributor_heartbeat_interval: Duration::from_millis(25),
            worker_poll_timeout: Duration::from_millis(5),
            worker_heartbeat_timeout: Duration::from_millis(150),
        }
    }

    fn start_distributor(
        producer: PairSocket,
        binding_out: &mut Option<crate::socket::RouterBinding>,
    ) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        let (router_socket, binding) = router();
        *binding_out = Some(binding);
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut distributor = ItemDistributor::new(producer, router_socket, short_timing());
            distributor.run(&stop2);
        });
        (stop, handle)
    }

    fn params() -> WorkerParameters {
        WorkerParameters {
            stride: 1,
            offset: 0,
            queue_policy: WorkerQueuePolicy::QueueAll,
            group_id: 0,
            client_name: "worker_test".to_owned(),
        }
    }

    #[test]
    fn test_get_receives_and_completes() {
        let (producer, dist_pair) = pair();
        let mut binding = None;
        let (stop, handle) = start_distributor(dist_pair, &mut binding);
        let binding = binding.unwrap();

        let mut worker = ItemWorker::new(binding, "w1", params(), short_timing());
        thread::sleep(Duration::from_millis(50));

        producer.send(message_from_str("11")).unwrap();
        let item = worker.get().unwrap();
        assert_eq!(item.id(), 11);
        drop(item);

        // completion reaches the producer after the worker's next poll
        producer.send(message_from_str("12")).unwrap();
        let item = worker.get().unwrap();
        assert_eq!(item.id(), 12);
        let completion = producer.recv().unwrap();
        assert_eq!(frame_as_str(&completion[0]), "11");

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_end_of_stream() {
        let (producer, dist_pair) = pair();
        let mut binding = None;
        let (stop, handle) = start_distributor(dist_pair, &mut binding);
        let binding = binding.unwrap();

        let mut worker = ItemWorker::new(binding, "w_eos", params(), short_timing());
        thread::sleep(Duration::from_millis(50));

        producer
            .send(message_from_str(&FINAL_ITEM_ID.to_string()))
            .unwrap();
        assert!(worker.get().is_none());
        // once stopped, get keeps returning None
        assert!(worker.get().is_none());

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_worker_survives_distributor_heartbeats() {
        let (producer, dist_pair) = pair();
        let mut binding = None;
        let (stop, handle) = start_distributor(dist_pair, &mut binding);
        let binding = binding.unwrap();

        let mut worker = ItemWorker::new(binding, "w_hb", params(), short_timing());
        // idle long enough for several heartbeat rounds
        thread::sleep(Duration::from_millis(120));

        producer.send(message_from_str("5")).unwrap();
        let item = worker.get().unwrap();
        assert_eq!(item.id(), 5);

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
