//! The item distributor: fans built timeslices out to worker clients.
//!
//! Work items arrive from an exclusive producer over a pair socket; workers
//! attach over the router socket, each under a stable identity. The
//! distributor is single-threaded by construction — every piece of state is
//! touched only from [`ItemDistributor::run`].
//!
//! An item is held by `Rc`; the [`Item`] destructor reports the completion
//! back to the producer once the last holding worker releases it. An item
//! accepted by no worker therefore completes immediately when the dispatch
//! scope ends.

use crate::itemproto::{
    parse_id_message, ItemId, ProtocolError, ProtocolTiming, WorkerParameters, WorkerQueuePolicy,
    FINAL_ITEM_ID,
};
use crate::socket::{
    frame_as_str, message_from_str, Message, PairSocket, PeerEvent, RouterSocket, SocketError,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A work item while it is owned by the distributor.
pub struct Item {
    id: ItemId,
    payload: Vec<u8>,
    completed_tx: Sender<ItemId>,
}

impl Item {
    /// The item id.
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// The optional binary payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Drop for Item {
    fn drop(&mut self) {
        // Last holder gone: the completion becomes pending.
        let _ = self.completed_tx.send(self.id);
    }
}

struct WorkerState {
    identity: String,
    params: WorkerParameters,
    waiting: VecDeque<Rc<Item>>,
    outstanding: Vec<Rc<Item>>,
    last_heartbeat: Instant,
}

impl WorkerState {
    fn new(identity: String, params: WorkerParameters) -> Self {
        Self {
            identity,
            params,
            waiting: VecDeque::new(),
            outstanding: Vec::new(),
            last_heartbeat: Instant::now(),
        }
    }

    fn wants(&self, id: ItemId) -> bool {
        id % self.params.stride == self.params.offset
    }

    fn is_idle(&self) -> bool {
        self.outstanding.is_empty()
    }

    fn delete_outstanding(&mut self, id: ItemId) -> Result<(), ProtocolError> {
        let pos = self
            .outstanding
            .iter()
            .position(|item| item.id() == id)
            .ok_or(ProtocolError::InvalidCompletion(id))?;
        self.outstanding.remove(pos);
        Ok(())
    }

    fn delete_from_queue(&mut self, id: ItemId) {
        if let Some(pos) = self.waiting.iter().position(|item| item.id() == id) {
            self.waiting.remove(pos);
        }
    }

    fn wants_heartbeat(&self, now: Instant, interval: std::time::Duration) -> bool {
        self.is_idle() && now.duration_since(self.last_heartbeat) > interval
    }

    fn reset_heartbeat_time(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

/// Work items are received from an exclusive producer through a pair
/// socket and distributed to router-attached workers.
pub struct ItemDistributor {
    producer: PairSocket,
    router: RouterSocket,
    /// Registration order matters: it breaks ties between idle same-group
    /// workers.
    workers: Vec<WorkerState>,
    completed_rx: Receiver<ItemId>,
    completed_tx: Sender<ItemId>,
    timing: ProtocolTiming,
}

impl ItemDistributor {
    /// Creates a distributor over its two control endpoints.
    pub fn new(producer: PairSocket, router: RouterSocket, timing: ProtocolTiming) -> Self {
        let (completed_tx, completed_rx) = unbounded();
        Self {
            producer,
            router,
            workers: Vec::new(),
            completed_rx,
            completed_tx,
            timing,
        }
    }

    /// The distributor event loop; returns when `stop` is set or the
    /// producer goes away.
    pub fn run(&mut self, stop: &Arc<AtomicBool>) {
        let producer_rx = self.producer.receiver().clone();
        let router_rx = self.router.events().clone();
        while !stop.load(Ordering::Relaxed) {
            crossbeam_channel::select! {
                recv(producer_rx) -> msg => match msg {
                    Ok(message) => self.on_producer_message(message),
                    Err(_) => {
                        debug!("producer detached, distributor exiting");
                        break;
                    }
                },
                recv(router_rx) -> event => match event {
                    Ok(event) => {
                        if let Some(peer_event) = self.router.process(event) {
                            self.on_worker_event(peer_event);
                        }
                    }
                    Err(_) => break,
                },
                default(self.timing.distributor_poll_timeout) => {}
            }
            self.send_heartbeats();
            self.send_pending_completions();
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER SIDE
    // ---------------------------------------------------------------------

    fn on_producer_message(&mut self, message: Message) {
        let Some(id) = message
            .first()
            .and_then(|frame| std::str::from_utf8(frame).ok())
            .and_then(|text| text.parse::<ItemId>().ok())
        else {
            error!("malformed work item message from producer");
            return;
        };
        let payload = message.get(1).cloned().unwrap_or_default();

        if id == FINAL_ITEM_ID {
            self.broadcast_end_of_stream();
            return;
        }

        let new_item = Rc::new(Item {
            id,
            payload,
            completed_tx: self.completed_tx.clone(),
        });

        // Distribute the new work item. A non-zero group is served at most
        // once per dispatch round.
        let mut completed_groups: HashSet<u64> = HashSet::new();
        let mut failed: Vec<String> = Vec::new();
        for index in 0..self.workers.len() {
            let group_id = self.workers[index].params.group_id;
            if group_id != 0 && completed_groups.contains(&group_id) {
                continue;
            }
            if !self.workers[index].wants(id) {
                continue;
            }
            if self.workers[index].params.queue_policy == WorkerQueuePolicy::PrebufferOne {
                self.workers[index].waiting.clear();
            }
            if self.workers[index].is_idle() {
                if group_id != 0 {
                    completed_groups.insert(group_id);
                    // earlier same-group workers may still hold the item in
                    // their queues from a previous busy round
                    for other in &mut self.workers[..index] {
                        if other.params.group_id == group_id {
                            other.delete_from_queue(id);
                        }
                    }
                }
                self.workers[index].outstanding.push(Rc::clone(&new_item));
                if self.send_work_item(index, &new_item).is_err() {
                    failed.push(self.workers[index].identity.clone());
                }
            } else {
                match self.workers[index].params.queue_policy {
                    WorkerQueuePolicy::QueueAll | WorkerQueuePolicy::PrebufferOne => {
                        self.workers[index].waiting.push_back(Rc::clone(&new_item));
                    }
                    WorkerQueuePolicy::Skip => {}
                }
            }
        }
        drop(new_item);
        for identity in failed {
            self.erase_worker(&identity);
        }
        // A pending completion can already exist here if no worker accepted
        // the item.
        self.send_pending_completions();
    }

    fn broadcast_end_of_stream(&mut self) {
        info!("distributing end-of-stream to {} workers", self.workers.len());
        let message = message_from_str(&format!("WORK_ITEM {FINAL_ITEM_ID}"));
        let mut failed = Vec::new();
        for worker in &self.workers {
            if self.router.send(&worker.identity, message.clone()).is_err() {
                failed.push(worker.identity.clone());
            }
        }
        for identity in failed {
            self.erase_worker(&identity);
        }
        // The sentinel is fire-and-forget: it is never outstanding.
        let _ = self.completed_tx.send(FINAL_ITEM_ID);
        self.send_pending_completions();
    }

    // ---------------------------------------------------------------------
    // WORKER SIDE
    // ---------------------------------------------------------------------

    fn on_worker_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Disconnected(identity) => {
                if let Some(pos) = self.worker_position(&identity) {
                    info!(
                        "worker disconnected: {}",
                        self.workers[pos].params.description()
                    );
                    self.workers.remove(pos);
                } else {
                    // a misbehaving peer may detach without ever registering
                    error!("disconnect from unknown worker");
                }
            }
            PeerEvent::Message(identity, message) => {
                if let Err(err) = self.on_worker_message(&identity, &message) {
                    error!("{err}");
                    error!("protocol violation, disconnecting worker");
                    let _ = self
                        .router
                        .send(&identity, message_from_str("DISCONNECT"));
                    self.erase_worker(&identity);
                }
            }
        }
        self.send_pending_completions();
    }

    fn on_worker_message(
        &mut self,
        identity: &str,
        message: &Message,
    ) -> Result<(), ProtocolError> {
        let text = message
            .first()
            .map(|frame| frame_as_str(frame).into_owned())
            .unwrap_or_default();

        if text.starts_with("REGISTER ") {
            let params = WorkerParameters::from_register_message(&text)?;
            info!("worker connected: {}", params.description());
            let state = WorkerState::new(identity.to_owned(), params);
            match self.worker_position(identity) {
                // re-registration replaces the worker, keeping its position
                Some(pos) => self.workers[pos] = state,
                None => self.workers.push(state),
            }
            Ok(())
        } else if text.starts_with("COMPLETE ") {
            let id = parse_id_message("COMPLETE", &text)?;
            let pos = self
                .worker_position(identity)
                .ok_or(ProtocolError::InvalidCompletion(id))?;
            self.workers[pos].delete_outstanding(id)?;
            self.dispatch_next_queued(pos);
            Ok(())
        } else if text.starts_with("HEARTBEAT") {
            // heartbeat replies carry no state
            Ok(())
        } else {
            Err(ProtocolError::UnknownVerb(text))
        }
    }

    /// After a completion: hand the worker its next queued item, if any.
    fn dispatch_next_queued(&mut self, pos: usize) {
        let Some(item) = self.workers[pos].waiting.pop_front() else {
            self.workers[pos].reset_heartbeat_time();
            return;
        };
        let group_id = self.workers[pos].params.group_id;
        if group_id != 0 {
            let id = item.id();
            for (other_pos, other) in self.workers.iter_mut().enumerate() {
                if other_pos != pos && other.params.group_id == group_id {
                    other.delete_from_queue(id);
                }
            }
        }
        self.workers[pos].outstanding.push(Rc::clone(&item));
        if self.send_work_item(pos, &item).is_err() {
            let identity = self.workers[pos].identity.clone();
            drop(item);
            self.erase_worker(&identity);
        }
    }

    // ---------------------------------------------------------------------
    // HOUSEKEEPING
    // ---------------------------------------------------------------------

    fn send_work_item(&self, pos: usize, item: &Item) -> Result<(), SocketError> {
        let mut message = message_from_str(&format!("WORK_ITEM {}", item.id()));
        if !item.payload().is_empty() {
            message.push(item.payload().to_vec());
        }
        self.router.send(&self.workers[pos].identity, message)
    }

    fn send_heartbeats(&mut self) {
        let now = Instant::now();
        let interval = self.timing.distributor_heartbeat_interval;
        let mut failed = Vec::new();
        for worker in &mut self.workers {
            if worker.wants_heartbeat(now, interval) {
                worker.reset_heartbeat_time();
                if self
                    .router
                    .send(&worker.identity, message_from_str("HEARTBEAT"))
                    .is_err()
                {
                    failed.push(worker.identity.clone());
                }
            }
        }
        for identity in failed {
            self.erase_worker(&identity);
        }
    }

    fn send_pending_completions(&mut self) {
        while let Ok(id) = self.completed_rx.try_recv() {
            if self
                .producer
                .send(message_from_str(&id.to_string()))
                .is_err()
            {
                debug!("producer detached, dropping completion {id}");
            }
        }
    }

    fn worker_position(&self, identity: &str) -> Option<usize> {
        self.workers.iter().position(|w| w.identity == identity)
    }

    fn erase_worker(&mut self, identity: &str) {
        if let Some(pos) = self.worker_position(identity) {
            self.workers.remove(pos);
        }
        self.router.forget(identity);
    }
}
