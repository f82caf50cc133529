//! Item distribution demo: one producer, a filtered worker pair, and a
//! grouped worker pair sharing a stream.
//!
//! Run with: cargo run --bin demo_items

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tsipc::itemproto::{ProtocolTiming, WorkerParameters, WorkerQueuePolicy};
use tsipc::socket::{pair, router};
use tsipc::{ItemDistributor, ItemProducer, ItemWorker};

const NUM_ITEMS: u64 = 100;

fn worker_thread(
    binding: tsipc::socket::RouterBinding,
    identity: &'static str,
    parameters: WorkerParameters,
    delay: Duration,
) -> thread::JoinHandle<Vec<u64>> {
    thread::spawn(move || {
        let mut worker = ItemWorker::new(binding, identity, parameters, ProtocolTiming::default());
        let mut received = Vec::new();
        while let Some(item) = worker.get() {
            received.push(item.id());
            thread::sleep(delay);
        }
        received
    })
}

fn main() {
    let (producer_socket, distributor_socket) = pair();
    let (router_socket, binding) = router();

    let stop = Arc::new(AtomicBool::new(false));
    let distributor_stop = Arc::clone(&stop);
    let distributor = thread::spawn(move || {
        let mut d = ItemDistributor::new(
            distributor_socket,
            router_socket,
            ProtocolTiming::default(),
        );
        d.run(&distributor_stop);
    });

    let odd = worker_thread(
        binding.clone(),
        "odd",
        WorkerParameters {
            stride: 2,
            offset: 1,
            queue_policy: WorkerQueuePolicy::QueueAll,
            group_id: 0,
            client_name: "odd_consumer".into(),
        },
        Duration::from_millis(1),
    );
    let grouped_a = worker_thread(
        binding.clone(),
        "group_a",
        WorkerParameters {
            stride: 1,
            offset: 0,
            queue_policy: WorkerQueuePolicy::QueueAll,
            group_id: 9,
            client_name: "grouped_fast".into(),
        },
        Duration::from_millis(1),
    );
    let grouped_b = worker_thread(
        binding,
        "group_b",
        WorkerParameters {
            stride: 1,
            offset: 0,
            queue_policy: WorkerQueuePolicy::QueueAll,
            group_id: 9,
            client_name: "grouped_slow".into(),
        },
        Duration::from_millis(5),
    );

    thread::sleep(Duration::from_millis(200)); // let registrations land

    let producer = ItemProducer::new(producer_socket);
    let mut completed = 0u64;
    for id in 0..NUM_ITEMS {
        producer.send_work_item(id, &[]);
        while producer.try_receive_completion().is_some() {
            completed += 1;
        }
    }
    while completed < NUM_ITEMS {
        if producer.try_receive_completion().is_some() {
            completed += 1;
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }
    producer.send_end_of_stream();

    let odd_ids = odd.join().unwrap();
    let a_ids = grouped_a.join().unwrap();
    let b_ids = grouped_b.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    distributor.join().unwrap();

    println!("items produced:        {NUM_ITEMS}");
    println!("completions received:  {completed}");
    println!("odd worker received:   {} (all odd ids)", odd_ids.len());
    println!(
        "grouped pair received: {} + {} = {} (shared stream)",
        a_ids.len(),
        b_ids.len(),
        a_ids.len() + b_ids.len()
    );
}
