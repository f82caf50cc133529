//! End-to-end scenarios over the in-process fabric: pattern generator →
//! input sender → (credit-controlled write chains) → timeslice builder →
//! shared-memory handoff → workers.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tsbuild::analyzer::TimesliceAnalyzer;
use tsbuild::compute::{ItemHandoff, TimesliceBuffer, TimesliceBuilder};
use tsbuild::input::InputChannelSender;
use tsbuild::source::{DataSource, PatternGenerator};
use tsbuild::transport::Network;
use tsbuild::Parameters;
use tsipc::distributor::ItemDistributor;
use tsipc::itemproto::{ProtocolTiming, WorkerParameters, WorkerQueuePolicy};
use tsipc::producer::ItemProducer;
use tsipc::receiver::TimesliceReceiver;
use tsipc::socket::{pair, router, RouterBinding};
use tsipc::timeslice::Timeslice;
use tsipc::worker::ItemWorker;

fn unique_identifier(tag: &str, index: u64) -> String {
    format!("tsbuild_it_{}_{}_c{}_", tag, std::process::id(), index)
}

fn base_params(tag: u16) -> Parameters {
    Parameters {
        base_port: 21000 + tag * 16,
        in_data_buffer_size_exp: 16,
        in_desc_buffer_size_exp: 10,
        cn_data_buffer_size_exp: 14,
        cn_desc_buffer_size_exp: 8,
        typical_content_size: 16,
        ..Default::default()
    }
}

/// Spawns the fabric for `params` with one builder per compute node using
/// the provided handoffs; returns per-builder (red_lantern, completed).
fn run_fabric(
    params: &Parameters,
    tag: &str,
    handoffs: Vec<ItemHandoff>,
    per_input_params: Option<Vec<Parameters>>,
    worker_setup: impl FnOnce(&[String]) -> Vec<thread::JoinHandle<()>>,
) -> Vec<(u64, u64)> {
    let network = Network::new();
    let stop = Arc::new(AtomicBool::new(false));

    let mut identifiers = Vec::new();
    let mut builders = Vec::new();
    for (compute_index, handoff) in handoffs.into_iter().enumerate() {
        let identifier = unique_identifier(tag, compute_index as u64);
        let buffer = TimesliceBuffer::new(
            &identifier,
            params.cn_data_buffer_size_exp,
            params.cn_desc_buffer_size_exp,
            params.num_inputs() as u32,
        )
        .unwrap();
        identifiers.push(identifier);
        builders.push(
            TimesliceBuilder::new(
                params,
                compute_index as u64,
                buffer,
                handoff,
                Arc::clone(&network),
                Arc::clone(&stop),
            )
            .unwrap(),
        );
    }

    let builder_threads: Vec<_> = builders
        .into_iter()
        .map(|builder| {
            thread::spawn(move || {
                builder.run().unwrap();
                (builder.red_lantern(), builder.completed())
            })
        })
        .collect();

    let worker_threads = worker_setup(&identifiers);

    let mut generators = Vec::new();
    let mut sender_threads = Vec::new();
    for input_index in 0..params.num_inputs() as u64 {
        let input_params = per_input_params
            .as_ref()
            .map_or_else(|| params.clone(), |p| p[input_index as usize].clone());
        let (generator, producer_thread) =
            PatternGenerator::start(&input_params, input_index).unwrap();
        let sender = InputChannelSender::new(
            &input_params,
            input_index,
            Arc::clone(&generator) as Arc<dyn DataSource>,
            Arc::clone(&network),
            Arc::clone(&stop),
        )
        .unwrap();
        generators.push((generator, producer_thread));
        sender_threads.push(thread::spawn(move || sender.run().unwrap()));
    }

    for handle in sender_threads {
        handle.join().expect("sender thread");
    }
    for (generator, producer_thread) in generators {
        generator.stop();
        producer_thread.join().unwrap();
    }
    let stats: Vec<(u64, u64)> = builder_threads
        .into_iter()
        .map(|handle| handle.join().expect("builder thread"))
        .collect();
    for handle in worker_threads {
        handle.join().expect("worker thread");
    }
    stats
}

fn short_timing() -> ProtocolTiming {
    ProtocolTiming {
        distributor_poll_timeout: Duration::from_millis(5),
        distributor_heartbeat_interval: Duration::from_millis(50),
        worker_poll_timeout: Duration::from_millis(5),
        worker_heartbeat_timeout: Duration::from_millis(500),
    }
}

/// Starts a distributor thread; returns the producer-side handoff, the
/// worker binding and the stop/join pair.
fn start_distributor() -> (
    ItemHandoff,
    RouterBinding,
    Arc<AtomicBool>,
    thread::JoinHandle<()>,
) {
    let (producer_side, distributor_side) = pair();
    let (router_socket, binding) = router();
    let stop = Arc::new(AtomicBool::new(false));
    let distributor_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let mut distributor =
            ItemDistributor::new(distributor_side, router_socket, short_timing());
        distributor.run(&distributor_stop);
    });
    (
        ItemHandoff::Distributor(ItemProducer::new(producer_side)),
        binding,
        stop,
        handle,
    )
}

// ---------------------------------------------------------------------
// SCENARIO 1: single input, single compute, every byte checked
// ---------------------------------------------------------------------

#[test]
fn scenario_single_pair_builds_exact_timeslices() {
    let params = Parameters {
        timeslice_size: 4,
        overlap_size: 2,
        max_timeslice_number: 10,
        typical_content_size: 16,
        ..base_params(1)
    };

    let received: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_worker = Arc::clone(&received);

    let stats = run_fabric(
        &params,
        "s1",
        vec![ItemHandoff::Queues],
        None,
        |identifiers| {
            let identifier = identifiers[0].clone();
            vec![thread::spawn(move || {
                let mut receiver = TimesliceReceiver::connect(&identifier).unwrap();
                let mut analyzer = TimesliceAnalyzer::new(true);
                while let Some(ts) = receiver.get().unwrap() {
                    assert!(analyzer.check_timeslice(&*ts), "timeslice {}", ts.index());
                    let size = ts.component_descriptor(0).size;
                    received_in_worker.lock().unwrap().push((ts.index(), size));
                }
            })]
        },
    );

    let received = received.lock().unwrap();
    // exactly 10 work items, indices 0..9
    let indices: Vec<u64> = received.iter().map(|(index, _)| *index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    // each component: 6 microslices of (16 payload + 32 descriptor) bytes
    for (_, size) in received.iter() {
        assert_eq!(*size, 6 * (16 + 32));
    }
    // final red lantern
    assert_eq!(stats[0], (10, 10));
}

// ---------------------------------------------------------------------
// SCENARIO 2: 2x2 fabric, round-robin routing
// ---------------------------------------------------------------------

#[test]
fn scenario_round_robin_routing_two_by_two() {
    let params = Parameters {
        input_nodes: vec!["in0".into(), "in1".into()],
        compute_nodes: vec!["cn0".into(), "cn1".into()],
        timeslice_size: 100,
        overlap_size: 2,
        max_timeslice_number: 1000,
        in_data_buffer_size_exp: 18,
        in_desc_buffer_size_exp: 12,
        cn_data_buffer_size_exp: 16,
        cn_desc_buffer_size_exp: 8,
        ..base_params(2)
    };

    let received: Arc<Mutex<Vec<Vec<u64>>>> =
        Arc::new(Mutex::new(vec![Vec::new(), Vec::new()]));

    let stats = {
        let received = Arc::clone(&received);
        run_fabric(
            &params,
            "s2",
            vec![ItemHandoff::Queues, ItemHandoff::Queues],
            None,
            move |identifiers| {
                identifiers
                    .iter()
                    .enumerate()
                    .map(|(compute_index, identifier)| {
                        let identifier = identifier.clone();
                        let received = Arc::clone(&received);
                        thread::spawn(move || {
                            let mut receiver = TimesliceReceiver::connect(&identifier).unwrap();
                            let mut analyzer = TimesliceAnalyzer::new(false);
                            while let Some(ts) = receiver.get().unwrap() {
                                assert_eq!(ts.num_components(), 2);
                                assert!(analyzer.check_timeslice(&*ts));
                                received.lock().unwrap()[compute_index].push(ts.index());
                            }
                        })
                    })
                    .collect()
            },
        )
    };

    let received = received.lock().unwrap();
    // timeslice 2k routed to compute 0, 2k+1 to compute 1, in order
    assert_eq!(received[0], (0..1000).filter(|i| i % 2 == 0).collect::<Vec<_>>());
    assert_eq!(received[1], (0..1000).filter(|i| i % 2 == 1).collect::<Vec<_>>());
    // both nodes drained their half
    assert!(stats[0].0 >= 500);
    assert!(stats[1].0 >= 500);
    assert_eq!(stats[0].1, 500);
    assert_eq!(stats[1].1, 500);
}

// ---------------------------------------------------------------------
// SCENARIO 3: skipping worker sees only its stride, nothing is lost
// ---------------------------------------------------------------------

#[test]
fn scenario_skip_policy_worker_filtered_stream() {
    let params = Parameters {
        timeslice_size: 4,
        overlap_size: 2,
        max_timeslice_number: 40,
        ..base_params(3)
    };

    let (handoff, binding, distributor_stop, distributor_thread) = start_distributor();
    let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let worker_thread = {
        let received = Arc::clone(&received);
        let binding = binding.clone();
        thread::spawn(move || {
            let mut worker = ItemWorker::new(
                binding,
                "skip_worker",
                WorkerParameters {
                    stride: 2,
                    offset: 1,
                    queue_policy: WorkerQueuePolicy::Skip,
                    group_id: 0,
                    client_name: "skip_worker".into(),
                },
                short_timing(),
            );
            while let Some(item) = worker.get() {
                received.lock().unwrap().push(item.id());
                // slower than the producer
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    thread::sleep(Duration::from_millis(100)); // let the worker register

    let stats = run_fabric(&params, "s3", vec![handoff], None, |_| Vec::new());

    // the builder only finishes when every item completed
    assert_eq!(stats[0], (40, 40));

    worker_thread.join().unwrap();
    distributor_stop.store(true, Ordering::Relaxed);
    distributor_thread.join().unwrap();

    let received = received.lock().unwrap();
    assert!(!received.is_empty());
    for id in received.iter() {
        assert_eq!(id % 2, 1, "even id delivered to odd-stride worker");
    }
    // ascending order under QUEUE-free delivery
    assert!(received.windows(2).all(|w| w[0] < w[1]));
}

// ---------------------------------------------------------------------
// SCENARIO 4: grouped workers share one stream, disjoint and complete
// ---------------------------------------------------------------------

#[test]
fn scenario_grouped_workers_share_stream() {
    let params = Parameters {
        timeslice_size: 4,
        overlap_size: 2,
        max_timeslice_number: 60,
        ..base_params(4)
    };

    let (handoff, binding, distributor_stop, distributor_thread) = start_distributor();

    let spawn_group_worker = |identity: &'static str, delay: Duration| {
        let binding = binding.clone();
        thread::spawn(move || {
            let mut worker = ItemWorker::new(
                binding,
                identity,
                WorkerParameters {
                    stride: 1,
                    offset: 0,
                    queue_policy: WorkerQueuePolicy::QueueAll,
                    group_id: 7,
                    client_name: identity.into(),
                },
                short_timing(),
            );
            let mut ids = Vec::new();
            while let Some(item) = worker.get() {
                ids.push(item.id());
                thread::sleep(delay);
            }
            ids
        })
    };
    let fast = spawn_group_worker("group_fast", Duration::from_micros(100));
    let slow = spawn_group_worker("group_slow", Duration::from_millis(2));
    thread::sleep(Duration::from_millis(100)); // let both register

    let stats = run_fabric(&params, "s4", vec![handoff], None, |_| Vec::new());
    assert_eq!(stats[0], (60, 60));

    let fast_ids = fast.join().unwrap();
    let slow_ids = slow.join().unwrap();
    distributor_stop.store(true, Ordering::Relaxed);
    distributor_thread.join().unwrap();

    // disjoint delivery covering every id exactly once
    let mut all: Vec<u64> = fast_ids.iter().chain(slow_ids.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..60).collect::<Vec<_>>());
    for id in &fast_ids {
        assert!(!slow_ids.contains(id), "id {id} delivered to both workers");
    }
}

// ---------------------------------------------------------------------
// SCENARIO 5: worker loss and replacement
// ---------------------------------------------------------------------

#[test]
fn scenario_worker_loss_and_replacement() {
    let params = Parameters {
        timeslice_size: 4,
        overlap_size: 2,
        max_timeslice_number: 80,
        ..base_params(5)
    };

    let (handoff, binding, distributor_stop, distributor_thread) = start_distributor();
    let first_seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let replacement_seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let replacement_registered = Arc::new(AtomicBool::new(false));

    // first worker dies after a few items (endpoint dropped = transport
    // disconnect)
    let first_worker = {
        let binding = binding.clone();
        let first_seen = Arc::clone(&first_seen);
        thread::spawn(move || {
            let mut worker = ItemWorker::new(
                binding,
                "mortal",
                WorkerParameters {
                    stride: 1,
                    offset: 0,
                    queue_policy: WorkerQueuePolicy::QueueAll,
                    group_id: 0,
                    client_name: "mortal".into(),
                },
                short_timing(),
            );
            for _ in 0..5 {
                if let Some(item) = worker.get() {
                    first_seen.lock().unwrap().push(item.id());
                }
            }
            // worker dropped here: outstanding/waiting items are released
        })
    };

    let replacement_worker = {
        let binding = binding.clone();
        let replacement_seen = Arc::clone(&replacement_seen);
        let replacement_registered = Arc::clone(&replacement_registered);
        thread::spawn(move || {
            while !replacement_registered.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
            let mut worker = ItemWorker::new(
                binding,
                "replacement",
                WorkerParameters {
                    stride: 1,
                    offset: 0,
                    queue_policy: WorkerQueuePolicy::QueueAll,
                    group_id: 0,
                    client_name: "replacement".into(),
                },
                short_timing(),
            );
            while let Some(item) = worker.get() {
                replacement_seen.lock().unwrap().push(item.id());
            }
        })
    };

    let trigger = {
        let replacement_registered = Arc::clone(&replacement_registered);
        let first_worker = first_worker;
        thread::spawn(move || {
            first_worker.join().unwrap();
            replacement_registered.store(true, Ordering::Relaxed);
        })
    };

    thread::sleep(Duration::from_millis(100)); // let the first worker register
    let stats = run_fabric(&params, "s5", vec![handoff], None, |_| Vec::new());
    // every item completed despite the loss
    assert_eq!(stats[0], (80, 80));

    trigger.join().unwrap();
    replacement_worker.join().unwrap();
    distributor_stop.store(true, Ordering::Relaxed);
    distributor_thread.join().unwrap();

    let first_seen = first_seen.lock().unwrap();
    let replacement_seen = replacement_seen.lock().unwrap();
    assert_eq!(first_seen.len(), 5);
    assert!(!replacement_seen.is_empty());

    // dispatch continues without a gap after the replacement's first item
    let first_replacement_id = replacement_seen[0];
    let expected: Vec<u64> = (first_replacement_id..80).collect();
    assert_eq!(*replacement_seen, expected);
}

// ---------------------------------------------------------------------
// SCENARIO 6: slow input, red lantern tracks it, buffers never overflow
// ---------------------------------------------------------------------

#[test]
fn scenario_slow_input_backpressure() {
    let params = Parameters {
        input_nodes: vec!["in0".into(), "in1".into()],
        timeslice_size: 8,
        overlap_size: 2,
        max_timeslice_number: 200,
        // deliberately tight compute buffers: credit has to throttle
        cn_data_buffer_size_exp: 12,
        cn_desc_buffer_size_exp: 4,
        ..base_params(6)
    };
    // input 0 runs with cramped local rings, making it the slow one
    let mut slow = params.clone();
    slow.in_data_buffer_size_exp = 12;
    slow.in_desc_buffer_size_exp = 7;
    let per_input = Some(vec![slow, params.clone()]);

    let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let stats = {
        let received = Arc::clone(&received);
        run_fabric(
            &params,
            "s6",
            vec![ItemHandoff::Queues],
            per_input,
            move |identifiers| {
                let identifier = identifiers[0].clone();
                vec![thread::spawn(move || {
                    let mut receiver = TimesliceReceiver::connect(&identifier).unwrap();
                    let mut analyzer = TimesliceAnalyzer::new(false);
                    while let Some(ts) = receiver.get().unwrap() {
                        assert!(analyzer.check_timeslice(&*ts));
                        received.lock().unwrap().push(ts.index());
                        // consumer slower than the fabric
                        thread::sleep(Duration::from_micros(300));
                    }
                })]
            },
        )
    };

    // everything was built and completed despite the throttling
    assert_eq!(stats[0], (200, 200));
    assert_eq!(*received.lock().unwrap(), (0..200).collect::<Vec<_>>());
}
