//! Whole-node wiring: hosts the configured compute and input instances
//! over one in-process fabric, manages worker subprocesses, and handles
//! termination signals.

use crate::compute::{ItemHandoff, TimesliceBuffer, TimesliceBuilder};
use crate::error::BuildError;
use crate::input::InputChannelSender;
use crate::params::Parameters;
use crate::source::PatternGenerator;
use crate::transport::Network;
use log::{error, info, warn};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static SIGNAL_STATUS: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SIGNAL_STATUS.store(true, Ordering::Relaxed);
}

/// Installs SIGINT/SIGTERM handlers requesting graceful shutdown.
pub fn install_signal_handlers() {
    // SAFETY: installing an async-signal-safe handler that only stores a
    // flag.
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

/// True once a termination signal arrived.
pub fn signal_status() -> bool {
    SIGNAL_STATUS.load(Ordering::Relaxed)
}

/// Hosts all configured node instances of one process.
///
/// With the in-process transport backend, the input and compute instances
/// of a run share one [`Network`]; each instance still has its own thread
/// layout exactly as in a distributed deployment.
pub struct Application {
    params: Parameters,
    network: Arc<Network>,
    stop: Arc<AtomicBool>,
}

impl Application {
    /// Validates the parameters and prepares the fabric.
    pub fn new(params: Parameters) -> Result<Self, BuildError> {
        params.validate()?;
        Ok(Self {
            params,
            network: Network::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The shared stop flag (set by signals or fatal errors).
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the full build: compute instances first (they listen), then
    /// the input instances; returns after all timeslices are built and
    /// every handshake drained.
    pub fn run(&self) -> Result<(), BuildError> {
        let signal_watcher = self.spawn_signal_watcher();

        let mut children = Vec::new();
        let mut compute_threads = Vec::new();
        for compute_index in 0..self.params.num_computes() as u64 {
            let identifier = format!("tsbuild_{}_c{compute_index}_", std::process::id());
            let buffer = TimesliceBuffer::new(
                &identifier,
                self.params.cn_data_buffer_size_exp,
                self.params.cn_desc_buffer_size_exp,
                self.params.num_inputs() as u32,
            )?;
            let handoff = if self.params.processor_executable.is_empty() {
                ItemHandoff::discard()
            } else {
                children.extend(self.start_processes(&identifier)?);
                ItemHandoff::Queues
            };
            let builder = TimesliceBuilder::new(
                &self.params,
                compute_index,
                buffer,
                handoff,
                Arc::clone(&self.network),
                Arc::clone(&self.stop),
            )?;
            compute_threads.push(
                thread::Builder::new()
                    .name(format!("ts_builder_{compute_index}"))
                    .spawn(move || builder.run())
                    .expect("spawning builder thread"),
            );
        }

        let mut generators = Vec::new();
        let mut input_threads = Vec::new();
        for input_index in 0..self.params.num_inputs() as u64 {
            let (generator, producer_thread) =
                PatternGenerator::start(&self.params, input_index)?;
            let sender = InputChannelSender::new(
                &self.params,
                input_index,
                Arc::clone(&generator) as Arc<dyn crate::source::DataSource>,
                Arc::clone(&self.network),
                Arc::clone(&self.stop),
            )?;
            generators.push((generator, producer_thread));
            input_threads.push(
                thread::Builder::new()
                    .name(format!("ts_sender_{input_index}"))
                    .spawn(move || sender.run())
                    .expect("spawning sender thread"),
            );
        }

        let mut result = Ok(());
        for handle in input_threads {
            if let Err(err) = handle.join().expect("joining sender thread") {
                error!("input node failed: {err}");
                self.stop.store(true, Ordering::Release);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        for (generator, producer_thread) in generators {
            generator.stop();
            let _ = producer_thread.join();
        }
        for handle in compute_threads {
            if let Err(err) = handle.join().expect("joining builder thread") {
                error!("compute node failed: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        self.reap_children(children);
        self.stop.store(true, Ordering::Release);
        let _ = signal_watcher.join();
        info!("run finished");
        result
    }

    fn spawn_signal_watcher(&self) -> thread::JoinHandle<()> {
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name("signal_watcher".to_owned())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if signal_status() {
                        warn!("termination signal received, shutting down");
                        stop.store(true, Ordering::Release);
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            })
            .expect("spawning signal watcher")
    }

    /// Starts the configured worker subprocesses for one compute instance.
    fn start_processes(&self, identifier: &str) -> Result<Vec<Child>, BuildError> {
        let command_line = self.params.processor_executable.replace("%s", identifier);
        let mut words = command_line.split_whitespace();
        let program = words.next().unwrap_or_default().to_owned();
        let args: Vec<String> = words.map(str::to_owned).collect();

        let mut children = Vec::new();
        for instance in 0..self.params.processor_instances {
            info!("starting worker process {instance}: {command_line}");
            match Command::new(&program).args(&args).spawn() {
                Ok(child) => children.push(child),
                Err(err) => {
                    error!("starting worker process failed: {err}");
                }
            }
        }
        Ok(children)
    }

    fn reap_children(&self, children: Vec<Child>) {
        for mut child in children {
            match child.try_wait() {
                Ok(Some(status)) => info!("worker process exited: {status}"),
                Ok(None) => {
                    // the end-of-stream sentinel tells workers to leave;
                    // give them a moment before killing
                    thread::sleep(Duration::from_millis(500));
                    match child.try_wait() {
                        Ok(Some(status)) => info!("worker process exited: {status}"),
                        _ => {
                            warn!("killing unresponsive worker process");
                            let _ = child.kill();
                            let _ = child.wait();
                        }
                    }
                }
                Err(err) => warn!("waiting for worker process failed: {err}"),
            }
        }
    }
}
