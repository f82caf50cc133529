//! Shared-memory timeslice worker.
//!
//! Attaches to a compute instance by identifier, verifies every received
//! timeslice against the synthetic pattern, and leaves at end of stream.
//!
//! ```text
//! tsworker [--crc] <shm_identifier>
//! ```

use log::{error, info};
use std::process::ExitCode;
use tsbuild::analyzer::TimesliceAnalyzer;
use tsipc::receiver::TimesliceReceiver;
use tsipc::timeslice::Timeslice;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut check_crc = false;
    let mut identifier = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--crc" => check_crc = true,
            other if identifier.is_none() => identifier = Some(other.to_owned()),
            other => {
                error!("unexpected argument {other}");
                return ExitCode::FAILURE;
            }
        }
    }
    let Some(identifier) = identifier else {
        eprintln!("usage: tsworker [--crc] <shm_identifier>");
        return ExitCode::FAILURE;
    };

    let mut receiver = match TimesliceReceiver::connect(&identifier) {
        Ok(receiver) => receiver,
        Err(err) => {
            error!("attaching to {identifier} failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut analyzer = TimesliceAnalyzer::new(check_crc);
    loop {
        match receiver.get() {
            Ok(Some(timeslice)) => {
                if !analyzer.check_timeslice(&*timeslice) {
                    error!("timeslice {} failed verification", timeslice.index());
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!("receive failed: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    info!(
        "checked {} timeslices ({} microslices), {} failed",
        analyzer.timeslices_checked(),
        analyzer.microslices_checked(),
        analyzer.timeslices_failed()
    );
    if analyzer.timeslices_failed() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
