//! Timeslice building demonstrator.
//!
//! Hosts the configured input and compute instances over the in-process
//! fabric. Example:
//!
//! ```text
//! tsbuild --inputs 2 --computes 2 --timeslice-size 100 --max-ts 1000 \
//!         --exec "tsworker %s"
//! ```

use log::error;
use std::process::ExitCode;
use tsbuild::node::{install_signal_handlers, Application};
use tsbuild::{BuildError, Parameters};

fn usage() -> ! {
    eprintln!(
        "usage: tsbuild [options]\n\
         \n\
         options:\n\
           --inputs <n>          number of input nodes (default 1)\n\
           --computes <n>        number of compute nodes (default 1)\n\
           --base-port <port>    first listening port\n\
           --timeslice-size <n>  core microslices per timeslice\n\
           --overlap <n>         overlap microslices per timeslice\n\
           --max-ts <n>          number of timeslices to build\n\
           --in-data-exp <n>     input data arena size exponent\n\
           --in-desc-exp <n>     input descriptor arena size exponent\n\
           --cn-data-exp <n>     compute data arena size exponent\n\
           --cn-desc-exp <n>     compute descriptor arena size exponent\n\
           --typical-size <n>    typical microslice content size (bytes)\n\
           --randomize           randomize microslice content sizes\n\
           --exec <cmd>          worker command, %s = shm identifier\n\
           --instances <n>       worker processes per compute node"
    );
    std::process::exit(1);
}

fn parse_args() -> Result<Parameters, String> {
    let mut params = Parameters {
        max_timeslice_number: 1000,
        timeslice_size: 100,
        overlap_size: 2,
        typical_content_size: 1024,
        ..Default::default()
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--inputs" => {
                let n: usize = value("--inputs")?.parse().map_err(|e| format!("{e}"))?;
                params.input_nodes = (0..n).map(|i| format!("in{i}")).collect();
            }
            "--computes" => {
                let n: usize = value("--computes")?.parse().map_err(|e| format!("{e}"))?;
                params.compute_nodes = (0..n).map(|i| format!("cn{i}")).collect();
            }
            "--base-port" => params.base_port = parse(value("--base-port")?)?,
            "--timeslice-size" => params.timeslice_size = parse(value("--timeslice-size")?)?,
            "--overlap" => params.overlap_size = parse(value("--overlap")?)?,
            "--max-ts" => params.max_timeslice_number = parse(value("--max-ts")?)?,
            "--in-data-exp" => params.in_data_buffer_size_exp = parse(value("--in-data-exp")?)?,
            "--in-desc-exp" => params.in_desc_buffer_size_exp = parse(value("--in-desc-exp")?)?,
            "--cn-data-exp" => params.cn_data_buffer_size_exp = parse(value("--cn-data-exp")?)?,
            "--cn-desc-exp" => params.cn_desc_buffer_size_exp = parse(value("--cn-desc-exp")?)?,
            "--typical-size" => params.typical_content_size = parse(value("--typical-size")?)?,
            "--randomize" => params.randomize_sizes = true,
            "--exec" => params.processor_executable = value("--exec")?,
            "--instances" => params.processor_instances = parse(value("--instances")?)?,
            "--help" | "-h" => usage(),
            other => return Err(format!("unknown option {other}")),
        }
    }
    Ok(params)
}

fn parse<T: std::str::FromStr>(value: String) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| format!("invalid value: {e}"))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    install_signal_handlers();

    let params = match parse_args() {
        Ok(params) => params,
        Err(message) => {
            error!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let application = match Application::new(params) {
        Ok(application) => application,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match application.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(BuildError::Config(err)) => {
            error!("configuration error: {err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
