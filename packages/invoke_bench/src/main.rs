#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point for the invoke_bench tool.
//!
//! This module is excluded from mutation testing because testing process entry/exit behavior
//! is impractical - it requires spawning subprocesses and checking exit codes.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use argh::FromArgs;
use invoke_bench::{ArrivalModel, FaultPolicy, LoadKind, RunInput, RunnerMode, WaitStrategy, run};
use tracing_subscriber::EnvFilter;

/// Measure throughput and latency of calling a compiled program from many threads.
#[derive(FromArgs)]
struct Args {
    /// how the program is executed (native, native-bounds-checked, native-reuse, vm,
    /// vm-new-isolate, vm-new-context; default native)
    #[argh(option)]
    mode: Option<RunnerMode>,

    /// path to the WebAssembly program (binary or text), required for the vm modes
    #[argh(option)]
    program: Option<PathBuf>,

    /// number of worker threads (default 1)
    #[argh(option, default = "1")]
    threads: usize,

    /// where load comes from (saturating, paced; default saturating)
    #[argh(option)]
    load: Option<LoadKind>,

    /// requests per second in paced mode (default 1000)
    #[argh(option, default = "1000.0")]
    rate: f64,

    /// how paced arrivals are spaced (exponential, poisson-count, constant; default exponential)
    #[argh(option)]
    arrivals: Option<ArrivalModel>,

    /// length of each measured run, e.g. 10s or 500ms (default 10s)
    #[argh(option)]
    duration: Option<humantime::Duration>,

    /// length of the discarded run before each measured run (default 100ms)
    #[argh(option)]
    warmup: Option<humantime::Duration>,

    /// check memory accesses explicitly instead of relying on guard pages
    #[argh(switch)]
    bounds_checks: bool,

    /// function to call (default add, or add_mem for native-bounds-checked); native kernels:
    /// add, add_mem, add_vec, matmul64, matmul128, load, bump
    #[argh(option)]
    function: Option<String>,

    /// argument of the call, repeat for each argument (default 77 88)
    #[argh(option)]
    arg: Vec<i64>,

    /// record per-call latency and report percentiles
    #[argh(switch)]
    latency: bool,

    /// how idle workers wait for requests (spin, backoff, block; default spin)
    #[argh(option)]
    wait: Option<WaitStrategy>,

    /// capacity of each worker queue; full queues reject requests (default unbounded)
    #[argh(option)]
    queue_capacity: Option<usize>,

    /// most latency samples kept per worker (default 4000000)
    #[argh(option)]
    max_samples: Option<usize>,

    /// what a program fault does to the run (continue, abort; default continue)
    #[argh(option)]
    on_fault: Option<FaultPolicy>,

    /// replace the instance (or context, for vm-new-isolate) every N calls
    #[argh(option)]
    recycle_every: Option<u32>,

    /// seed for the request generator, for reproducible arrivals
    #[argh(option)]
    seed: Option<u64>,

    /// run 1, 2, 4, ... threads up to --threads
    #[argh(switch)]
    sweep: bool,

    /// write one CSV row per measured run to this file
    #[argh(option)]
    output: Option<PathBuf>,

    /// run every mode and write one CSV file per mode into this directory; vm modes need
    /// --program
    #[argh(option)]
    all: Option<PathBuf>,

    /// print the collected metrics when done
    #[argh(switch)]
    metrics: bool,
}

// Binary entry point - mutations would require subprocess testing which is impractical.
#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    // Exits with a failure status on malformed arguments and with success on --help.
    let args: Args = argh::from_env();

    let defaults = RunInput::default();

    let input = RunInput {
        mode: args.mode.unwrap_or(defaults.mode),
        program: args.program,
        threads: args.threads,
        load: args.load.unwrap_or(defaults.load),
        rate: args.rate,
        arrivals: args.arrivals.unwrap_or(defaults.arrivals),
        duration: args.duration.map_or(defaults.duration, Into::into),
        warmup: args.warmup.map_or(defaults.warmup, Into::into),
        bounds_checks: args.bounds_checks,
        function: args.function,
        args: if args.arg.is_empty() {
            defaults.args
        } else {
            args.arg
        },
        latency: args.latency,
        wait: args.wait.unwrap_or(defaults.wait),
        queue_capacity: args.queue_capacity,
        max_samples: args.max_samples,
        on_fault: args.on_fault.unwrap_or(defaults.on_fault),
        recycle_every: args.recycle_every,
        seed: args.seed,
        sweep: args.sweep,
        output: args.output,
        all: args.all,
        metrics: args.metrics,
    };

    match run(&input) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
