//! Command-line front end of the benchmark.
//!
//! The binary only parses arguments and installs logging; everything else lives here so it can be
//! exercised by tests without spawning processes.

use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::iter;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nm::Report as MetricsReport;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    Abort, ArrivalModel, Call, ConfigurationError, EngineConfig, Executable, FaultPolicy,
    LatencyDistribution, LoadMode, NATIVE_MEMORY_BYTES, NativeProgram, PoolConfig, QueueCapacity,
    Recycle, Report, SetupError, WaitStrategy, WasmEnvironment, WorkerPool,
};

/// How the measured program is executed and how often its instances are replaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunnerMode {
    /// Built-in kernels with only the linear memory the called kernel touches, fresh instance for
    /// every call.
    #[default]
    Native,

    /// Built-in kernels staging operands through bounds-checked memory, fresh instance for every
    /// call.
    NativeBoundsChecked,

    /// Built-in kernels with linear memory, one instance reused for every call.
    NativeReuse,

    /// WebAssembly program, one instance reused for every call.
    Vm,

    /// WebAssembly program, a new execution context for every call.
    VmNewIsolate,

    /// WebAssembly program, a new instance in the same execution context for every call.
    VmNewContext,
}

impl RunnerMode {
    /// Every mode, in the order a full run measures them.
    pub const ALL: [Self; 6] = [
        Self::Native,
        Self::NativeBoundsChecked,
        Self::NativeReuse,
        Self::Vm,
        Self::VmNewIsolate,
        Self::VmNewContext,
    ];

    /// Whether the mode executes a program file.
    #[must_use]
    pub fn needs_program(self) -> bool {
        matches!(self, Self::Vm | Self::VmNewIsolate | Self::VmNewContext)
    }

    /// The function called when none is named explicitly.
    #[must_use]
    pub fn default_function(self) -> &'static str {
        match self {
            Self::NativeBoundsChecked => "add_mem",
            _ => "add",
        }
    }

    /// The recycling policy of the mode, with its interval replaced by `every` if given.
    ///
    /// Modes that reuse their instance recycle instances every `every` calls when an interval
    /// is given.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::ZeroRecycleInterval`] if `every` is zero.
    pub fn recycle(self, every: Option<u32>) -> Result<Recycle, ConfigurationError> {
        let interval = every
            .map(|every| NonZero::new(every).ok_or(ConfigurationError::ZeroRecycleInterval))
            .transpose()?;

        let default = match self {
            Self::Native | Self::NativeBoundsChecked | Self::VmNewContext => {
                Recycle::INSTANCE_PER_CALL
            }
            Self::VmNewIsolate => Recycle::CONTEXT_PER_CALL,
            Self::NativeReuse | Self::Vm => Recycle::Never,
        };

        Ok(match (default, interval) {
            (_, None) => default,
            (Recycle::Context(_), Some(every)) => Recycle::Context(every),
            (_, Some(every)) => Recycle::Instance(every),
        })
    }

    fn native_program(self, function: &str) -> NativeProgram {
        let needed = NativeProgram::memory_needed(function).unwrap_or(0);

        match self {
            Self::Native => NativeProgram::with_memory_bytes(needed),
            _ => NativeProgram::with_memory_bytes(needed.max(NATIVE_MEMORY_BYTES)),
        }
    }
}

impl Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::NativeBoundsChecked => "native-bounds-checked",
            Self::NativeReuse => "native-reuse",
            Self::Vm => "vm",
            Self::VmNewIsolate => "vm-new-isolate",
            Self::VmNewContext => "vm-new-context",
        })
    }
}

impl FromStr for RunnerMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "native-bounds-checked" => Ok(Self::NativeBoundsChecked),
            "native-reuse" => Ok(Self::NativeReuse),
            "vm" => Ok(Self::Vm),
            "vm-new-isolate" => Ok(Self::VmNewIsolate),
            "vm-new-context" => Ok(Self::VmNewContext),
            _ => Err(ConfigurationError::InvalidChoice {
                option: "--mode",
                value: s.to_string(),
                expected: "native, native-bounds-checked, native-reuse, vm, vm-new-isolate, \
                           vm-new-context",
            }),
        }
    }
}

/// Where load comes from, as selected on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadKind {
    /// Workers call back-to-back.
    #[default]
    Saturating,

    /// A generator paces requests at `--rate`.
    Paced,
}

impl FromStr for LoadKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "saturating" => Ok(Self::Saturating),
            "paced" => Ok(Self::Paced),
            _ => Err(ConfigurationError::InvalidChoice {
                option: "--load",
                value: s.to_string(),
                expected: "saturating, paced",
            }),
        }
    }
}

/// Parsed command-line input for [`run`].
#[doc(hidden)]
#[derive(Clone, Debug)]
#[allow(
    clippy::exhaustive_structs,
    reason = "This is a hidden struct for internal/test use only"
)]
pub struct RunInput {
    /// How the program is executed.
    pub mode: RunnerMode,
    /// Program file for the modes that execute one.
    pub program: Option<PathBuf>,
    /// Worker threads, or the largest thread count when sweeping.
    pub threads: usize,
    /// Where load comes from.
    pub load: LoadKind,
    /// Requests per second in paced mode.
    pub rate: f64,
    /// How paced arrivals are spaced.
    pub arrivals: ArrivalModel,
    /// Length of each measured run.
    pub duration: Duration,
    /// Length of the discarded run before each measured run.
    pub warmup: Duration,
    /// Whether the engine checks memory accesses explicitly.
    pub bounds_checks: bool,
    /// Function to call instead of the mode's default.
    pub function: Option<String>,
    /// Arguments of the call.
    pub args: Vec<i64>,
    /// Whether per-call latency is recorded.
    pub latency: bool,
    /// How idle workers wait.
    pub wait: WaitStrategy,
    /// Capacity of each worker queue, unbounded if absent.
    pub queue_capacity: Option<usize>,
    /// Most latency samples kept per worker, the pool default if absent.
    pub max_samples: Option<usize>,
    /// What a program fault does to the run.
    pub on_fault: FaultPolicy,
    /// Overrides the recycling interval of the mode.
    pub recycle_every: Option<u32>,
    /// Seed for the generator.
    pub seed: Option<u64>,
    /// Whether to run every power-of-two thread count up to `threads`.
    pub sweep: bool,
    /// CSV file receiving one row per measured run.
    pub output: Option<PathBuf>,
    /// Runs every mode instead of `mode`, writing one CSV file per mode into this directory.
    pub all: Option<PathBuf>,
    /// Whether to print the collected metrics at the end.
    pub metrics: bool,
}

impl Default for RunInput {
    fn default() -> Self {
        Self {
            mode: RunnerMode::Native,
            program: None,
            threads: 1,
            load: LoadKind::Saturating,
            rate: 1000.0,
            arrivals: ArrivalModel::Exponential,
            duration: Duration::from_secs(10),
            warmup: Duration::from_millis(100),
            bounds_checks: false,
            function: None,
            args: vec![77, 88],
            latency: false,
            wait: WaitStrategy::Spin,
            queue_capacity: None,
            max_samples: None,
            on_fault: FaultPolicy::Continue,
            recycle_every: None,
            seed: None,
            sweep: false,
            output: None,
            all: None,
            metrics: false,
        }
    }
}

/// Why a benchmark run did not complete successfully.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CliError {
    /// The execution environment could not be prepared.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// The command line asks for something that cannot run.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A worker ended a run early.
    #[error("{0}")]
    Aborted(Abort),

    /// Results could not be written.
    #[error("failed to write results to '{}'", path.display())]
    Output {
        /// The output file or directory.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: csv::Error,
    },
}

/// One CSV row describing a measured run.
#[derive(Debug, Serialize)]
struct Datum {
    mode: String,
    load: String,
    parallel: usize,
    iterations: u64,
    failed: u64,
    generated: u64,
    rejected: u64,
    duration_ns: u64,
    iters_per_second: f64,
    p50_ns: Option<u64>,
    p90_ns: Option<u64>,
    p99_ns: Option<u64>,
    debug: bool,
}

impl Datum {
    fn new(mode: RunnerMode, report: &Report) -> Self {
        let percentile = |p: fn(&LatencyDistribution) -> Option<Duration>| {
            report.service_latency().and_then(p).map(nanos)
        };

        Self {
            mode: mode.to_string(),
            load: report.load().to_string(),
            parallel: report.threads(),
            iterations: report.processed(),
            failed: report.failed(),
            generated: report.generated(),
            rejected: report.rejected(),
            duration_ns: nanos(report.elapsed()),
            iters_per_second: report.throughput(),
            p50_ns: percentile(LatencyDistribution::p50),
            p90_ns: percentile(LatencyDistribution::p90),
            p99_ns: percentile(LatencyDistribution::p99),
            debug: cfg!(debug_assertions),
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Runs the benchmark described by `input`, printing each report to stdout.
///
/// Every setting is validated and the program is compiled before any worker starts.
///
/// # Errors
///
/// Returns an error if the input is invalid, the program cannot be read or compiled, a worker
/// aborts a run or the results cannot be written. Reports of runs completed before the failure
/// have been printed.
#[doc(hidden)]
pub fn run(input: &RunInput) -> Result<Vec<Report>, CliError> {
    // Validates the whole configuration once up front.
    let _config = pool_config(input, input.threads)?;

    if let Some(directory) = &input.all {
        return run_all(input, directory);
    }

    let function = input
        .function
        .as_deref()
        .unwrap_or_else(|| input.mode.default_function());
    let call = Call::new(function, input.args.clone());

    if !input.mode.needs_program() {
        return measure(&input.mode.native_program(function), &call, input);
    }

    let Some(path) = &input.program else {
        return Err(ConfigurationError::MissingProgram {
            mode: input.mode.to_string(),
        }
        .into());
    };

    let bytes = fs::read(path).map_err(|source| SetupError::ReadProgram {
        path: path.clone(),
        source,
    })?;

    let environment = WasmEnvironment::initialize(
        &EngineConfig::new().with_bounds_checks(input.bounds_checks),
    )?;

    let result = {
        let program = environment.compile(&bytes)?;
        measure(&program, &call, input)
    };

    environment.dispose();
    result
}

/// Runs every mode with the settings of `input`, one CSV file per mode in `directory`.
///
/// Modes that execute a program file are skipped when no program is given.
fn run_all(input: &RunInput, directory: &Path) -> Result<Vec<Report>, CliError> {
    fs::create_dir_all(directory).map_err(|source| CliError::Output {
        path: directory.to_path_buf(),
        source: source.into(),
    })?;

    let mut reports = Vec::new();

    for mode in RunnerMode::ALL {
        if mode.needs_program() && input.program.is_none() {
            info!(%mode, "skipping mode without a program file");
            continue;
        }

        info!(%mode, "running mode");

        let mode_input = RunInput {
            mode,
            output: Some(directory.join(format!("{mode}.csv"))),
            all: None,
            metrics: false,
            ..input.clone()
        };

        reports.extend(run(&mode_input)?);
    }

    if input.metrics {
        println!("{}", MetricsReport::collect());
    }

    Ok(reports)
}

fn pool_config(input: &RunInput, threads: usize) -> Result<PoolConfig, ConfigurationError> {
    let threads = NonZero::new(threads).ok_or(ConfigurationError::NoThreads)?;

    let load = match input.load {
        LoadKind::Saturating => LoadMode::Saturating,
        LoadKind::Paced => LoadMode::paced(input.rate, input.arrivals)?,
    };

    let queue_capacity = match input.queue_capacity {
        None => QueueCapacity::Unbounded,
        Some(capacity) => QueueCapacity::Bounded(
            NonZero::new(capacity).ok_or(ConfigurationError::ZeroQueueCapacity)?,
        ),
    };

    let mut builder = PoolConfig::builder()
        .threads(threads)
        .load(load)
        .recycle(input.mode.recycle(input.recycle_every)?)
        .record_latency(input.latency)
        .fault_policy(input.on_fault)
        .wait(input.wait)
        .queue_capacity(queue_capacity);

    if let Some(max_samples) = input.max_samples {
        builder = builder.max_samples_per_worker(
            NonZero::new(max_samples).ok_or(ConfigurationError::ZeroSampleCap)?,
        );
    }

    if let Some(seed) = input.seed {
        builder = builder.seed(seed);
    }

    Ok(builder.build())
}

/// The thread counts to measure: just `max`, or every power of two below it followed by `max`.
fn thread_counts(max: usize, sweep: bool) -> Vec<usize> {
    if !sweep {
        return vec![max];
    }

    let mut counts: Vec<usize> = iter::successors(Some(1_usize), |count| count.checked_mul(2))
        .take_while(|count| *count < max)
        .collect();
    counts.push(max);
    counts
}

fn measure<E>(executable: &E, call: &Call, input: &RunInput) -> Result<Vec<Report>, CliError>
where
    E: Executable,
{
    let mut writer = match &input.output {
        None => None,
        Some(path) => Some(
            csv::Writer::from_path(path).map_err(|source| output_error(input, source))?,
        ),
    };

    let mut reports = Vec::new();

    for threads in thread_counts(input.threads, input.sweep) {
        let config = pool_config(input, threads)?;
        let mut pool = WorkerPool::new(executable, call, config);

        if !input.warmup.is_zero() {
            debug!(threads, warmup = ?input.warmup, "warming up");

            let warmup = pool.run_for(input.warmup);

            if let Some(abort) = warmup.abort() {
                return Err(CliError::Aborted(abort.clone()));
            }
        }

        let report = pool.run_for(input.duration);
        println!("{report}");

        if let Some(writer) = &mut writer {
            writer
                .serialize(Datum::new(input.mode, &report))
                .map_err(|source| output_error(input, source))?;
        }

        if let Some(abort) = report.abort() {
            flush(writer.as_mut(), input)?;
            return Err(CliError::Aborted(abort.clone()));
        }

        reports.push(report);
    }

    flush(writer.as_mut(), input)?;

    if input.metrics {
        println!("{}", MetricsReport::collect());
    }

    info!(runs = reports.len(), mode = %input.mode, "benchmark complete");

    Ok(reports)
}

fn flush(writer: Option<&mut csv::Writer<fs::File>>, input: &RunInput) -> Result<(), CliError> {
    let Some(writer) = writer else {
        return Ok(());
    };

    writer
        .flush()
        .map_err(|source: io::Error| output_error(input, source.into()))
}

fn output_error(input: &RunInput, source: csv::Error) -> CliError {
    CliError::Output {
        path: input.output.clone().unwrap_or_default(),
        source,
    }
}
