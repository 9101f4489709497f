use std::fmt::{self, Display};
use std::num::NonZero;
use std::str::FromStr;

use new_zealand::nz;

use crate::{ArrivalModel, ArrivalProcess, ConfigurationError, QueueCapacity, Recycle, WaitStrategy};

const DEFAULT_MAX_SAMPLES_PER_WORKER: NonZero<usize> = nz!(4_000_000_usize);

/// Where the load on the workers comes from.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum LoadMode {
    /// Workers call the executable back-to-back as fast as they can.
    #[default]
    Saturating,

    /// A generator thread issues requests according to an arrival process and workers serve
    /// them from their queues.
    Paced(ArrivalProcess),
}

impl LoadMode {
    /// Paced load with `rate` requests per second spaced according to `model`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidRate`] unless `rate` is finite and positive.
    pub fn paced(rate: f64, model: ArrivalModel) -> Result<Self, ConfigurationError> {
        Ok(Self::Paced(ArrivalProcess::new(model, rate)?))
    }

    /// Whether requests are paced by a generator.
    #[must_use]
    pub fn is_paced(&self) -> bool {
        matches!(self, Self::Paced(_))
    }
}

impl Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saturating => f.write_str("saturating"),
            Self::Paced(process) => {
                write!(f, "paced at {}/s ({})", process.rate(), process.model())
            }
        }
    }
}

/// What a worker does when the program faults during a call.
///
/// Invocation errors (the harness and program disagree on how to call it) always end the run,
/// regardless of this policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum FaultPolicy {
    /// Count the request as failed and keep serving.
    #[default]
    Continue,

    /// Stop the whole run and report the fault.
    Abort,
}

impl Display for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
        })
    }
}

impl FromStr for FaultPolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            _ => Err(ConfigurationError::InvalidChoice {
                option: "--on-fault",
                value: s.to_string(),
                expected: "continue, abort",
            }),
        }
    }
}

/// Settings for one run of a [`WorkerPool`][crate::WorkerPool].
///
/// # Example
///
/// ```
/// use invoke_bench::{ArrivalModel, LoadMode, PoolConfig, Recycle};
/// use new_zealand::nz;
///
/// let config = PoolConfig::builder()
///     .threads(nz!(4))
///     .load(LoadMode::paced(1000.0, ArrivalModel::Exponential)?)
///     .recycle(Recycle::INSTANCE_PER_CALL)
///     .record_latency(true)
///     .build();
///
/// assert_eq!(config.threads().get(), 4);
/// assert!(config.load().is_paced());
/// # Ok::<(), invoke_bench::ConfigurationError>(())
/// ```
#[derive(Clone, Debug)]
pub struct PoolConfig {
    threads: NonZero<usize>,
    load: LoadMode,
    recycle: Recycle,
    record_latency: bool,
    fault_policy: FaultPolicy,
    wait: WaitStrategy,
    queue_capacity: QueueCapacity,
    max_samples_per_worker: NonZero<usize>,
    seed: Option<u64>,
}

impl PoolConfig {
    /// Creates a builder starting from the default settings.
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> NonZero<usize> {
        self.threads
    }

    /// Where the load comes from.
    #[must_use]
    pub fn load(&self) -> &LoadMode {
        &self.load
    }

    /// When workers replace their program instance.
    #[must_use]
    pub fn recycle(&self) -> Recycle {
        self.recycle
    }

    /// Whether per-call latency samples are kept for the report.
    #[must_use]
    pub fn record_latency(&self) -> bool {
        self.record_latency
    }

    /// What happens when the program faults.
    #[must_use]
    pub fn fault_policy(&self) -> FaultPolicy {
        self.fault_policy
    }

    /// How idle workers wait for requests.
    #[must_use]
    pub fn wait(&self) -> WaitStrategy {
        self.wait
    }

    /// Capacity of each worker's request queue.
    #[must_use]
    pub fn queue_capacity(&self) -> QueueCapacity {
        self.queue_capacity
    }

    /// Most latency samples a single worker keeps; later samples are only counted.
    #[must_use]
    pub fn max_samples_per_worker(&self) -> NonZero<usize> {
        self.max_samples_per_worker
    }

    /// Seed for the generator's random numbers, `None` to seed from the operating system.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for a [`PoolConfig`].
#[derive(Debug)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    fn new() -> Self {
        Self {
            config: PoolConfig {
                threads: nz!(1),
                load: LoadMode::Saturating,
                recycle: Recycle::Never,
                record_latency: false,
                fault_policy: FaultPolicy::Continue,
                wait: WaitStrategy::Spin,
                queue_capacity: QueueCapacity::Unbounded,
                max_samples_per_worker: DEFAULT_MAX_SAMPLES_PER_WORKER,
                seed: None,
            },
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Default is 1.
    #[must_use]
    pub fn threads(mut self, threads: NonZero<usize>) -> Self {
        self.config.threads = threads;
        self
    }

    /// Sets where the load comes from.
    ///
    /// Default is [`LoadMode::Saturating`].
    #[must_use]
    pub fn load(mut self, load: LoadMode) -> Self {
        self.config.load = load;
        self
    }

    /// Sets when workers replace their program instance.
    ///
    /// Default is [`Recycle::Never`].
    #[must_use]
    pub fn recycle(mut self, recycle: Recycle) -> Self {
        self.config.recycle = recycle;
        self
    }

    /// Sets whether per-call latency samples are kept.
    ///
    /// Default is `false`.
    #[must_use]
    pub fn record_latency(mut self, record_latency: bool) -> Self {
        self.config.record_latency = record_latency;
        self
    }

    /// Sets what happens when the program faults.
    ///
    /// Default is [`FaultPolicy::Continue`].
    #[must_use]
    pub fn fault_policy(mut self, fault_policy: FaultPolicy) -> Self {
        self.config.fault_policy = fault_policy;
        self
    }

    /// Sets how idle workers wait for requests.
    ///
    /// Default is [`WaitStrategy::Spin`].
    #[must_use]
    pub fn wait(mut self, wait: WaitStrategy) -> Self {
        self.config.wait = wait;
        self
    }

    /// Sets the capacity of each worker's request queue.
    ///
    /// Default is [`QueueCapacity::Unbounded`].
    #[must_use]
    pub fn queue_capacity(mut self, queue_capacity: QueueCapacity) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    /// Sets the most latency samples a single worker keeps.
    ///
    /// Default is 4 000 000.
    #[must_use]
    pub fn max_samples_per_worker(mut self, max_samples: NonZero<usize>) -> Self {
        self.config.max_samples_per_worker = max_samples;
        self
    }

    /// Makes the generator's gaps and queue choices reproducible.
    ///
    /// Default is to seed from the operating system.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> PoolConfig {
        self.config
    }
}
