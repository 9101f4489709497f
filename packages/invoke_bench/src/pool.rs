//! Pool lifecycle: starting workers and the generator, stopping them and aggregating results.

use std::any::type_name;
use std::fmt;
use std::mem;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::generator::{GeneratorStats, RequestGenerator};
use crate::wait::BLOCK_TIMEOUT;
use crate::worker::{Worker, WorkerOutcome};
use crate::{
    Abort, Call, Executable, LatencyDistribution, LoadMode, PoolConfig, Report, RequestReceiver,
    RequestSender, WorkerSummary, channel,
};

/// A set of worker threads that call one executable under a configured load.
///
/// The pool is created with its queues already allocated, so the generator can never observe a
/// worker without a queue. Threads only exist between [`start()`][Self::start] and
/// [`RunningPool::stop()`]; they run inside a [`std::thread::scope`], so every thread is joined
/// on every exit path, including panics.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use invoke_bench::{Call, NativeProgram, PoolConfig, WorkerPool};
/// use new_zealand::nz;
///
/// let program = NativeProgram::new();
/// let call = Call::new("add", [77, 88]);
/// let config = PoolConfig::builder().threads(nz!(2)).build();
///
/// let mut pool = WorkerPool::new(&program, &call, config);
/// let report = pool.run_for(Duration::from_millis(50));
///
/// assert_eq!(report.threads(), 2);
/// assert!(report.processed() > 0);
/// ```
pub struct WorkerPool<'a, E>
where
    E: Executable,
{
    executable: &'a E,
    call: &'a Call,
    config: PoolConfig,
    senders: Vec<RequestSender>,
    receivers: Vec<RequestReceiver>,
    shutdown: AtomicBool,
}

impl<'a, E> WorkerPool<'a, E>
where
    E: Executable,
{
    /// Creates a pool and allocates one request queue per worker when the load is paced.
    #[must_use]
    pub fn new(executable: &'a E, call: &'a Call, config: PoolConfig) -> Self {
        let (senders, receivers) = if config.load().is_paced() {
            (0..config.threads().get())
                .map(|_| channel(config.queue_capacity()))
                .unzip()
        } else {
            (Vec::new(), Vec::new())
        };

        Self {
            executable,
            call,
            config,
            senders,
            receivers,
            shutdown: AtomicBool::new(false),
        }
    }

    /// The configuration the pool runs with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Starts every worker inside `scope`, waits until each has its instance ready, then starts
    /// the generator if the load is paced.
    ///
    /// The observation window begins once all workers are ready, so instance setup is never
    /// measured. Requests left over from an earlier run are discarded.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn a thread.
    pub fn start<'scope, 'env>(
        &'env mut self,
        scope: &'scope Scope<'scope, 'env>,
    ) -> RunningPool<'scope> {
        self.shutdown.store(false, Ordering::Release);

        for receiver in &self.receivers {
            while receiver.try_recv().is_some() {}
        }

        let this: &'env Self = self;
        let threads = this.config.threads().get();

        info!(
            threads,
            load = %this.config.load(),
            recycle = %this.config.recycle(),
            "starting run"
        );

        let start = Arc::new(Barrier::new(threads.saturating_add(1)));

        let workers = (0..threads)
            .map(|index| {
                let start = Arc::clone(&start);

                thread::Builder::new()
                    .name(format!("invoke-bench-worker-{index}"))
                    .spawn_scoped(scope, move || {
                        Worker::new(
                            index,
                            this.executable,
                            this.call,
                            &this.config,
                            &this.shutdown,
                        )
                        .run(&start, this.receivers.get(index))
                    })
                    .expect("failed to spawn worker thread: thread spawn failure is not supported")
            })
            .collect();

        start.wait();
        let started = Instant::now();

        debug!(threads, "all workers ready");

        let generator = match this.config.load() {
            LoadMode::Saturating => None,
            LoadMode::Paced(process) => Some(
                thread::Builder::new()
                    .name("invoke-bench-generator".to_string())
                    .spawn_scoped(scope, move || {
                        RequestGenerator::new(
                            process,
                            &this.senders,
                            this.config.wait(),
                            this.config.seed(),
                        )
                        .run(started, &this.shutdown)
                    })
                    .expect(
                        "failed to spawn generator thread: thread spawn failure is not supported",
                    ),
            ),
        };

        RunningPool {
            threads,
            load: this.config.load().clone(),
            record_latency: this.config.record_latency(),
            shutdown: &this.shutdown,
            receivers: &this.receivers,
            started,
            generator,
            workers,
        }
    }

    /// Runs the pool for `window` and returns the report.
    ///
    /// The run ends early if a worker aborts it.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any worker or generator thread.
    #[must_use]
    pub fn run_for(&mut self, window: Duration) -> Report {
        thread::scope(|scope| {
            let running = self.start(scope);
            running.wait(window);
            running.stop()
        })
    }
}

impl<E> fmt::Debug for WorkerPool<'_, E>
where
    E: Executable,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("call", self.call)
            .field("config", &self.config)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// A started [`WorkerPool`]. Stop it with [`stop()`][Self::stop] to obtain the report.
///
/// Dropping a running pool without stopping it raises the shutdown signal, so the enclosing
/// scope can join every thread.
pub struct RunningPool<'scope> {
    threads: usize,
    load: LoadMode,
    record_latency: bool,
    shutdown: &'scope AtomicBool,
    receivers: &'scope [RequestReceiver],
    started: Instant,
    generator: Option<ScopedJoinHandle<'scope, GeneratorStats>>,
    workers: Vec<ScopedJoinHandle<'scope, WorkerOutcome>>,
}

impl RunningPool<'_> {
    /// When every worker was ready and measurement began.
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Whether a worker has ended the run early.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Blocks until `window` has passed since the start or the run was ended early.
    ///
    /// Returns `true` if the full window passed.
    #[cfg_attr(test, mutants::skip)] // Mutations make the observation window never end.
    pub fn wait(&self, window: Duration) -> bool {
        let deadline = self.started.checked_add(window);

        loop {
            if self.is_shutting_down() {
                return false;
            }

            let remaining = deadline.map_or(BLOCK_TIMEOUT, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });

            if remaining.is_zero() {
                return true;
            }

            thread::sleep(remaining.min(BLOCK_TIMEOUT));
        }
    }

    /// Signals shutdown, joins the generator and then every worker, and aggregates the report.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any worker or generator thread.
    #[must_use]
    pub fn stop(mut self) -> Report {
        // Release pairs with the Acquire loads in every worker and the generator.
        self.shutdown.store(true, Ordering::Release);
        let elapsed = self.started.elapsed();

        // The generator goes first so nothing is enqueued after the workers stop.
        let generator = self.generator.take().map(join).unwrap_or_default();
        let outcomes: Vec<WorkerOutcome> = mem::take(&mut self.workers)
            .into_iter()
            .map(join)
            .collect();

        let mut workers = Vec::with_capacity(outcomes.len());
        let mut service = Vec::new();
        let mut response = Vec::new();
        let mut unrecorded: u64 = 0;
        let mut abort = None;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            // Nothing is enqueued once the generator has been joined, so what is left in a
            // queue now stays unprocessed.
            let unprocessed = self.receivers.get(index).map_or(0, RequestReceiver::len);

            workers.push(WorkerSummary {
                unprocessed: u64::try_from(unprocessed).unwrap_or(u64::MAX),
                ..outcome.summary
            });
            service.extend(outcome.service_nanos);
            response.extend(outcome.response_nanos);
            unrecorded = unrecorded.saturating_add(outcome.unrecorded);

            if abort.is_none() {
                abort = outcome
                    .abort
                    .map(|error| Abort::new(outcome.summary.worker(), error));
            }
        }

        let report = Report {
            threads: self.threads,
            load: self.load.clone(),
            elapsed,
            workers,
            generated: generator.generated,
            rejected: generator.rejected,
            service_latency: self
                .record_latency
                .then(|| LatencyDistribution::from_nanos(service)),
            response_time: (self.record_latency && self.load.is_paced())
                .then(|| LatencyDistribution::from_nanos(response)),
            unrecorded,
            abort,
        };

        info!(
            processed = report.processed(),
            failed = report.failed(),
            elapsed = ?report.elapsed(),
            aborted = report.abort().is_some(),
            "run stopped"
        );

        report
    }
}

impl Drop for RunningPool<'_> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl fmt::Debug for RunningPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("threads", &self.threads)
            .field("load", &self.load)
            .field("started", &self.started)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(value) => value,
        // A panic in a pool thread is a bug in the harness or the executable. Propagate it so
        // the failure is not silently turned into a short run.
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::{ArrivalModel, CallError, NativeProgram, QueueCapacity};

    #[test]
    fn saturating_run_reports_every_worker() {
        let program = NativeProgram::new();
        let call = Call::new("add", [77, 88]);
        let config = PoolConfig::builder().threads(nz!(3)).build();

        let report = WorkerPool::new(&program, &call, config).run_for(Duration::from_millis(50));

        assert_eq!(report.threads(), 3);
        assert_eq!(report.workers().len(), 3);

        for (index, worker) in report.workers().iter().enumerate() {
            assert_eq!(worker.worker(), index);
            assert!(worker.processed() > 0);
        }

        assert_eq!(report.generated(), 0);
        assert!(report.service_latency().is_none());
        assert!(report.abort().is_none());
    }

    #[test]
    fn paced_run_accounts_for_every_request() {
        let program = NativeProgram::new();
        let call = Call::new("add", [77, 88]);
        let config = PoolConfig::builder()
            .threads(nz!(2))
            .load(LoadMode::paced(2000.0, ArrivalModel::Exponential).unwrap())
            .record_latency(true)
            .seed(17)
            .build();

        let report = WorkerPool::new(&program, &call, config).run_for(Duration::from_millis(100));

        assert!(report.generated() > 0);
        assert_eq!(report.rejected(), 0);
        assert_eq!(
            report.generated(),
            report.processed() + report.failed() + report.unprocessed()
        );

        let service = report.service_latency().unwrap();
        let response = report.response_time().unwrap();
        assert_eq!(service.len() as u64, report.processed());
        assert_eq!(response.len() as u64, report.processed());
    }

    #[test]
    fn bounded_queues_report_rejections() {
        /// Takes a long time per call so queues back up.
        #[derive(Debug)]
        struct Slow;

        impl Executable for Slow {
            type Instance = ();

            fn instantiate(&self) -> Result<(), CallError> {
                Ok(())
            }

            fn invoke(&self, _instance: &mut (), _call: &Call) -> Result<i64, CallError> {
                thread::sleep(Duration::from_millis(20));
                Ok(0)
            }
        }

        let call = Call::new("slow", []);
        let config = PoolConfig::builder()
            .load(LoadMode::paced(2000.0, ArrivalModel::Constant).unwrap())
            .queue_capacity(QueueCapacity::Bounded(nz!(4)))
            .build();

        let report = WorkerPool::new(&Slow, &call, config).run_for(Duration::from_millis(100));

        assert!(report.rejected() > 0);
        assert!(report.unprocessed() <= 4);
        assert_eq!(
            report.generated(),
            report.processed() + report.rejected() + report.unprocessed()
        );
    }

    #[test]
    fn abort_ends_run_early() {
        let program = NativeProgram::new();
        let call = Call::new("missing", []);
        let config = PoolConfig::builder().threads(nz!(2)).build();

        let started = Instant::now();
        let report = WorkerPool::new(&program, &call, config).run_for(Duration::from_secs(60));

        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(report.processed(), 0);
        assert!(report.abort().is_some());
        assert!(report.to_string().contains("is not exported"));
    }

    #[test]
    fn pool_can_run_twice() {
        let program = NativeProgram::new();
        let call = Call::new("add", [1, 2]);
        let mut pool = WorkerPool::new(&program, &call, PoolConfig::default());

        let first = pool.run_for(Duration::from_millis(10));
        let second = pool.run_for(Duration::from_millis(10));

        assert!(first.processed() > 0);
        assert!(second.processed() > 0);
    }

    #[test]
    fn dropping_running_pool_releases_threads() {
        let program = NativeProgram::new();
        let call = Call::new("add", [1, 2]);
        let config = PoolConfig::builder()
            .threads(nz!(2))
            .load(LoadMode::paced(100.0, ArrivalModel::Exponential).unwrap())
            .build();
        let mut pool = WorkerPool::new(&program, &call, config);

        // If dropping did not signal shutdown the scope would never return.
        thread::scope(|scope| {
            let running = pool.start(scope);
            thread::sleep(Duration::from_millis(10));
            drop(running);
        });
    }

    #[test]
    #[should_panic(expected = "executable panicked")]
    fn worker_panic_is_propagated() {
        #[derive(Debug)]
        struct Panicky;

        impl Executable for Panicky {
            type Instance = ();

            fn instantiate(&self) -> Result<(), CallError> {
                Ok(())
            }

            fn invoke(&self, _instance: &mut (), _call: &Call) -> Result<i64, CallError> {
                panic!("executable panicked");
            }
        }

        let call = Call::new("boom", []);
        let mut pool = WorkerPool::new(&Panicky, &call, PoolConfig::default());
        let _report = pool.run_for(Duration::from_millis(10));
    }
}
