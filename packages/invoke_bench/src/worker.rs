//! Worker thread logic: serving requests and measuring each call.

use std::hint;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::executable::Recycler;
use crate::metrics::{INSTANCE_RECYCLES, INVOCATION_FAULTS, SERVICE_TIME_US};
use crate::{
    Call, CallError, Executable, FaultPolicy, PoolConfig, Request, RequestReceiver, WorkerSummary,
};

/// Sample buffers start this large and grow on demand up to the configured cap.
const INITIAL_SAMPLE_CAPACITY: usize = 64 * 1024;

/// Everything a worker produced, handed back to the pool when the worker exits.
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
    pub(crate) summary: WorkerSummary,
    pub(crate) service_nanos: Vec<u64>,
    pub(crate) response_nanos: Vec<u64>,
    pub(crate) unrecorded: u64,
    pub(crate) abort: Option<CallError>,
}

/// What happened to one request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Served {
    Completed,
    Faulted,
    Aborted,
}

/// One worker thread's state. Owns its instance, counters and sample logs exclusively.
#[derive(Debug)]
pub(crate) struct Worker<'a, E>
where
    E: Executable,
{
    index: usize,
    executable: &'a E,
    call: &'a Call,
    config: &'a PoolConfig,
    shutdown: &'a AtomicBool,
    recycler: Recycler,
    outcome: WorkerOutcome,
    record_response: bool,
}

impl<'a, E> Worker<'a, E>
where
    E: Executable,
{
    pub(crate) fn new(
        index: usize,
        executable: &'a E,
        call: &'a Call,
        config: &'a PoolConfig,
        shutdown: &'a AtomicBool,
    ) -> Self {
        let record_latency = config.record_latency();
        let record_response = record_latency && config.load().is_paced();
        let sample_capacity = if record_latency {
            config.max_samples_per_worker().get().min(INITIAL_SAMPLE_CAPACITY)
        } else {
            0
        };

        Self {
            index,
            executable,
            call,
            config,
            shutdown,
            recycler: Recycler::new(config.recycle()),
            outcome: WorkerOutcome {
                summary: WorkerSummary {
                    worker: index,
                    processed: 0,
                    failed: 0,
                    recycles: 0,
                    unprocessed: 0,
                },
                service_nanos: Vec::with_capacity(sample_capacity),
                response_nanos: Vec::with_capacity(if record_response {
                    sample_capacity
                } else {
                    0
                }),
                unrecorded: 0,
                abort: None,
            },
            record_response,
        }
    }

    /// Prepares an instance, waits at `start` for the rest of the pool, then serves until
    /// shutdown.
    ///
    /// With a `receiver` the worker serves paced requests from its queue; without one it calls
    /// the executable back-to-back.
    pub(crate) fn run(
        mut self,
        start: &Barrier,
        receiver: Option<&RequestReceiver>,
    ) -> WorkerOutcome {
        let instance = self.executable.instantiate();

        // Every worker must reach the barrier, even one that failed to instantiate, or the
        // pool would wait forever.
        start.wait();

        let mut instance = match instance {
            Ok(instance) => instance,
            Err(error) => {
                self.abort(error);
                return self.outcome;
            }
        };

        debug!(worker = self.index, paced = receiver.is_some(), "worker started");

        match receiver {
            Some(receiver) => self.serve_paced(&mut instance, receiver),
            None => self.serve_saturating(&mut instance),
        }

        debug!(
            worker = self.index,
            processed = self.outcome.summary.processed,
            failed = self.outcome.summary.failed,
            "worker stopped"
        );

        self.outcome
    }

    fn serve_saturating(&mut self, instance: &mut E::Instance) {
        // Acquire pairs with the Release in the pool's shutdown signal.
        while !self.shutdown.load(Ordering::Acquire) {
            if self.serve(instance, None) == Served::Aborted {
                break;
            }
        }
    }

    fn serve_paced(&mut self, instance: &mut E::Instance, receiver: &RequestReceiver) {
        // A request that was already dequeued is always served, so shutdown is only checked
        // before waiting for the next one.
        while !self.shutdown.load(Ordering::Acquire) {
            let Some(request) = receiver.recv(self.config.wait(), self.shutdown) else {
                break;
            };

            if self.serve(instance, Some(request)) == Served::Aborted {
                break;
            }
        }
    }

    /// Makes one measured call. Recycling due before the call is part of the measured span.
    fn serve(&mut self, instance: &mut E::Instance, request: Option<Request>) -> Served {
        let begin = Instant::now();

        let result = self
            .recycler
            .prepare(self.executable, instance)
            .and_then(|recycled| {
                if recycled {
                    self.outcome.summary.recycles = self.outcome.summary.recycles.wrapping_add(1);
                    INSTANCE_RECYCLES.with(|event| event.observe_once());
                }

                self.executable.invoke(instance, self.call)
            });

        let end = Instant::now();

        match result {
            Ok(value) => {
                hint::black_box(value);
                self.outcome.summary.processed = self.outcome.summary.processed.wrapping_add(1);

                if self.config.record_latency() {
                    self.record(end.saturating_duration_since(begin), request, end);
                }

                Served::Completed
            }
            Err(error)
                if error.is_fault() && self.config.fault_policy() == FaultPolicy::Continue =>
            {
                if self.outcome.summary.failed == 0 {
                    warn!(
                        worker = self.index,
                        %error,
                        "program faulted, counting as failed and continuing"
                    );
                }

                self.outcome.summary.failed = self.outcome.summary.failed.wrapping_add(1);
                INVOCATION_FAULTS.with(|event| event.observe_once());
                Served::Faulted
            }
            Err(error) => {
                if error.is_fault() {
                    self.outcome.summary.failed = self.outcome.summary.failed.wrapping_add(1);
                    INVOCATION_FAULTS.with(|event| event.observe_once());
                }

                self.abort(error);
                Served::Aborted
            }
        }
    }

    fn record(&mut self, service: Duration, request: Option<Request>, end: Instant) {
        SERVICE_TIME_US.with(|event| event.observe(saturating_u64(service.as_micros())));

        if self.outcome.service_nanos.len() >= self.config.max_samples_per_worker().get() {
            self.outcome.unrecorded = self.outcome.unrecorded.wrapping_add(1);
            return;
        }

        self.outcome
            .service_nanos
            .push(saturating_u64(service.as_nanos()));

        if let Some(request) = request.filter(|_| self.record_response) {
            let response = end.saturating_duration_since(request.issued());
            self.outcome
                .response_nanos
                .push(saturating_u64(response.as_nanos()));
        }
    }

    fn abort(&mut self, error: CallError) {
        error!(worker = self.index, %error, "aborting run");

        // Release pairs with the Acquire loads of every other thread in the pool.
        self.shutdown.store(true, Ordering::Release);
        self.outcome.abort = Some(error);
    }
}

fn saturating_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use new_zealand::nz;

    use super::*;
    use crate::{
        ArrivalModel, ExecutionFault, InvocationError, LoadMode, NativeProgram, QueueCapacity,
        Recycle, channel,
    };

    /// Faults on every second call made on an instance.
    #[derive(Debug)]
    struct FlakyProgram;

    impl Executable for FlakyProgram {
        type Instance = u64;

        fn instantiate(&self) -> Result<u64, CallError> {
            Ok(0)
        }

        fn invoke(&self, instance: &mut u64, _call: &Call) -> Result<i64, CallError> {
            *instance += 1;

            if *instance % 2 == 0 {
                Err(ExecutionFault::new("even call").into())
            } else {
                Ok(1)
            }
        }
    }

    /// Cannot be instantiated at all.
    #[derive(Debug)]
    struct BrokenProgram;

    impl Executable for BrokenProgram {
        type Instance = ();

        fn instantiate(&self) -> Result<(), CallError> {
            Err(InvocationError::Instantiation {
                message: "no memory".to_string(),
            }
            .into())
        }

        fn invoke(&self, _instance: &mut (), _call: &Call) -> Result<i64, CallError> {
            Ok(0)
        }
    }

    fn run_saturating<E: Executable>(
        executable: &E,
        call: &Call,
        config: &PoolConfig,
        window: Duration,
    ) -> WorkerOutcome {
        let shutdown = AtomicBool::new(false);
        let start = Barrier::new(1);

        thread::scope(|s| {
            let handle = s.spawn(|| {
                Worker::new(0, executable, call, config, &shutdown).run(&start, None)
            });

            thread::sleep(window);
            shutdown.store(true, Ordering::Release);
            handle.join().unwrap()
        })
    }

    #[test]
    fn saturating_worker_counts_calls_and_samples() {
        let config = PoolConfig::builder().record_latency(true).build();
        let outcome = run_saturating(
            &NativeProgram::new(),
            &Call::new("add", [77, 88]),
            &config,
            Duration::from_millis(20),
        );

        assert!(outcome.summary.processed > 0);
        assert_eq!(outcome.summary.failed, 0);
        assert_eq!(
            outcome.service_nanos.len() as u64 + outcome.unrecorded,
            outcome.summary.processed
        );
        assert!(outcome.response_nanos.is_empty());
        assert!(outcome.abort.is_none());
    }

    #[test]
    fn sample_cap_counts_the_rest_as_unrecorded() {
        let config = PoolConfig::builder()
            .record_latency(true)
            .max_samples_per_worker(nz!(10))
            .build();
        let outcome = run_saturating(
            &NativeProgram::new(),
            &Call::new("add", [1, 2]),
            &config,
            Duration::from_millis(20),
        );

        assert_eq!(outcome.service_nanos.len(), 10);
        assert_eq!(outcome.unrecorded + 10, outcome.summary.processed);
    }

    #[test]
    fn faults_are_counted_when_continuing() {
        let outcome = run_saturating(
            &FlakyProgram,
            &Call::new("anything", []),
            &PoolConfig::default(),
            Duration::from_millis(20),
        );

        assert!(outcome.abort.is_none());
        assert!(outcome.summary.failed > 0);
        assert!(outcome.summary.processed.abs_diff(outcome.summary.failed) <= 1);
    }

    #[test]
    fn faults_abort_when_configured() {
        let config = PoolConfig::builder().fault_policy(FaultPolicy::Abort).build();
        let outcome = run_saturating(
            &FlakyProgram,
            &Call::new("anything", []),
            &config,
            Duration::from_secs(10),
        );

        assert_eq!(outcome.summary.processed, 1);
        assert_eq!(outcome.summary.failed, 1);
        assert!(outcome.abort.unwrap().is_fault());
    }

    #[test]
    fn invocation_errors_always_abort() {
        let shutdown = AtomicBool::new(false);
        let start = Barrier::new(1);
        let config = PoolConfig::default();
        let call = Call::new("missing", []);
        let program = NativeProgram::new();

        let outcome = Worker::new(0, &program, &call, &config, &shutdown).run(&start, None);

        assert!(shutdown.load(Ordering::Acquire));
        assert_eq!(outcome.summary.processed, 0);
        assert_eq!(outcome.summary.failed, 0);
        assert!(!outcome.abort.unwrap().is_fault());
    }

    #[test]
    fn failed_instantiation_still_reaches_barrier() {
        let shutdown = AtomicBool::new(false);
        let start = Barrier::new(2);
        let config = PoolConfig::default();
        let call = Call::new("add", [1, 2]);

        let outcome = thread::scope(|s| {
            let handle = s.spawn(|| {
                Worker::new(0, &BrokenProgram, &call, &config, &shutdown).run(&start, None)
            });

            start.wait();
            handle.join().unwrap()
        });

        assert!(shutdown.load(Ordering::Acquire));
        assert!(matches!(
            outcome.abort,
            Some(CallError::Invocation(InvocationError::Instantiation { .. }))
        ));
    }

    #[test]
    fn paced_worker_serves_queued_requests_and_records_response_time() {
        let config = PoolConfig::builder()
            .load(LoadMode::paced(1000.0, ArrivalModel::Constant).unwrap())
            .record_latency(true)
            .build();
        let (sender, receiver) = channel(QueueCapacity::Unbounded);
        let shutdown = AtomicBool::new(false);
        let start = Barrier::new(1);
        let call = Call::new("add", [77, 88]);
        let program = NativeProgram::new();

        for sequence in 0..50 {
            sender.try_send(Request::new(sequence)).unwrap();
        }

        let outcome = thread::scope(|s| {
            let handle = s.spawn(|| {
                Worker::new(0, &program, &call, &config, &shutdown).run(&start, Some(&receiver))
            });

            // Wait for the queue to drain, then stop.
            while !receiver.is_empty() {
                thread::yield_now();
            }

            shutdown.store(true, Ordering::Release);
            handle.join().unwrap()
        });

        assert_eq!(outcome.summary.processed, 50);
        assert_eq!(outcome.response_nanos.len(), 50);

        // Response time includes service time, sample by sample.
        for (response, service) in outcome.response_nanos.iter().zip(&outcome.service_nanos) {
            assert!(response >= service);
        }
    }

    #[test]
    fn recycling_is_counted() {
        let config = PoolConfig::builder()
            .recycle(Recycle::CONTEXT_PER_CALL)
            .build();
        let outcome = run_saturating(
            &NativeProgram::new(),
            &Call::new("bump", []),
            &config,
            Duration::from_millis(20),
        );

        assert!(outcome.summary.processed > 1);
        assert_eq!(outcome.summary.recycles + 1, outcome.summary.processed);
    }
}
