//! Metrics for the load harness.
//!
//! The events are per-thread so that recording them never makes threads contend. They are
//! merged only when a report is collected, which the CLI does after a run with `--metrics`.

use nm::{Event, Magnitude};

/// Histogram buckets for service time in microseconds.
///
/// A trivial call into a reused instance completes in well under a microsecond, while a fresh
/// engine context per call costs tens to hundreds of microseconds.
const SERVICE_TIME_US_BUCKETS: &[Magnitude] =
    &[0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 10_000];

thread_local! {
    /// Requests issued by the generator, whether or not a queue accepted them.
    pub(crate) static REQUESTS_GENERATED: Event = Event::builder()
        .name("invoke_bench_requests_generated")
        .build();

    /// Requests dropped because the chosen bounded queue was full.
    pub(crate) static REQUESTS_REJECTED: Event = Event::builder()
        .name("invoke_bench_requests_rejected")
        .build();

    /// Calls that ended in an execution fault raised by the program.
    pub(crate) static INVOCATION_FAULTS: Event = Event::builder()
        .name("invoke_bench_invocation_faults")
        .build();

    /// Instance or context replacements performed by the recycling policy.
    pub(crate) static INSTANCE_RECYCLES: Event = Event::builder()
        .name("invoke_bench_instance_recycles")
        .build();

    /// Event for observing the service time of successful calls.
    ///
    /// The magnitude is the service time in microseconds. Only recorded when latency recording
    /// is enabled for the pool.
    pub(crate) static SERVICE_TIME_US: Event = Event::builder()
        .name("invoke_bench_service_time_us")
        .histogram(SERVICE_TIME_US_BUCKETS)
        .build();
}
