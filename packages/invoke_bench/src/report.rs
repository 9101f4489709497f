//! Aggregated results of one run.

use std::fmt::{self, Display};
use std::num::NonZero;
use std::time::Duration;

use crate::{CallError, LoadMode};

/// Sorted latency samples with order-statistic accessors.
///
/// Samples are nanoseconds. Sorting happens once, when the distribution is built at the end of
/// a run, never while measuring.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use invoke_bench::LatencyDistribution;
///
/// let latencies = LatencyDistribution::from_nanos((1..=10).rev().collect());
///
/// assert_eq!(latencies.p50(), Some(Duration::from_nanos(5)));
/// assert_eq!(latencies.p90(), Some(Duration::from_nanos(9)));
/// assert_eq!(latencies.max(), Some(Duration::from_nanos(10)));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LatencyDistribution {
    sorted_nanos: Box<[u64]>,
}

impl LatencyDistribution {
    /// Builds a distribution from unsorted nanosecond samples.
    #[must_use]
    pub fn from_nanos(mut samples: Vec<u64>) -> Self {
        samples.sort_unstable();

        Self {
            sorted_nanos: samples.into_boxed_slice(),
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sorted_nanos.len()
    }

    /// Whether there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted_nanos.is_empty()
    }

    /// The sample at rank ⌈p/100 · n⌉ in ascending order, with rank 0 rounded up to 1.
    ///
    /// `p` is resolved to a thousandth of a percent. Returns `None` if there are no samples or
    /// `p` is outside `0..=100`.
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if !(0.0..=100.0).contains(&p) {
            return None;
        }

        // Integer arithmetic keeps ranks exact: 0.9 · 10 must be rank 9, not 10.
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "p is within 0..=100, so the scaled value fits comfortably"
        )]
        let p_thousandths = (p * 1000.0).round() as u128;

        let count = u128::try_from(self.sorted_nanos.len()).ok()?;
        let rank = p_thousandths.saturating_mul(count).div_ceil(100_000).max(1);
        let index = usize::try_from(rank.checked_sub(1)?).ok()?;

        self.sorted_nanos
            .get(index)
            .copied()
            .map(Duration::from_nanos)
    }

    /// Median.
    #[must_use]
    pub fn p50(&self) -> Option<Duration> {
        self.percentile(50.0)
    }

    /// 90th percentile.
    #[must_use]
    pub fn p90(&self) -> Option<Duration> {
        self.percentile(90.0)
    }

    /// 99th percentile.
    #[must_use]
    pub fn p99(&self) -> Option<Duration> {
        self.percentile(99.0)
    }

    /// Smallest sample.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        self.sorted_nanos.first().copied().map(Duration::from_nanos)
    }

    /// Largest sample.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        self.sorted_nanos.last().copied().map(Duration::from_nanos)
    }

    /// Arithmetic mean, rounded down to whole nanoseconds.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        let count = NonZero::new(u128::try_from(self.sorted_nanos.len()).ok()?)?;
        let total: u128 = self.sorted_nanos.iter().copied().map(u128::from).sum();
        let mean = u64::try_from(total / count).ok()?;

        Some(Duration::from_nanos(mean))
    }

    /// All samples in ascending order, in nanoseconds.
    #[must_use]
    pub fn as_nanos(&self) -> &[u64] {
        &self.sorted_nanos
    }
}

impl Display for LatencyDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = |value: Option<Duration>| value.map_or(0, |duration| duration.as_nanos());

        write!(
            f,
            "p50 {} ns, p90 {} ns, p99 {} ns, max {} ns ({} samples)",
            nanos(self.p50()),
            nanos(self.p90()),
            nanos(self.p99()),
            nanos(self.max()),
            self.len()
        )
    }
}

/// What one worker did during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSummary {
    pub(crate) worker: usize,
    pub(crate) processed: u64,
    pub(crate) failed: u64,
    pub(crate) recycles: u64,
    pub(crate) unprocessed: u64,
}

impl WorkerSummary {
    /// Zero-based index of the worker.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Successful calls made by the worker.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Calls that ended in an execution fault.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Instance or context replacements made by the recycling policy.
    #[must_use]
    pub fn recycles(&self) -> u64 {
        self.recycles
    }

    /// Requests still waiting in the worker's queue when the run ended.
    #[must_use]
    pub fn unprocessed(&self) -> u64 {
        self.unprocessed
    }
}

/// Why a run ended before its observation window was over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Abort {
    worker: usize,
    error: CallError,
}

impl Abort {
    pub(crate) fn new(worker: usize, error: CallError) -> Self {
        Self { worker, error }
    }

    /// Zero-based index of the worker that hit the error.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// The error that ended the run.
    #[must_use]
    pub fn error(&self) -> &CallError {
        &self.error
    }
}

impl Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} aborted the run: {}", self.worker, self.error)
    }
}

/// Results of one run of a [`WorkerPool`][crate::WorkerPool], produced once when it stops.
#[derive(Clone, Debug)]
pub struct Report {
    pub(crate) threads: usize,
    pub(crate) load: LoadMode,
    pub(crate) elapsed: Duration,
    pub(crate) workers: Vec<WorkerSummary>,
    pub(crate) generated: u64,
    pub(crate) rejected: u64,
    pub(crate) service_latency: Option<LatencyDistribution>,
    pub(crate) response_time: Option<LatencyDistribution>,
    pub(crate) unrecorded: u64,
    pub(crate) abort: Option<Abort>,
}

impl Report {
    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Where the load came from.
    #[must_use]
    pub fn load(&self) -> &LoadMode {
        &self.load
    }

    /// Time from the moment every worker was ready until shutdown was raised.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Successful calls, summed over all workers.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(WorkerSummary::processed).sum()
    }

    /// Calls that ended in an execution fault, summed over all workers.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.workers.iter().map(WorkerSummary::failed).sum()
    }

    /// Per-worker breakdown, ordered by worker index.
    #[must_use]
    pub fn workers(&self) -> &[WorkerSummary] {
        &self.workers
    }

    /// Requests issued by the generator. Zero under saturating load.
    #[must_use]
    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Requests dropped because a bounded queue was full.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Requests left in worker queues when the run ended.
    #[must_use]
    pub fn unprocessed(&self) -> u64 {
        self.workers.iter().map(WorkerSummary::unprocessed).sum()
    }

    /// Successful calls per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();

        if seconds == 0.0 {
            return 0.0;
        }

        #[expect(
            clippy::cast_precision_loss,
            reason = "precision loss acceptable for rate display"
        )]
        let processed = self.processed() as f64;

        processed / seconds
    }

    /// Wall time divided by the number of successful calls.
    ///
    /// With several workers this is the aggregate cost of one call to the whole pool, not the
    /// latency of a single call.
    #[must_use]
    pub fn mean_time_per_iteration(&self) -> Option<Duration> {
        let nanos = self
            .elapsed
            .as_nanos()
            .checked_div(u128::from(self.processed()))?;

        u64::try_from(nanos).ok().map(Duration::from_nanos)
    }

    /// Time spent inside each call (including any recycling it triggered), if recorded.
    #[must_use]
    pub fn service_latency(&self) -> Option<&LatencyDistribution> {
        self.service_latency.as_ref()
    }

    /// Time from each request's scheduled arrival to the end of its call, if recorded under
    /// paced load.
    #[must_use]
    pub fn response_time(&self) -> Option<&LatencyDistribution> {
        self.response_time.as_ref()
    }

    /// Successful calls whose latency was not stored because a worker hit its sample cap.
    #[must_use]
    pub fn unrecorded(&self) -> u64 {
        self.unrecorded
    }

    /// Why the run ended early, if it did.
    #[must_use]
    pub fn abort(&self) -> Option<&Abort> {
        self.abort.as_ref()
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let per_iteration = self.mean_time_per_iteration().unwrap_or(Duration::ZERO);

        writeln!(
            f,
            "{} threads: {per_iteration:?} per iteration ({:.0} iters/second) - ran for {:?}",
            self.threads,
            self.throughput(),
            self.elapsed
        )?;

        write!(
            f,
            "load: {}, processed: {}, failed: {}",
            self.load,
            self.processed(),
            self.failed()
        )?;

        if self.load.is_paced() {
            write!(
                f,
                ", generated: {}, rejected: {}, unprocessed: {}",
                self.generated,
                self.rejected,
                self.unprocessed()
            )?;
        }

        if let Some(service) = &self.service_latency {
            write!(f, "\nservice latency: {service}")?;
        }

        if let Some(response) = &self.response_time {
            write!(f, "\nresponse time: {response}")?;
        }

        if self.unrecorded > 0 {
            write!(f, "\nunrecorded samples: {}", self.unrecorded)?;
        }

        if let Some(abort) = &self.abort {
            write!(f, "\n{abort}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::ExecutionFault;

    fn nanos(value: u64) -> Option<Duration> {
        Some(Duration::from_nanos(value))
    }

    fn summary(worker: usize, processed: u64, failed: u64) -> WorkerSummary {
        WorkerSummary {
            worker,
            processed,
            failed,
            recycles: 0,
            unprocessed: 0,
        }
    }

    fn report(elapsed: Duration, workers: Vec<WorkerSummary>) -> Report {
        Report {
            threads: workers.len(),
            load: LoadMode::Saturating,
            elapsed,
            workers,
            generated: 0,
            rejected: 0,
            service_latency: None,
            response_time: None,
            unrecorded: 0,
            abort: None,
        }
    }

    #[test]
    fn percentile_uses_ceiling_rank() {
        let latencies = LatencyDistribution::from_nanos((1..=10).collect());

        assert_eq!(latencies.percentile(0.0), nanos(1));
        assert_eq!(latencies.percentile(10.0), nanos(1));
        assert_eq!(latencies.percentile(11.0), nanos(2));
        assert_eq!(latencies.p50(), nanos(5));
        assert_eq!(latencies.p90(), nanos(9));
        assert_eq!(latencies.p99(), nanos(10));
        assert_eq!(latencies.percentile(100.0), nanos(10));
    }

    #[test]
    fn percentile_of_single_sample() {
        let latencies = LatencyDistribution::from_nanos(vec![42]);

        for p in [0.0, 50.0, 99.9, 100.0] {
            assert_eq!(latencies.percentile(p), nanos(42));
        }
    }

    #[test]
    fn percentile_rejects_out_of_range() {
        let latencies = LatencyDistribution::from_nanos(vec![1, 2, 3]);

        assert_eq!(latencies.percentile(-1.0), None);
        assert_eq!(latencies.percentile(100.1), None);
        assert_eq!(latencies.percentile(f64::NAN), None);
    }

    #[test]
    fn empty_distribution_has_no_statistics() {
        let latencies = LatencyDistribution::default();

        assert!(latencies.is_empty());
        assert_eq!(latencies.p50(), None);
        assert_eq!(latencies.min(), None);
        assert_eq!(latencies.max(), None);
        assert_eq!(latencies.mean(), None);
    }

    #[test]
    fn percentiles_are_ordered() {
        // A skewed distribution: mostly fast with a slow tail.
        let samples = (0..1000_u64).map(|i| if i % 97 == 0 { 50_000 + i } else { 100 + i % 7 });
        let latencies = LatencyDistribution::from_nanos(samples.collect());

        let p50 = latencies.p50().unwrap();
        let p90 = latencies.p90().unwrap();
        let p99 = latencies.p99().unwrap();
        let max = latencies.max().unwrap();

        assert!(latencies.min().unwrap() <= p50);
        assert!(p50 <= p90);
        assert!(p90 <= p99);
        assert!(p99 <= max);
    }

    #[test]
    fn mean_is_exact_for_large_values() {
        let latencies = LatencyDistribution::from_nanos(vec![u64::MAX, u64::MAX]);
        assert_eq!(latencies.mean(), nanos(u64::MAX));
    }

    #[test]
    fn totals_are_sums_of_workers() {
        let report = report(
            Duration::from_secs(2),
            vec![summary(0, 100, 1), summary(1, 300, 2)],
        );

        assert_eq!(report.processed(), 400);
        assert_eq!(report.failed(), 3);
        assert!((report.throughput() - 200.0).abs() < 1e-9);
        assert_eq!(report.mean_time_per_iteration(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn nothing_processed_has_no_time_per_iteration() {
        let report = report(Duration::from_secs(1), vec![summary(0, 0, 0)]);

        assert_eq!(report.mean_time_per_iteration(), None);
        assert!(report.throughput().abs() < f64::EPSILON);
    }

    #[test]
    fn display_starts_with_summary_line() {
        let mut report = report(Duration::from_secs(1), vec![summary(0, 1000, 0)]);
        report.abort = Some(Abort::new(0, ExecutionFault::new("boom").into()));

        let text = report.to_string();
        let mut lines = text.lines();

        assert_eq!(
            lines.next(),
            Some("1 threads: 1ms per iteration (1000 iters/second) - ran for 1s")
        );
        assert_eq!(lines.next(), Some("load: saturating, processed: 1000, failed: 0"));
        assert_eq!(
            lines.next(),
            Some("worker 0 aborted the run: program faulted: boom")
        );
    }
}
