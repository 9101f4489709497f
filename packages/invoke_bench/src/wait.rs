//! How threads wait for work or for the next arrival.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{hint, thread};

use crate::ConfigurationError;

/// How an idle worker waits for its next request.
///
/// Busy polling gives the lowest wake-up latency at the cost of a fully occupied processor per
/// worker, which is what a latency benchmark wants. The other strategies trade latency variance
/// for CPU time when the harness shares the machine with other work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum WaitStrategy {
    /// Poll the queue in a tight loop.
    #[default]
    Spin,

    /// Spin briefly, then yield the processor, then sleep for exponentially growing periods.
    Backoff,

    /// Sleep until the producer signals a new request, waking periodically to observe shutdown.
    Block,
}

impl WaitStrategy {
    /// Waits until `deadline`, returning early with `false` if `shutdown` is raised meanwhile.
    ///
    /// Used for pacing arrivals. Spinning checks the deadline continuously; the other strategies
    /// sleep through the coarse part of the wait in slices no longer than [`BLOCK_TIMEOUT`] and
    /// spin only for the final stretch, so short gaps stay precise.
    pub(crate) fn wait_until(self, deadline: Instant, shutdown: &AtomicBool) -> bool {
        loop {
            // Acquire pairs with the Release in the pool's shutdown signal.
            if shutdown.load(Ordering::Acquire) {
                return false;
            }

            let now = Instant::now();

            let Some(remaining) = deadline.checked_duration_since(now).filter(|r| !r.is_zero())
            else {
                return true;
            };

            match self {
                Self::Spin => hint::spin_loop(),
                Self::Backoff | Self::Block => {
                    if remaining > SPIN_THRESHOLD {
                        thread::sleep(
                            remaining
                                .saturating_sub(SPIN_THRESHOLD)
                                .min(BLOCK_TIMEOUT),
                        );
                    } else {
                        hint::spin_loop();
                    }
                }
            }
        }
    }
}

/// Longest period a blocked thread sleeps before rechecking the shutdown flag.
pub(crate) const BLOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// Remaining waits shorter than this are spun through rather than slept through, as the
/// operating system cannot reliably wake a thread with finer precision.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

impl Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spin => "spin",
            Self::Backoff => "backoff",
            Self::Block => "block",
        })
    }
}

impl FromStr for WaitStrategy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spin" => Ok(Self::Spin),
            "backoff" => Ok(Self::Backoff),
            "block" => Ok(Self::Block),
            _ => Err(ConfigurationError::InvalidChoice {
                option: "--wait",
                value: s.to_string(),
                expected: "spin, backoff, block",
            }),
        }
    }
}

/// Exponential backoff: spin, then yield, then sleep with a doubling period.
#[derive(Debug)]
pub(crate) struct Backoff {
    iterations: u32,
    current_sleep: Duration,
}

impl Backoff {
    const SPIN_ITERATIONS: u32 = 64;
    const YIELD_ITERATIONS: u32 = 64;
    const MIN_SLEEP: Duration = Duration::from_micros(50);
    const MAX_SLEEP: Duration = Duration::from_millis(1);

    pub(crate) fn new() -> Self {
        Self {
            iterations: 0,
            current_sleep: Self::MIN_SLEEP,
        }
    }

    /// Performs one backoff step. Each call waits at least as long as the previous one.
    pub(crate) fn snooze(&mut self) {
        self.iterations = self.iterations.saturating_add(1);

        if self.iterations <= Self::SPIN_ITERATIONS {
            hint::spin_loop();
        } else if self.iterations <= Self::SPIN_ITERATIONS.saturating_add(Self::YIELD_ITERATIONS) {
            thread::yield_now();
        } else {
            thread::sleep(self.current_sleep);
            self.current_sleep = self.current_sleep.saturating_mul(2).min(Self::MAX_SLEEP);
        }
    }

    /// Whether the backoff has progressed to sleeping.
    #[cfg(test)]
    fn is_sleeping(&self) -> bool {
        self.iterations > Self::SPIN_ITERATIONS.saturating_add(Self::YIELD_ITERATIONS)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn parses_every_strategy() {
        for strategy in [WaitStrategy::Spin, WaitStrategy::Backoff, WaitStrategy::Block] {
            assert_eq!(strategy.to_string().parse::<WaitStrategy>(), Ok(strategy));
        }

        assert_eq!("BLOCK".parse::<WaitStrategy>(), Ok(WaitStrategy::Block));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let error = "nap".parse::<WaitStrategy>().unwrap_err();
        assert!(matches!(error, ConfigurationError::InvalidChoice { option: "--wait", .. }));
    }

    #[test]
    fn wait_until_reaches_deadline() {
        let shutdown = AtomicBool::new(false);

        for strategy in [WaitStrategy::Spin, WaitStrategy::Backoff, WaitStrategy::Block] {
            let deadline = Instant::now() + Duration::from_millis(2);
            assert!(strategy.wait_until(deadline, &shutdown));
            assert!(Instant::now() >= deadline);
        }
    }

    #[test]
    fn wait_until_gives_up_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let deadline = Instant::now() + Duration::from_secs(3600);

        for strategy in [WaitStrategy::Spin, WaitStrategy::Backoff, WaitStrategy::Block] {
            assert!(!strategy.wait_until(deadline, &shutdown));
        }
    }

    #[test]
    fn past_deadline_returns_immediately() {
        let shutdown = AtomicBool::new(false);
        assert!(WaitStrategy::Spin.wait_until(Instant::now(), &shutdown));
    }

    #[test]
    fn backoff_escalates_to_sleeping() {
        let mut backoff = Backoff::new();

        for _ in 0..Backoff::SPIN_ITERATIONS + Backoff::YIELD_ITERATIONS {
            backoff.snooze();
        }
        assert!(!backoff.is_sleeping());

        backoff.snooze();
        assert!(backoff.is_sleeping());
        assert_eq!(backoff.current_sleep, Backoff::MIN_SLEEP * 2);
    }
}
