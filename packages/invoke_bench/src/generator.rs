//! The request generator driving paced load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::metrics::{REQUESTS_GENERATED, REQUESTS_REJECTED};
use crate::wait::BLOCK_TIMEOUT;
use crate::{ArrivalProcess, Request, RequestSender, WaitStrategy};

/// What the generator did during a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct GeneratorStats {
    pub(crate) generated: u64,
    pub(crate) rejected: u64,
}

/// Issues requests on an open arrival schedule and scatters them over the worker queues.
///
/// Arrival instants are computed on an absolute timeline (each one is the previous one plus a
/// fresh gap) so a late wake-up does not push back every later arrival. Each request is stamped
/// with its scheduled arrival instant, so response times include any lateness of the generator.
#[derive(Debug)]
pub(crate) struct RequestGenerator<'a> {
    process: &'a ArrivalProcess,
    senders: &'a [RequestSender],
    wait: WaitStrategy,
    rng: SmallRng,
}

impl<'a> RequestGenerator<'a> {
    pub(crate) fn new(
        process: &'a ArrivalProcess,
        senders: &'a [RequestSender],
        wait: WaitStrategy,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        };

        Self {
            process,
            senders,
            wait,
            rng,
        }
    }

    /// Generates requests until `shutdown` is raised.
    ///
    /// The first arrival is one gap after `start`.
    pub(crate) fn run(mut self, start: Instant, shutdown: &AtomicBool) -> GeneratorStats {
        let mut stats = GeneratorStats::default();

        if self.senders.is_empty() {
            return stats;
        }

        debug!(
            rate = self.process.rate(),
            model = %self.process.model(),
            queues = self.senders.len(),
            "generator started"
        );

        let mut next_arrival = start;

        loop {
            let gap = self.process.next_gap(&mut self.rng);

            let Some(arrival) = next_arrival.checked_add(gap) else {
                // The next arrival lies beyond what the clock can represent, so nothing more
                // arrives before shutdown.
                while !shutdown.load(Ordering::Acquire) {
                    thread::sleep(BLOCK_TIMEOUT);
                }
                break;
            };
            next_arrival = arrival;

            if !self.wait.wait_until(next_arrival, shutdown) {
                break;
            }

            let request = Request::issued_at(stats.generated, next_arrival);
            stats.generated = stats.generated.wrapping_add(1);
            REQUESTS_GENERATED.with(|event| event.observe_once());

            let queue = self.rng.random_range(0..self.senders.len());

            // The range excludes the length, so the index is always valid.
            let Some(sender) = self.senders.get(queue) else {
                continue;
            };

            if let Err(rejected) = sender.try_send(request) {
                trace!(sequence = rejected.sequence(), queue, "queue full, request rejected");
                stats.rejected = stats.rejected.wrapping_add(1);
                REQUESTS_REJECTED.with(|event| event.observe_once());
            }
        }

        debug!(
            generated = stats.generated,
            rejected = stats.rejected,
            "generator stopped"
        );

        stats
    }
}
