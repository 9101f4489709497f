//! Single-producer/single-consumer request queues connecting the generator to the workers.

use std::any::type_name;
use std::fmt::{self, Display};
use std::hint;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::{ArrayQueue, SegQueue};
use event_listener::{Event, Listener};

use crate::wait::{BLOCK_TIMEOUT, Backoff};
use crate::{Request, WaitStrategy};

/// How many requests a worker queue can hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueCapacity {
    /// The queue grows as needed. If workers fall behind, memory use grows without limit.
    #[default]
    Unbounded,

    /// The queue holds at most this many requests; further requests are rejected.
    Bounded(NonZero<usize>),
}

impl Display for QueueCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Bounded(capacity) => write!(f, "{capacity}"),
        }
    }
}

enum Storage {
    Unbounded(SegQueue<Request>),
    Bounded(ArrayQueue<Request>),
}

struct Shared {
    storage: Storage,

    // Signaled after every push, for receivers that block instead of polling.
    ready: Event,
}

impl Shared {
    fn pop(&self) -> Option<Request> {
        match &self.storage {
            Storage::Unbounded(queue) => queue.pop(),
            Storage::Bounded(queue) => queue.pop(),
        }
    }

    fn len(&self) -> usize {
        match &self.storage {
            Storage::Unbounded(queue) => queue.len(),
            Storage::Bounded(queue) => queue.len(),
        }
    }
}

/// Creates a request queue and returns its two ends.
///
/// Neither end can be cloned, so exactly one producer and one consumer ever touch the queue.
/// Requests are delivered in the order they were sent.
///
/// # Example
///
/// ```
/// use invoke_bench::{QueueCapacity, Request, channel};
///
/// let (sender, receiver) = channel(QueueCapacity::Unbounded);
///
/// sender.try_send(Request::new(0)).unwrap();
/// sender.try_send(Request::new(1)).unwrap();
///
/// assert_eq!(receiver.try_recv().map(|r| r.sequence()), Some(0));
/// assert_eq!(receiver.try_recv().map(|r| r.sequence()), Some(1));
/// assert!(receiver.try_recv().is_none());
/// ```
#[must_use]
pub fn channel(capacity: QueueCapacity) -> (RequestSender, RequestReceiver) {
    let storage = match capacity {
        QueueCapacity::Unbounded => Storage::Unbounded(SegQueue::new()),
        QueueCapacity::Bounded(capacity) => Storage::Bounded(ArrayQueue::new(capacity.get())),
    };

    let shared = Arc::new(Shared {
        storage,
        ready: Event::new(),
    });

    (
        RequestSender {
            shared: Arc::clone(&shared),
        },
        RequestReceiver { shared },
    )
}

/// The producing end of a request queue.
pub struct RequestSender {
    shared: Arc<Shared>,
}

impl RequestSender {
    /// Enqueues a request without blocking.
    ///
    /// # Errors
    ///
    /// Returns the request back if the queue is bounded and full.
    pub fn try_send(&self, request: Request) -> Result<(), Request> {
        match &self.shared.storage {
            Storage::Unbounded(queue) => queue.push(request),
            Storage::Bounded(queue) => queue.push(request)?,
        }

        self.shared.ready.notify(1);
        Ok(())
    }
}

impl fmt::Debug for RequestSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.shared.len())
            .finish_non_exhaustive()
    }
}

/// The consuming end of a request queue.
pub struct RequestReceiver {
    shared: Arc<Shared>,
}

impl RequestReceiver {
    /// Dequeues the oldest request, or returns `None` if the queue is empty.
    #[must_use]
    pub fn try_recv(&self) -> Option<Request> {
        self.shared.pop()
    }

    /// Waits for the next request using `strategy`.
    ///
    /// Returns `None` once `shutdown` is raised and the queue is empty at the moment it is
    /// checked. Requests already in the queue are still handed out after shutdown is raised, one
    /// per call, so callers decide whether to drain.
    #[must_use]
    pub fn recv(&self, strategy: WaitStrategy, shutdown: &AtomicBool) -> Option<Request> {
        let mut backoff = Backoff::new();

        loop {
            if let Some(request) = self.shared.pop() {
                return Some(request);
            }

            // Acquire pairs with the Release in the pool's shutdown signal.
            if shutdown.load(Ordering::Acquire) {
                return None;
            }

            match strategy {
                WaitStrategy::Spin => hint::spin_loop(),
                WaitStrategy::Backoff => backoff.snooze(),
                WaitStrategy::Block => {
                    let listener = self.shared.ready.listen();

                    // Re-check after registering the listener to avoid lost wakeups.
                    if self.shared.len() > 0 || shutdown.load(Ordering::Acquire) {
                        continue;
                    }

                    // A timeout is not an error: it is the cue to look at the shutdown flag.
                    let _woken = listener.wait_timeout(BLOCK_TIMEOUT);
                }
            }
        }
    }

    /// Number of requests waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether no requests are waiting in the queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.len() == 0
    }
}

impl fmt::Debug for RequestReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.shared.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(RequestSender: Send, Sync);
    assert_impl_all!(RequestReceiver: Send, Sync);
    assert_not_impl_any!(RequestSender: Clone);
    assert_not_impl_any!(RequestReceiver: Clone);

    #[test]
    fn delivers_in_fifo_order() {
        let (sender, receiver) = channel(QueueCapacity::Unbounded);

        for sequence in 0..100 {
            sender.try_send(Request::new(sequence)).unwrap();
        }

        assert_eq!(receiver.len(), 100);

        let received: Vec<u64> = std::iter::from_fn(|| receiver.try_recv())
            .map(|request| request.sequence())
            .collect();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert!(receiver.is_empty());
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let (sender, receiver) = channel(QueueCapacity::Bounded(nz!(2)));

        sender.try_send(Request::new(0)).unwrap();
        sender.try_send(Request::new(1)).unwrap();

        let rejected = sender.try_send(Request::new(2)).unwrap_err();
        assert_eq!(rejected.sequence(), 2);

        assert_eq!(receiver.try_recv().map(|r| r.sequence()), Some(0));
        sender.try_send(Request::new(3)).unwrap();
    }

    #[test]
    fn recv_returns_pending_request_even_after_shutdown() {
        let (sender, receiver) = channel(QueueCapacity::Unbounded);
        let shutdown = AtomicBool::new(true);

        for strategy in [WaitStrategy::Spin, WaitStrategy::Backoff, WaitStrategy::Block] {
            sender.try_send(Request::new(5)).unwrap();
            assert_eq!(
                receiver.recv(strategy, &shutdown).map(|r| r.sequence()),
                Some(5)
            );
        }
    }

    #[test]
    fn recv_returns_none_on_shutdown_when_empty() {
        let (_sender, receiver) = channel(QueueCapacity::Unbounded);
        let shutdown = AtomicBool::new(true);

        for strategy in [WaitStrategy::Spin, WaitStrategy::Backoff, WaitStrategy::Block] {
            assert!(receiver.recv(strategy, &shutdown).is_none());
        }
    }

    #[test]
    fn blocked_receiver_wakes_on_send() {
        let (sender, receiver) = channel(QueueCapacity::Unbounded);
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            let consumer = s.spawn(|| receiver.recv(WaitStrategy::Block, &shutdown));

            thread::sleep(Duration::from_millis(20));
            sender.try_send(Request::new(9)).unwrap();

            assert_eq!(consumer.join().unwrap().map(|r| r.sequence()), Some(9));
        });
    }

    #[test]
    fn blocked_receiver_observes_shutdown_within_timeout() {
        let (_sender, receiver) = channel(QueueCapacity::Unbounded);
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            let consumer = s.spawn(|| receiver.recv(WaitStrategy::Block, &shutdown));

            thread::sleep(Duration::from_millis(20));
            let raised_at = Instant::now();
            shutdown.store(true, Ordering::Release);

            assert!(consumer.join().unwrap().is_none());
            assert!(raised_at.elapsed() < Duration::from_secs(5));
        });
    }
}
