//! Wait queue shared between the interrupt path and blocked callers.
//!
//! The interrupt side only bumps a generation counter and notifies; waiters
//! re-evaluate their own predicate against ring and device state. The counter
//! mutex is held just long enough to increment it, never across hardware work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, Deadline};

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

fn lock(m: &Mutex<u64>) -> MutexGuard<'_, u64> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter so it re-checks its condition.
    pub fn wake_all(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Block until `ready` holds, the deadline passes, or `cancel` fires.
    ///
    /// Only a cancellation raised after the wait begins counts; a stale one
    /// left on the token is discarded on entry.
    ///
    /// `slice` bounds each individual sleep so deadlines measured on an
    /// injected clock are noticed even when nothing wakes the queue.
    pub fn wait_until<F>(
        &self,
        clock: &dyn Clock,
        deadline: Option<Deadline>,
        slice: Duration,
        cancel: Option<&CancelToken>,
        mut ready: F,
    ) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let mut generation = lock(&self.generation);
        if let Some(token) = cancel {
            token.take();
        }
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            if let Some(token) = cancel {
                if token.take() {
                    return WaitOutcome::Cancelled;
                }
            }
            if deadline.is_some_and(|d| d.expired(clock)) {
                return WaitOutcome::TimedOut;
            }

            let seen = *generation;
            let (guard, _) = self
                .cond
                .wait_timeout_while(generation, slice, |g| {
                    *g == seen && !cancel.is_some_and(CancelToken::is_cancelled)
                })
                .unwrap_or_else(PoisonError::into_inner);
            generation = guard;
        }
    }
}

/// One-shot interruption of a blocked wait, usable from any thread.
///
/// Cancelling wakes the queue; a wait in progress consumes the flag and
/// returns [`WaitOutcome::Cancelled`]. Cancelling with nobody waiting has no
/// effect on later waits.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    queue: Arc<WaitQueue>,
}

impl CancelToken {
    pub fn new(queue: Arc<WaitQueue>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            queue,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.queue.wake_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consume a pending cancellation.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_ready_immediately() {
        let queue = WaitQueue::new();
        let clock = ManualClock::new();
        let outcome = queue.wait_until(&clock, None, Duration::from_millis(5), None, || true);
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[test]
    fn test_wake_from_other_thread() {
        let queue = Arc::new(WaitQueue::new());
        let value = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                value.store(1, Ordering::Release);
                queue.wake_all();
            })
        };

        let clock = MonotonicClock::new();
        let deadline = Deadline::after(&clock, Duration::from_secs(5));
        let outcome = queue.wait_until(&clock, Some(deadline), Duration::from_secs(1), None, || {
            value.load(Ordering::Acquire) == 1
        });
        assert_eq!(outcome, WaitOutcome::Ready);
        producer.join().unwrap();
    }

    #[test]
    fn test_deadline_on_manual_clock() {
        let queue = WaitQueue::new();
        let clock = ManualClock::ticking(Duration::from_secs(1));
        let deadline = Deadline::after(&clock, Duration::from_secs(10));
        let outcome = queue.wait_until(
            &clock,
            Some(deadline),
            Duration::from_millis(1),
            None,
            || false,
        );
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_cancel_unblocks_and_is_consumed() {
        let queue = Arc::new(WaitQueue::new());
        let token = CancelToken::new(Arc::clone(&queue));

        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                token.cancel();
            })
        };

        let clock = MonotonicClock::new();
        let outcome = queue.wait_until(&clock, None, Duration::from_secs(5), Some(&token), || false);
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(!token.is_cancelled());
        canceller.join().unwrap();
    }

    #[test]
    fn test_stale_cancel_does_not_cut_next_wait_short() {
        let queue = Arc::new(WaitQueue::new());
        let token = CancelToken::new(Arc::clone(&queue));
        token.cancel();

        let clock = ManualClock::ticking(Duration::from_secs(1));
        let deadline = Deadline::after(&clock, Duration::from_secs(3));
        let outcome = queue.wait_until(
            &clock,
            Some(deadline),
            Duration::from_millis(1),
            Some(&token),
            || false,
        );
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(!token.is_cancelled());
    }
}
