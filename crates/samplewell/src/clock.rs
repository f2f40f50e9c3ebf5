//! Injectable monotonic time source.
//!
//! Every deadline in the crate (command handshake, stop wait, read timeout) is
//! measured against a `Clock` rather than `Instant::now()` directly, so tests can
//! drive time forward without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time since an arbitrary origin.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Duration;
}

/// Wall clock backed by `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for tests.
///
/// Time only moves through [`advance`](Self::advance), or by `step` on every
/// read when built with [`ticking`](Self::ticking). A ticking clock makes any
/// deadline loop terminate after a predictable number of polls.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    step: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticking(step: Duration) -> Self {
        let clock = Self::new();
        clock.set_step(step);
        clock
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_step(&self, step: Duration) {
        self.step.store(step.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        let step = self.step.load(Ordering::SeqCst);
        let nanos = self.nanos.fetch_add(step, Ordering::SeqCst);
        Duration::from_nanos(nanos)
    }
}

/// Deadline measured on a `Clock`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Duration,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout: Duration) -> Self {
        Self {
            at: clock.now().saturating_add(timeout),
        }
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.at
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.at.saturating_sub(clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[test]
    fn test_ticking_clock_steps_per_read() {
        let clock = ManualClock::ticking(Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(clock.now(), Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_deadline_expiry() {
        let clock = ManualClock::new();
        let deadline = Deadline::after(&clock, Duration::from_secs(10));
        assert!(!deadline.expired(&clock));

        clock.advance(Duration::from_secs(9));
        assert_eq!(deadline.remaining(&clock), Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        assert!(deadline.expired(&clock));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now() > a);
    }
}
