//! Interrupt bridge: co-processor signals to ring and state updates.
//!
//! Runs in whatever context delivers the hardware event. It never takes the
//! session lock and never blocks: ring access is a `try_read`, state changes
//! are compare-and-swap, and waking waiters is a counter bump.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, TryLockError};

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::device::Shared;
use crate::error::CaptureError;
use crate::ring::BufferState;
use crate::state::{CaptureState, TriggerMode};

/// The two event lines the co-processor raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Signal {
    /// The buffer at the write cursor is full.
    BufferReady,
    /// Configuration latched, or capture finished. Which one depends on device state.
    CaptureComplete,
}

/// What a signal did, for tests and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    BufferRetired {
        index: usize,
        /// Slot handed back to the co-processor, or None at the end of a oneshot pass.
        rearmed: Option<usize>,
    },
    ConfigAck,
    CaptureFinished {
        prior: CaptureState,
        released_session: bool,
    },
    /// No ring to act on.
    Spurious,
    Violation {
        signal: Signal,
        state: CaptureState,
    },
}

impl IrqOutcome {
    pub fn into_error(self) -> Option<CaptureError> {
        match self {
            Self::Violation { signal, state } => {
                Some(CaptureError::ProtocolViolation { signal, state })
            }
            _ => None,
        }
    }
}

/// Counters updated from the interrupt path.
#[derive(Debug, Default)]
pub struct IrqStats {
    pub buffers_ready: AtomicU64,
    /// Buffers retired while a stop request was outstanding.
    pub buffers_after_stop: AtomicU64,
    pub config_acks: AtomicU64,
    pub completions: AtomicU64,
    pub spurious: AtomicU64,
    pub violations: AtomicU64,
}

/// Cloneable handle given to whatever delivers co-processor interrupts.
#[derive(Clone)]
pub struct InterruptBridge {
    shared: Arc<Shared>,
}

impl InterruptBridge {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn raise(&self, signal: Signal) -> IrqOutcome {
        let outcome = match signal {
            Signal::BufferReady => self.on_buffer_ready(),
            Signal::CaptureComplete => self.on_capture_complete(),
        };
        trace!(?signal, ?outcome, "interrupt handled");
        outcome
    }

    pub fn stats(&self) -> &IrqStats {
        &self.shared.stats
    }

    fn on_buffer_ready(&self) -> IrqOutcome {
        let shared = &*self.shared;
        let ring = match shared.ring.try_read() {
            Ok(slot) => slot.clone(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().clone(),
            // ring is being replaced; nothing is capturing into it
            Err(TryLockError::WouldBlock) => None,
        };
        let Some(ring) = ring else {
            shared.stats.spurious.fetch_add(1, Ordering::Relaxed);
            warn!("buffer-ready with no ring");
            return IrqOutcome::Spurious;
        };

        let index = ring.write_cursor();
        ring.buffer(index).set_state(BufferState::Unmapped);

        let next = ring.next_index(index);
        let oneshot = TriggerMode::from_u8(shared.trigger.load(Ordering::Acquire)) == TriggerMode::Oneshot;
        let rearmed = if oneshot && next == 0 {
            None
        } else {
            ring.set_write_cursor(next);
            ring.buffer(next).set_state(BufferState::Mapped);
            Some(next)
        };

        shared.stats.buffers_ready.fetch_add(1, Ordering::Relaxed);
        if shared.state.get() == CaptureState::RequestStop {
            shared.stats.buffers_after_stop.fetch_add(1, Ordering::Relaxed);
        }
        shared.waiters.wake_all();
        IrqOutcome::BufferRetired { index, rearmed }
    }

    fn on_capture_complete(&self) -> IrqOutcome {
        let shared = &*self.shared;
        let result = shared.state.update(|state| {
            state
                .is_capturing()
                .then_some(CaptureState::Initialized)
        });

        let outcome = match result {
            Ok(prior) => {
                let oneshot = TriggerMode::from_u8(shared.trigger.load(Ordering::Acquire))
                    == TriggerMode::Oneshot;
                // No stop call follows a oneshot pass that ended on its own.
                let released_session = oneshot
                    && prior == CaptureState::Running
                    && shared.session.release_session();
                shared.stats.completions.fetch_add(1, Ordering::Relaxed);
                debug!(%prior, released_session, "capture complete");
                IrqOutcome::CaptureFinished {
                    prior,
                    released_session,
                }
            }
            Err(CaptureState::Armed) => {
                shared.stats.config_acks.fetch_add(1, Ordering::Relaxed);
                debug!("configuration acknowledged");
                IrqOutcome::ConfigAck
            }
            Err(state) => {
                shared.state.set(CaptureState::Error);
                shared.stats.violations.fetch_add(1, Ordering::Relaxed);
                error!(%state, "capture-complete signal in unexpected state");
                IrqOutcome::Violation {
                    signal: Signal::CaptureComplete,
                    state,
                }
            }
        };

        shared.waiters.wake_all();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Shared;
    use crate::ring::{BufferRing, HostDma};

    fn shared_with_ring(count: usize, trigger: TriggerMode, state: CaptureState) -> Arc<Shared> {
        let shared = Arc::new(Shared::new());
        let ring = BufferRing::allocate(&HostDma::new(), count * 64, 64, 16).unwrap();
        shared.install_ring(Some(Arc::new(ring)));
        shared.trigger.store(trigger as u8, Ordering::Release);
        shared.state.set(state);
        shared
    }

    fn states(shared: &Shared) -> Vec<BufferState> {
        shared
            .ring()
            .unwrap()
            .iter()
            .map(|b| b.state())
            .collect()
    }

    #[test]
    fn test_buffer_ready_retires_and_rearms() {
        let shared = shared_with_ring(3, TriggerMode::Continuous, CaptureState::Running);
        let bridge = InterruptBridge::new(Arc::clone(&shared));

        assert_eq!(
            bridge.raise(Signal::BufferReady),
            IrqOutcome::BufferRetired { index: 0, rearmed: Some(1) }
        );
        assert_eq!(
            states(&shared),
            vec![BufferState::Unmapped, BufferState::Mapped, BufferState::Mapped]
        );
        assert_eq!(shared.ring().unwrap().write_cursor(), 1);
    }

    #[test]
    fn test_continuous_wraps_and_recycles_head() {
        let shared = shared_with_ring(2, TriggerMode::Continuous, CaptureState::Running);
        let bridge = InterruptBridge::new(Arc::clone(&shared));

        bridge.raise(Signal::BufferReady);
        let outcome = bridge.raise(Signal::BufferReady);
        assert_eq!(outcome, IrqOutcome::BufferRetired { index: 1, rearmed: Some(0) });
        assert_eq!(states(&shared), vec![BufferState::Mapped, BufferState::Unmapped]);
    }

    #[test]
    fn test_oneshot_last_buffer_not_rearmed() {
        let shared = shared_with_ring(2, TriggerMode::Oneshot, CaptureState::Running);
        let bridge = InterruptBridge::new(Arc::clone(&shared));

        bridge.raise(Signal::BufferReady);
        let outcome = bridge.raise(Signal::BufferReady);
        assert_eq!(outcome, IrqOutcome::BufferRetired { index: 1, rearmed: None });
        assert_eq!(states(&shared), vec![BufferState::Unmapped, BufferState::Unmapped]);
        assert_eq!(shared.ring().unwrap().write_cursor(), 1);
    }

    #[test]
    fn test_complete_in_armed_is_config_ack() {
        let shared = shared_with_ring(2, TriggerMode::Oneshot, CaptureState::Armed);
        let bridge = InterruptBridge::new(Arc::clone(&shared));
        assert_eq!(bridge.raise(Signal::CaptureComplete), IrqOutcome::ConfigAck);
        assert_eq!(shared.state.get(), CaptureState::Armed);
    }

    #[test]
    fn test_complete_in_disabled_is_violation() {
        let shared = Arc::new(Shared::new());
        let bridge = InterruptBridge::new(Arc::clone(&shared));
        let outcome = bridge.raise(Signal::CaptureComplete);
        assert!(matches!(
            outcome.into_error(),
            Some(CaptureError::ProtocolViolation {
                signal: Signal::CaptureComplete,
                state: CaptureState::Disabled
            })
        ));
        assert_eq!(shared.state.get(), CaptureState::Error);
        assert_eq!(bridge.stats().violations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_oneshot_completion_releases_session() {
        let shared = shared_with_ring(2, TriggerMode::Oneshot, CaptureState::Running);
        shared.session.try_acquire().unwrap().into_session();
        let bridge = InterruptBridge::new(Arc::clone(&shared));

        assert_eq!(
            bridge.raise(Signal::CaptureComplete),
            IrqOutcome::CaptureFinished {
                prior: CaptureState::Running,
                released_session: true
            }
        );
        assert_eq!(shared.state.get(), CaptureState::Initialized);
        assert!(!shared.session.is_held());
    }

    #[test]
    fn test_continuous_completion_leaves_session_to_stop() {
        let shared = shared_with_ring(2, TriggerMode::Continuous, CaptureState::RequestStop);
        shared.session.try_acquire().unwrap().into_session();
        let bridge = InterruptBridge::new(Arc::clone(&shared));

        let outcome = bridge.raise(Signal::CaptureComplete);
        assert_eq!(
            outcome,
            IrqOutcome::CaptureFinished {
                prior: CaptureState::RequestStop,
                released_session: false
            }
        );
        assert!(shared.session.in_session());
    }

    #[test]
    fn test_buffer_ready_without_ring_is_spurious() {
        let shared = Arc::new(Shared::new());
        let bridge = InterruptBridge::new(shared);
        assert_eq!(bridge.raise(Signal::BufferReady), IrqOutcome::Spurious);
    }
}
