//! Device state, capture settings and the session lock.
//!
//! All three live in atomics so the interrupt path can read and update them
//! without taking a lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::error::{CaptureError, Result};

/// Lifecycle of one device. Ordering matters: everything up to `Armed` is
/// "configured but idle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum CaptureState {
    Disabled = 0,
    Initialized = 1,
    MemAllocd = 2,
    Armed = 3,
    Running = 4,
    RequestStop = 5,
    Error = 6,
}

impl CaptureState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Disabled,
            1 => Self::Initialized,
            2 => Self::MemAllocd,
            3 => Self::Armed,
            4 => Self::Running,
            5 => Self::RequestStop,
            _ => Self::Error,
        }
    }

    /// Co-processor is producing data.
    pub fn is_capturing(self) -> bool {
        matches!(self, Self::Running | Self::RequestStop)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Initialized => "initialized",
            Self::MemAllocd => "memalloc",
            Self::Armed => "armed",
            Self::Running => "running",
            Self::RequestStop => "request-stop",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Atomic holder for the authoritative device state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: CaptureState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> CaptureState {
        CaptureState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: CaptureState) -> CaptureState {
        CaptureState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Move `from -> to` only if the state is still `from`.
    pub fn transition(&self, from: CaptureState, to: CaptureState) -> std::result::Result<(), CaptureState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(CaptureState::from_u8)
    }

    /// Apply `f` atomically; `None` leaves the state untouched. Returns the prior state.
    pub fn update<F>(&self, mut f: F) -> std::result::Result<CaptureState, CaptureState>
    where
        F: FnMut(CaptureState) -> Option<CaptureState>,
    {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                f(CaptureState::from_u8(raw)).map(|s| s as u8)
            })
            .map(CaptureState::from_u8)
            .map_err(CaptureState::from_u8)
    }
}

/// Sample width. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum SampleUnit {
    /// 16 bits per sample.
    Wide = 0,
    /// 8 bits per sample.
    Narrow = 1,
}

impl SampleUnit {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Wide => 2,
            Self::Narrow => 1,
        }
    }
}

impl TryFrom<u32> for SampleUnit {
    type Error = CaptureError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Wide),
            1 => Ok(Self::Narrow),
            other => Err(CaptureError::InvalidArgument(format!(
                "sample unit {} (expected 0 = 16 bit, 1 = 8 bit)",
                other
            ))),
        }
    }
}

impl From<wellconf::SampleUnitSetting> for SampleUnit {
    fn from(setting: wellconf::SampleUnitSetting) -> Self {
        match setting {
            wellconf::SampleUnitSetting::Wide => Self::Wide,
            wellconf::SampleUnitSetting::Narrow => Self::Narrow,
        }
    }
}

/// Stop after one ring pass, or loop until told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum TriggerMode {
    Oneshot = 0,
    Continuous = 1,
}

impl TriggerMode {
    pub(crate) fn from_u8(raw: u8) -> Self {
        if raw == Self::Continuous as u8 {
            Self::Continuous
        } else {
            Self::Oneshot
        }
    }
}

impl TryFrom<u32> for TriggerMode {
    type Error = CaptureError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Oneshot),
            1 => Ok(Self::Continuous),
            other => Err(CaptureError::InvalidArgument(format!(
                "trigger flags {} (expected 0 = oneshot, 1 = continuous)",
                other
            ))),
        }
    }
}

impl From<wellconf::TriggerSetting> for TriggerMode {
    fn from(setting: wellconf::TriggerSetting) -> Self {
        match setting {
            wellconf::TriggerSetting::Oneshot => Self::Oneshot,
            wellconf::TriggerSetting::Continuous => Self::Continuous,
        }
    }
}

const LOCK_FREE: u8 = 0;
const LOCK_OP: u8 = 1;
const LOCK_SESSION: u8 = 2;
const LOCK_STOPPING: u8 = 3;

/// Per-device exclusion token.
///
/// Short configuration calls hold it for the duration of the call through an
/// [`OpGuard`]. A capture session converts the guard into a long hold that is
/// released by the stop path, or by the interrupt path when a oneshot capture
/// finishes on its own. Acquisition never blocks: contention is `Busy`.
#[derive(Debug, Default)]
pub struct SessionLock(AtomicU8);

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<OpGuard<'_>> {
        self.0
            .compare_exchange(LOCK_FREE, LOCK_OP, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| OpGuard { lock: self, armed: true })
            .map_err(|_| CaptureError::Busy)
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire) != LOCK_FREE
    }

    pub fn in_session(&self) -> bool {
        matches!(self.0.load(Ordering::Acquire), LOCK_SESSION | LOCK_STOPPING)
    }

    /// Take ownership of a running session for the stop sequence.
    pub(crate) fn claim_for_stop(&self) -> bool {
        self.0
            .compare_exchange(LOCK_SESSION, LOCK_STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release a session nobody is stopping. Safe from the interrupt path.
    pub(crate) fn release_session(&self) -> bool {
        self.0
            .compare_exchange(LOCK_SESSION, LOCK_FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// End of the stop sequence.
    pub(crate) fn release_stop(&self) {
        let _ = self
            .0
            .compare_exchange(LOCK_STOPPING, LOCK_FREE, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Held for one configuration call; released on drop unless promoted.
#[must_use]
pub struct OpGuard<'a> {
    lock: &'a SessionLock,
    armed: bool,
}

impl OpGuard<'_> {
    /// Keep the lock past this call as a capture session.
    pub(crate) fn into_session(mut self) {
        self.lock.0.store(LOCK_SESSION, Ordering::Release);
        self.armed = false;
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.0.store(LOCK_FREE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(CaptureState::Initialized <= CaptureState::Armed);
        assert!(CaptureState::Running > CaptureState::Armed);
        assert!(CaptureState::Running.is_capturing());
        assert!(!CaptureState::Armed.is_capturing());
    }

    #[test]
    fn test_transition_only_from_expected() {
        let cell = StateCell::new(CaptureState::Running);
        assert!(cell.transition(CaptureState::Running, CaptureState::RequestStop).is_ok());
        assert_eq!(
            cell.transition(CaptureState::Running, CaptureState::Initialized),
            Err(CaptureState::RequestStop)
        );
        assert_eq!(cell.get(), CaptureState::RequestStop);
    }

    #[test]
    fn test_update_reports_prior() {
        let cell = StateCell::new(CaptureState::Armed);
        let prior = cell
            .update(|s| (s == CaptureState::Armed).then_some(CaptureState::Running))
            .unwrap();
        assert_eq!(prior, CaptureState::Armed);
        assert!(cell.update(|_| None).is_err());
    }

    #[test]
    fn test_raw_settings_validation() {
        assert_eq!(SampleUnit::try_from(0).unwrap(), SampleUnit::Wide);
        assert!(SampleUnit::try_from(2).is_err());
        assert_eq!(TriggerMode::try_from(1).unwrap(), TriggerMode::Continuous);
        assert!(TriggerMode::try_from(2).is_err());
    }

    #[test]
    fn test_session_lock_busy() {
        let lock = SessionLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(matches!(lock.try_acquire(), Err(CaptureError::Busy)));
        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_session_survives_guard_and_releases_once() {
        let lock = SessionLock::new();
        lock.try_acquire().unwrap().into_session();
        assert!(lock.in_session());
        assert!(lock.try_acquire().is_err());

        assert!(lock.claim_for_stop());
        // a oneshot completion racing the stop must not double-release
        assert!(!lock.release_session());
        lock.release_stop();
        assert!(!lock.is_held());
    }
}
