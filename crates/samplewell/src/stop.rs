//! Stop sequence: ask nicely, then power-cycle.
//!
//! ```text
//!   request stop flag ──▶ RequestStop ──▶ wait for capture-complete
//!                                            │
//!              ┌─────────────────────────────┼──────────────────────────┐
//!              ▼                             ▼                          ▼
//!        completion seen              deadline passed                cancelled
//!        (Initialized)          halt sampler, coordinator       force Initialized
//!                               boot coordinator, sampler
//!                               ok: Initialized / err: Error
//! ```
//!
//! Every path releases the session lock.

use std::fmt;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Deadline;
use crate::device::LogicDevice;
use crate::error::{CaptureError, Result};
use crate::state::CaptureState;
use crate::wait::{CancelToken, WaitOutcome};

/// The two halves of the co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CoprocessorUnit {
    /// Talks to the host: commands, descriptors, signals.
    Coordinator,
    /// Runs the fixed-rate sampling loop.
    Sampler,
}

impl CoprocessorUnit {
    pub fn index(self) -> usize {
        match self {
            Self::Coordinator => 0,
            Self::Sampler => 1,
        }
    }
}

impl fmt::Display for CoprocessorUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Sampler => f.write_str("sampler"),
        }
    }
}

/// Power control over the co-processor units.
pub trait CoprocessorControl: Send + Sync {
    fn halt(&self, unit: CoprocessorUnit) -> Result<()>;
    fn boot(&self, unit: CoprocessorUnit) -> Result<()>;
}

/// Placeholder for platforms without power control; recovery always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoControl;

impl CoprocessorControl for NoControl {
    fn halt(&self, unit: CoprocessorUnit) -> Result<()> {
        Err(CaptureError::Control(format!("cannot halt {}: no power control", unit)))
    }

    fn boot(&self, unit: CoprocessorUnit) -> Result<()> {
        Err(CaptureError::Control(format!("cannot boot {}: no power control", unit)))
    }
}

/// How a stop call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopOutcome {
    /// No session was active.
    Idle,
    /// The co-processor acknowledged with a completion signal.
    Graceful,
    /// Deadline passed; both units were restarted.
    Recovered,
    /// Wait cancelled; state forced to Initialized without touching hardware.
    Interrupted,
}

pub(crate) fn run(device: &LogicDevice, cancel: Option<&CancelToken>) -> Result<StopOutcome> {
    let shared = device.shared();
    if !shared.session.claim_for_stop() {
        return Ok(StopOutcome::Idle);
    }

    let result = cooperative(device, cancel);

    shared.session.release_stop();
    shared.waiters.wake_all();
    match &result {
        Ok(outcome) => info!(?outcome, state = %shared.state.get(), "capture stopped"),
        Err(e) => error!(error = %e, "stop failed"),
    }
    result
}

fn cooperative(device: &LogicDevice, cancel: Option<&CancelToken>) -> Result<StopOutcome> {
    let shared = device.shared();

    if shared.state.get() == CaptureState::Running {
        device.stop_signal().request();
    }
    match shared
        .state
        .transition(CaptureState::Running, CaptureState::RequestStop)
    {
        Ok(()) | Err(CaptureState::RequestStop) => {}
        // completion landed first
        Err(CaptureState::Initialized) => return Ok(StopOutcome::Graceful),
        Err(CaptureState::Error) => {
            return Err(CaptureError::Faulted {
                last_error: device.last_error().0,
            })
        }
        Err(_) => return Ok(StopOutcome::Idle),
    }

    let clock = device.clock();
    let timeout = device.timing().stop_timeout();
    let deadline = Deadline::after(clock, timeout);
    let outcome = shared.waiters.wait_until(
        clock,
        Some(deadline),
        device.timing().wait_slice(),
        cancel,
        || shared.state.get() != CaptureState::RequestStop,
    );

    match outcome {
        WaitOutcome::Ready => match shared.state.get() {
            CaptureState::Error => Err(CaptureError::Faulted {
                last_error: device.last_error().0,
            }),
            _ => Ok(StopOutcome::Graceful),
        },
        WaitOutcome::Cancelled => {
            warn!("stop wait cancelled, forcing initialized without recovery");
            shared.state.set(CaptureState::Initialized);
            Ok(StopOutcome::Interrupted)
        }
        WaitOutcome::TimedOut => recover(device, timeout),
    }
}

fn power_cycle(device: &LogicDevice) -> Result<()> {
    let control = device.control();
    control.halt(CoprocessorUnit::Sampler)?;
    control.halt(CoprocessorUnit::Coordinator)?;
    control.boot(CoprocessorUnit::Coordinator)?;
    control.boot(CoprocessorUnit::Sampler)?;
    Ok(())
}

fn recover(device: &LogicDevice, timeout: std::time::Duration) -> Result<StopOutcome> {
    let shared = device.shared();
    warn!(?timeout, "co-processor did not stop, power cycling");

    match power_cycle(device) {
        Ok(()) => {
            shared.state.set(CaptureState::Initialized);
            info!("co-processor restarted");
            Ok(StopOutcome::Recovered)
        }
        Err(e) => {
            shared.state.set(CaptureState::Error);
            error!(error = %e, "co-processor restart failed");
            Err(CaptureError::HardwareWedged(timeout))
        }
    }
}
