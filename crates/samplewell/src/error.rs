//! Error taxonomy for the capture core.

use std::io;
use std::time::Duration;

use crate::context::Command;
use crate::irq::Signal;
use crate::state::CaptureState;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("co-processor did not acknowledge {command:?} within {waited:?} ({spins} polls)")]
    ProtocolTimeout {
        command: Command,
        waited: Duration,
        spins: u64,
    },

    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device busy: a capture session is active")]
    Busy,

    /// Recorded in the last-error register, never returned from a read.
    #[error("buffer {index} was overwritten before the consumer reached it")]
    Overrun { index: u16 },

    #[error("protocol violation: {signal:?} signal while {state:?}")]
    ProtocolViolation { signal: Signal, state: CaptureState },

    #[error("co-processor wedged: stop not acknowledged within {0:?} and restart failed")]
    HardwareWedged(Duration),

    #[error("operation would block")]
    WouldBlock,

    #[error("wait cancelled")]
    Interrupted,

    #[error("no data within {0:?}")]
    ReadTimeout(Duration),

    #[error("device is in the error state (last error {last_error:#x})")]
    Faulted { last_error: u32 },

    #[error("capture has not been started")]
    NotStarted,

    #[error("capture ended before buffer {index} was filled")]
    SessionEnded { index: u16 },

    #[error("co-processor control failed: {0}")]
    Control(String),
}

impl From<CaptureError> for io::Error {
    fn from(err: CaptureError) -> Self {
        let kind = match &err {
            CaptureError::ProtocolTimeout { .. } | CaptureError::ReadTimeout(_) => {
                io::ErrorKind::TimedOut
            }
            CaptureError::ConfigRejected(_) | CaptureError::NotStarted => {
                io::ErrorKind::Unsupported
            }
            CaptureError::SessionEnded { .. } => io::ErrorKind::UnexpectedEof,
            CaptureError::ResourceExhausted(_) => io::ErrorKind::OutOfMemory,
            CaptureError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            CaptureError::Busy => io::ErrorKind::ResourceBusy,
            CaptureError::WouldBlock => io::ErrorKind::WouldBlock,
            CaptureError::Interrupted => io::ErrorKind::Interrupted,
            CaptureError::Overrun { .. }
            | CaptureError::ProtocolViolation { .. }
            | CaptureError::HardwareWedged(_)
            | CaptureError::Faulted { .. }
            | CaptureError::Control(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let would_block: io::Error = CaptureError::WouldBlock.into();
        assert_eq!(would_block.kind(), io::ErrorKind::WouldBlock);

        let cancelled: io::Error = CaptureError::Interrupted.into();
        assert_eq!(cancelled.kind(), io::ErrorKind::Interrupted);

        let busy: io::Error = CaptureError::Busy.into();
        assert_eq!(busy.kind(), io::ErrorKind::ResourceBusy);
    }

    #[test]
    fn test_inner_error_survives_conversion() {
        let err: io::Error = CaptureError::Faulted { last_error: 0x10001 }.into();
        let inner = err.into_inner().unwrap();
        let capture = inner.downcast_ref::<CaptureError>().unwrap();
        assert!(matches!(capture, CaptureError::Faulted { last_error: 0x10001 }));
    }
}
