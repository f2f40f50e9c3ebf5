//! Samplewell: host-side driver core for a sampling co-processor
//!
//! A fixed-function co-processor samples digital lines and writes the samples
//! straight into host memory. This crate is the host half: it owns the buffer
//! ring the samples land in, talks to the firmware through a small shared
//! context block, reacts to the co-processor's two signals and presents the
//! whole thing to one consumer as a byte stream.
//!
//! ```text
//!   consumer ──read/seek/poll──▶ Reader ──start/stop──▶ LogicDevice
//!                                  │                      │   │
//!                          copies from                commands  descriptors
//!                                  ▼                      ▼   ▼
//!                              BufferRing ◀── fills ── co-processor
//!                                  ▲                      │
//!                          retire / re-arm            BufferReady
//!                                  │                  CaptureComplete
//!                            InterruptBridge ◀────────────┘
//! ```
//!
//! - [`context`]: shared context block, acked command channel, stop flag
//! - [`ring`]: host buffers and their per-buffer ownership state
//! - [`device`]: configuration, allocation and the capture state machine
//! - [`irq`]: signal handling that never blocks
//! - [`reader`]: the consumer handle
//! - [`stop`]: cooperative stop with power-cycle recovery
//! - [`sim`]: a software co-processor for tests and bring-up

pub mod clock;
pub mod context;
pub mod device;
pub mod error;
pub mod irq;
pub mod reader;
pub mod ring;
pub mod sim;
pub mod state;
pub mod stop;
pub mod telemetry;
pub mod wait;

pub use clock::{Clock, Deadline, ManualClock, MonotonicClock};
pub use context::{
    CaptureParams, Command, CommandChannel, Descriptor, FirmwareVersion, HandshakePolicy,
    SharedMemory, SharedRegion, StopSignal,
};
pub use device::{
    realized_rate, DeviceBuilder, DeviceStatus, FirmwareInfo, LastError, LogicDevice,
    DROP_MARKER, TEST_PATTERN_MAGIC,
};
pub use error::{CaptureError, Result};
pub use irq::{InterruptBridge, IrqOutcome, IrqStats, Signal};
pub use reader::{ReadMode, Readiness, Reader, RingMap, SeekTarget};
pub use ring::{BufferInfo, BufferRing, BufferState, DmaAllocator, DmaRegion, HostDma};
pub use state::{CaptureState, SampleUnit, TriggerMode};
pub use stop::{CoprocessorControl, CoprocessorUnit, NoControl, StopOutcome};
pub use wait::{CancelToken, WaitOutcome};
pub use wellconf::WellConfig;
