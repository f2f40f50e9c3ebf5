//! Shared-memory context between host and co-processor.
//!
//! The co-processor owns a small block of word-addressed memory that both sides
//! see. The host talks to it in two distinct ways:
//!
//! ```text
//!   Host                         Context block                 Co-processor
//!    │   CommandChannel::send     ┌──────────────┐                  │
//!    ├──── write cmd ───────────▶ │ cmd    0x04  │ ◀── poll cmd ────┤
//!    │                            │ resp   0x08  │ ◀── write resp ──┤
//!    │ ◀── poll cmd == 0 ──────── │ cmd    0x04  │ ◀── clear cmd ───┤
//!    │                            │              │                  │
//!    │   StopSignal::request      │              │                  │
//!    ├──── write 1 ─────────────▶ │ stop   0x18  │ ◀── poll at each │
//!    │   (no ack, returns now)    └──────────────┘     buffer end   │
//! ```
//!
//! Commands are acknowledged and bounded by a [`HandshakePolicy`]. The stop flag
//! is fire-and-forget; its completion arrives later as a capture-complete signal.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::clock::{Clock, Deadline};
use crate::error::{CaptureError, Result};
use crate::state::{SampleUnit, TriggerMode};

/// Value the firmware leaves at offset 0 once it is up.
pub const FW_MAGIC: u32 = 0xBEA6_1E10;

/// Response the firmware gives to a configuration it cannot apply.
pub const RESP_REJECTED: u32 = u32::MAX;

/// Byte offsets into the context block. Every field is a little-endian u32.
pub mod layout {
    pub const MAGIC: usize = 0x00;
    pub const CMD: usize = 0x04;
    pub const RESP: usize = 0x08;
    pub const SAMPLE_DIVISOR: usize = 0x0C;
    pub const SAMPLE_UNIT: usize = 0x10;
    pub const TRIGGER_FLAGS: usize = 0x14;
    pub const STOP_FLAG: usize = 0x18;
    /// First `{start, end}` descriptor pair.
    pub const DESCRIPTORS: usize = 0x1C;
    pub const DESCRIPTOR_SIZE: usize = 8;

    /// Bytes needed for a context with room for `max_descriptors` plus the terminator.
    pub const fn size_for(max_descriptors: usize) -> usize {
        DESCRIPTORS + (max_descriptors + 1) * DESCRIPTOR_SIZE
    }
}

/// Word-addressed memory shared with the co-processor.
///
/// Offsets are in bytes and must be 4-aligned. Implementations publish writes
/// with release semantics and observe with acquire semantics.
pub trait SharedRegion: Send + Sync {
    fn read_word(&self, offset: usize) -> u32;
    fn write_word(&self, offset: usize, value: u32);
    /// Size in bytes.
    fn size(&self) -> usize;
}

/// Plain atomic backing for a context block.
pub struct SharedMemory {
    words: Box<[AtomicU32]>,
}

impl SharedMemory {
    pub fn new(size: usize) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    /// Block large enough for `max_descriptors` buffers.
    pub fn for_descriptors(max_descriptors: usize) -> Self {
        Self::new(layout::size_for(max_descriptors))
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("size", &self.size())
            .finish()
    }
}

impl SharedRegion for SharedMemory {
    fn read_word(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        self.words
            .get(offset / 4)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    fn write_word(&self, offset: usize, value: u32) {
        debug_assert_eq!(offset % 4, 0);
        if let Some(w) = self.words.get(offset / 4) {
            w.store(value, Ordering::Release);
        }
    }

    fn size(&self) -> usize {
        self.words.len() * 4
    }
}

/// Acknowledged commands. The discriminant is the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    GetVersion = 1,
    GetMaxScatterGather = 2,
    SetConfig = 3,
    Start = 4,
}

impl Command {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(code: u32) -> std::result::Result<Self, u32> {
        match code {
            1 => Ok(Self::GetVersion),
            2 => Ok(Self::GetMaxScatterGather),
            3 => Ok(Self::SetConfig),
            4 => Ok(Self::Start),
            other => Err(other),
        }
    }
}

/// Firmware version as reported by `GetVersion` (`minor | major << 8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    pub fn from_response(resp: u32) -> Self {
        Self {
            major: (resp >> 8) as u8,
            minor: (resp & 0xFF) as u8,
        }
    }

    pub fn to_response(self) -> u32 {
        u32::from(self.minor) | (u32::from(self.major) << 8)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Sampling parameters written ahead of `SetConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParams {
    pub divisor: u32,
    pub unit: SampleUnit,
    pub trigger: TriggerMode,
}

/// One `{start, end}` physical range; `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub start: u32,
    pub end: u32,
}

impl Descriptor {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounds on a single acknowledged command.
#[derive(Debug, Clone, Copy)]
pub struct HandshakePolicy {
    /// Wall-clock deadline for the co-processor to clear `cmd`.
    pub timeout: Duration,
    /// Poll iteration bound, checked alongside the deadline.
    pub spin_limit: u64,
    /// Extra attempts after a timeout. Zero means one attempt.
    pub retries: u32,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10),
            spin_limit: 1_000_000,
            retries: 0,
        }
    }
}

impl HandshakePolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_spin_limit(mut self, spin_limit: u64) -> Self {
        self.spin_limit = spin_limit.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl From<&wellconf::TimingConfig> for HandshakePolicy {
    fn from(timing: &wellconf::TimingConfig) -> Self {
        Self::default()
            .with_timeout(timing.command_timeout())
            .with_spin_limit(timing.command_spin_limit)
    }
}

/// Request/response path to the co-processor.
#[derive(Clone)]
pub struct CommandChannel {
    region: Arc<dyn SharedRegion>,
    clock: Arc<dyn Clock>,
    policy: HandshakePolicy,
}

impl CommandChannel {
    pub fn new(region: Arc<dyn SharedRegion>, clock: Arc<dyn Clock>, policy: HandshakePolicy) -> Self {
        Self {
            region,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> HandshakePolicy {
        self.policy
    }

    /// Issue `command` and busy-wait for the co-processor to clear it.
    pub fn send(&self, command: Command) -> Result<u32> {
        let mut attempt = 0;
        loop {
            match self.send_once(command) {
                Err(CaptureError::ProtocolTimeout { .. }) if attempt < self.policy.retries => {
                    attempt += 1;
                    warn!(?command, attempt, "command handshake timed out, retrying");
                }
                other => return other,
            }
        }
    }

    fn send_once(&self, command: Command) -> Result<u32> {
        let clock = &*self.clock;
        let started = clock.now();
        let deadline = Deadline::after(clock, self.policy.timeout);

        self.region.write_word(layout::CMD, command.code());

        let mut spins = 0u64;
        while self.region.read_word(layout::CMD) != 0 {
            spins += 1;
            if spins >= self.policy.spin_limit || deadline.expired(clock) {
                return Err(CaptureError::ProtocolTimeout {
                    command,
                    waited: clock.now().saturating_sub(started),
                    spins,
                });
            }
            std::hint::spin_loop();
        }

        let resp = self.region.read_word(layout::RESP);
        trace!(?command, resp, spins, "command acknowledged");
        Ok(resp)
    }

    /// Check the firmware has published its magic word.
    pub fn check_magic(&self) -> Result<()> {
        let magic = self.region.read_word(layout::MAGIC);
        if magic != FW_MAGIC {
            return Err(CaptureError::ConfigRejected(format!(
                "context magic {:#010x}, expected {:#010x}",
                magic, FW_MAGIC
            )));
        }
        Ok(())
    }

    pub fn version(&self) -> Result<FirmwareVersion> {
        let resp = self.send(Command::GetVersion)?;
        if resp == 0 {
            return Err(CaptureError::ConfigRejected(
                "firmware reported version 0".into(),
            ));
        }
        Ok(FirmwareVersion::from_response(resp))
    }

    /// Largest descriptor list the firmware accepts.
    pub fn max_scatter_gather(&self) -> Result<u32> {
        let resp = self.send(Command::GetMaxScatterGather)?;
        if resp == 0 || resp >= 256 {
            return Err(CaptureError::ConfigRejected(format!(
                "firmware advertised {} buffers, expected 1..256",
                resp
            )));
        }
        Ok(resp)
    }

    /// Write sampling parameters and have the firmware latch them.
    pub fn configure(&self, params: &CaptureParams) -> Result<()> {
        self.region.write_word(layout::SAMPLE_DIVISOR, params.divisor);
        self.region.write_word(layout::SAMPLE_UNIT, params.unit as u32);
        self.region.write_word(layout::TRIGGER_FLAGS, params.trigger as u32);

        let resp = self.send(Command::SetConfig)?;
        if resp != 0 {
            return Err(CaptureError::ConfigRejected(format!(
                "SetConfig answered {:#x} for {:?}",
                resp, params
            )));
        }
        debug!(?params, "configuration latched");
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let resp = self.send(Command::Start)?;
        if resp != 0 {
            return Err(CaptureError::ConfigRejected(format!(
                "Start answered {:#x}",
                resp
            )));
        }
        Ok(())
    }

    /// Serialize `descriptors` followed by a zero terminator.
    pub fn write_descriptors(&self, descriptors: &[Descriptor]) -> Result<()> {
        let needed = layout::size_for(descriptors.len());
        if needed > self.region.size() {
            return Err(CaptureError::ResourceExhausted(format!(
                "{} descriptors need {} bytes of context, have {}",
                descriptors.len(),
                needed,
                self.region.size()
            )));
        }

        let mut offset = layout::DESCRIPTORS;
        for d in descriptors {
            self.region.write_word(offset, d.start);
            self.region.write_word(offset + 4, d.end);
            offset += layout::DESCRIPTOR_SIZE;
        }
        self.region.write_word(offset, 0);
        self.region.write_word(offset + 4, 0);
        Ok(())
    }
}

/// Read back the descriptor list up to the zero terminator.
pub fn read_descriptors(region: &dyn SharedRegion) -> Vec<Descriptor> {
    let mut out = Vec::new();
    let mut offset = layout::DESCRIPTORS;
    while offset + layout::DESCRIPTOR_SIZE <= region.size() {
        let start = region.read_word(offset);
        let end = region.read_word(offset + 4);
        if start == 0 && end == 0 {
            break;
        }
        out.push(Descriptor { start, end });
        offset += layout::DESCRIPTOR_SIZE;
    }
    out
}

/// Fire-and-forget stop flag.
///
/// The co-processor samples the flag once per buffer boundary. Nothing here
/// waits: completion is observed through the capture-complete signal.
#[derive(Clone)]
pub struct StopSignal {
    region: Arc<dyn SharedRegion>,
}

impl StopSignal {
    pub fn new(region: Arc<dyn SharedRegion>) -> Self {
        Self { region }
    }

    pub fn request(&self) {
        self.region.write_word(layout::STOP_FLAG, 1);
    }

    pub fn clear(&self) {
        self.region.write_word(layout::STOP_FLAG, 0);
    }

    pub fn is_requested(&self) -> bool {
        self.region.read_word(layout::STOP_FLAG) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::{FirmwareProfile, InlineFirmware};

    fn channel(region: Arc<dyn SharedRegion>) -> CommandChannel {
        CommandChannel::new(region, Arc::new(ManualClock::new()), HandshakePolicy::default())
    }

    #[test]
    fn test_version_round_trip() {
        let profile = FirmwareProfile {
            version: FirmwareVersion { major: 7, minor: 42 },
            ..FirmwareProfile::default()
        };
        let fw = Arc::new(InlineFirmware::new(profile));
        let ch = channel(fw);

        let resp = ch.send(Command::GetVersion).unwrap();
        assert_eq!(resp >> 8, 7);
        assert_eq!(resp & 0xFF, 42);
        assert_eq!(ch.version().unwrap(), FirmwareVersion { major: 7, minor: 42 });
    }

    #[test]
    fn test_silent_firmware_times_out_on_spin_limit() {
        let region = Arc::new(SharedMemory::for_descriptors(4));
        let ch = CommandChannel::new(
            region.clone(),
            Arc::new(ManualClock::new()),
            HandshakePolicy::default().with_spin_limit(500),
        );

        match ch.send(Command::GetVersion) {
            Err(CaptureError::ProtocolTimeout { command, spins, .. }) => {
                assert_eq!(command, Command::GetVersion);
                assert_eq!(spins, 500);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // Command is left pending; the firmware may still pick it up.
        assert_eq!(region.read_word(layout::CMD), Command::GetVersion.code());
    }

    #[test]
    fn test_silent_firmware_times_out_on_deadline() {
        let region = Arc::new(SharedMemory::for_descriptors(4));
        let clock = Arc::new(ManualClock::ticking(Duration::from_millis(1)));
        let ch = CommandChannel::new(
            region,
            clock,
            HandshakePolicy::default()
                .with_timeout(Duration::from_millis(10))
                .with_spin_limit(u64::MAX),
        );

        match ch.send(Command::Start) {
            Err(CaptureError::ProtocolTimeout { waited, spins, .. }) => {
                assert!(waited >= Duration::from_millis(10));
                assert!(spins < 20);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_rejected_config() {
        let profile = FirmwareProfile {
            reject_config: true,
            ..FirmwareProfile::default()
        };
        let ch = channel(Arc::new(InlineFirmware::new(profile)));
        let params = CaptureParams {
            divisor: 1,
            unit: SampleUnit::Narrow,
            trigger: TriggerMode::Oneshot,
        };
        assert!(matches!(
            ch.configure(&params),
            Err(CaptureError::ConfigRejected(_))
        ));
    }

    #[test]
    fn test_max_scatter_gather_bounds() {
        for (advertised, ok) in [(0, false), (1, true), (128, true), (255, true), (256, false)] {
            let profile = FirmwareProfile {
                max_buffers: advertised,
                ..FirmwareProfile::default()
            };
            let ch = channel(Arc::new(InlineFirmware::new(profile)));
            assert_eq!(ch.max_scatter_gather().is_ok(), ok, "advertised {advertised}");
        }
    }

    #[test]
    fn test_descriptor_list_is_zero_terminated() {
        let region = Arc::new(SharedMemory::for_descriptors(4));
        let ch = channel(region.clone());
        // stale entry beyond the new list
        for off in (layout::DESCRIPTORS..region.size()).step_by(4) {
            region.write_word(off, 0xAAAA_AAAA);
        }

        let list = [
            Descriptor { start: 0x1000, end: 0x2000 },
            Descriptor { start: 0x8000, end: 0x9000 },
        ];
        ch.write_descriptors(&list).unwrap();

        assert_eq!(read_descriptors(&*region), list.to_vec());
        assert_eq!(region.read_word(layout::DESCRIPTORS + 16), 0);
        assert_eq!(region.read_word(layout::DESCRIPTORS + 20), 0);
    }

    #[test]
    fn test_descriptor_list_overflow() {
        let region = Arc::new(SharedMemory::for_descriptors(2));
        let ch = channel(region);
        let list = vec![Descriptor { start: 1, end: 2 }; 3];
        assert!(matches!(
            ch.write_descriptors(&list),
            Err(CaptureError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_stop_signal_is_not_acked() {
        let region = Arc::new(SharedMemory::for_descriptors(2));
        let stop = StopSignal::new(region.clone());
        stop.request();
        assert!(stop.is_requested());
        assert_eq!(region.read_word(layout::STOP_FLAG), 1);
        assert_eq!(region.read_word(layout::CMD), 0);
        stop.clear();
        assert!(!stop.is_requested());
    }
}
