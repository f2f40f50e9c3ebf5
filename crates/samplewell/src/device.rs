//! Device context: one per physical capture unit.
//!
//! `LogicDevice` owns the configuration, the buffer ring and the channel to
//! the co-processor, and drives the capture state machine:
//!
//! ```text
//!   Disabled ─boot─▶ Initialized ─allocate─▶ MemAllocd ─submit─▶ Armed ─start─▶ Running
//!                        ▲                                                    │   │
//!                        │◀──────────── oneshot completion ───────────────────┘   │ stop
//!                        │◀──── completion ──── RequestStop ◀─────────────────────┘
//!
//!   completion outside Armed/Running/RequestStop, or a failed submit ─▶ Error
//! ```
//!
//! Configuration calls take the session lock for their duration and fail with
//! `Busy` while a capture holds it. Interrupt delivery goes through
//! [`InterruptBridge`], which only touches the atomics in [`Shared`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use wellconf::{TimingConfig, WellConfig};

use crate::clock::{Clock, MonotonicClock};
use crate::context::{CaptureParams, CommandChannel, FirmwareVersion, HandshakePolicy, SharedRegion, StopSignal};
use crate::error::{CaptureError, Result};
use crate::irq::{InterruptBridge, IrqStats};
use crate::reader::Reader;
use crate::ring::{BufferInfo, BufferRing, DmaAllocator, HostDma};
use crate::state::{CaptureState, SampleUnit, SessionLock, StateCell, TriggerMode};
use crate::stop::{self, CoprocessorControl, NoControl, StopOutcome};
use crate::wait::{CancelToken, WaitQueue};

/// Marker bit in the last-error register for a dropped buffer.
pub const DROP_MARKER: u32 = 0x1_0000;

/// Value that arms the attribute-style test pattern fill.
pub const TEST_PATTERN_MAGIC: u32 = 12_345_678;

/// Smallest buffer unit; units are rounded up to this granularity.
pub const UNIT_ALIGN: usize = 32;

/// Round a buffer unit up to [`UNIT_ALIGN`]; the result must fit the 32-bit bus.
fn round_unit(size: usize) -> Result<usize> {
    if size < UNIT_ALIGN {
        return Err(CaptureError::InvalidArgument(format!(
            "buffer unit {} bytes, minimum {}",
            size, UNIT_ALIGN
        )));
    }
    size.checked_next_multiple_of(UNIT_ALIGN)
        .filter(|&rounded| u32::try_from(rounded).is_ok())
        .ok_or_else(|| {
            CaptureError::InvalidArgument(format!(
                "buffer unit {} bytes exceeds the 32-bit bus span",
                size
            ))
        })
}

/// Last-error register: 0, or `DROP_MARKER | index` of the most recent dropped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LastError(pub u32);

impl LastError {
    pub const NONE: Self = Self(0);

    pub fn dropped(index: u16) -> Self {
        Self(DROP_MARKER | u32::from(index))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn dropped_index(self) -> Option<u16> {
        (self.0 & DROP_MARKER != 0).then_some((self.0 & 0xFFFF) as u16)
    }

    pub fn as_error(self) -> Option<CaptureError> {
        self.dropped_index().map(|index| CaptureError::Overrun { index })
    }
}

/// Realized rate for a request: the co-processor divides `core_clock / 2` by an integer.
pub fn realized_rate(core_clock: u32, requested: u32) -> Result<u32> {
    let half = core_clock / 2;
    if requested == 0 || requested > half {
        return Err(CaptureError::InvalidArgument(format!(
            "sample rate {} Hz outside 1..={}",
            requested, half
        )));
    }
    Ok(half / (half / requested))
}

/// State the interrupt path is allowed to touch.
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) session: SessionLock,
    pub(crate) ring: RwLock<Option<Arc<BufferRing>>>,
    /// Trigger mode of the current session, as the raw wire value.
    pub(crate) trigger: AtomicU8,
    pub(crate) last_error: AtomicU32,
    pub(crate) waiters: Arc<WaitQueue>,
    pub(crate) stats: IrqStats,
    pub(crate) reader_open: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: StateCell::new(CaptureState::Disabled),
            session: SessionLock::new(),
            ring: RwLock::new(None),
            trigger: AtomicU8::new(TriggerMode::Oneshot as u8),
            last_error: AtomicU32::new(0),
            waiters: Arc::new(WaitQueue::new()),
            stats: IrqStats::default(),
            reader_open: AtomicBool::new(false),
        }
    }

    pub(crate) fn ring(&self) -> Option<Arc<BufferRing>> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn install_ring(&self, ring: Option<Arc<BufferRing>>) -> Option<Arc<BufferRing>> {
        let mut slot = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, ring)
    }

    pub(crate) fn record_drop(&self, index: u16) {
        self.last_error.store(LastError::dropped(index).0, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    core_clock: u32,
    sample_rate: u32,
    sample_unit: SampleUnit,
    trigger: TriggerMode,
    unit_size: usize,
}

impl Settings {
    fn divisor(&self) -> u32 {
        (self.core_clock / 2) / self.sample_rate
    }
}

/// What the firmware reported at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareInfo {
    pub version: FirmwareVersion,
    pub max_buffers: u32,
}

/// Point-in-time view of a device, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub state: CaptureState,
    pub sample_rate: u32,
    pub sample_unit: SampleUnit,
    pub trigger: TriggerMode,
    pub buffer_unit_size: usize,
    pub buffer_size: usize,
    pub current_index: Option<usize>,
    pub last_error: LastError,
    pub firmware: Option<FirmwareInfo>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`LogicDevice`].
pub struct DeviceBuilder {
    region: Option<Arc<dyn SharedRegion>>,
    dma: Arc<dyn DmaAllocator>,
    control: Arc<dyn CoprocessorControl>,
    clock: Arc<dyn Clock>,
    config: WellConfig,
}

impl DeviceBuilder {
    fn new() -> Self {
        Self {
            region: None,
            dma: Arc::new(HostDma::new()),
            control: Arc::new(NoControl),
            clock: Arc::new(MonotonicClock::new()),
            config: WellConfig::default(),
        }
    }

    /// Shared context block of the co-processor. Required.
    pub fn region(mut self, region: Arc<dyn SharedRegion>) -> Self {
        self.region = Some(region);
        self
    }

    pub fn dma(mut self, dma: Arc<dyn DmaAllocator>) -> Self {
        self.dma = dma;
        self
    }

    pub fn control(mut self, control: Arc<dyn CoprocessorControl>) -> Self {
        self.control = control;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: WellConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a Disabled device.
    pub fn build(self) -> Result<Arc<LogicDevice>> {
        let region = self.region.ok_or_else(|| {
            CaptureError::InvalidArgument("device needs a shared context region".into())
        })?;
        self.config
            .validate()
            .map_err(|e| CaptureError::InvalidArgument(e.to_string()))?;

        let policy = HandshakePolicy::from(&self.config.timing);
        let defaults = &self.config.device;
        let settings = Settings {
            core_clock: defaults.core_clock_hz,
            sample_rate: defaults.sample_rate,
            sample_unit: defaults.sample_unit.into(),
            trigger: defaults.trigger.into(),
            unit_size: defaults.buffer_unit_size as usize,
        };

        Ok(Arc::new(LogicDevice {
            shared: Arc::new(Shared::new()),
            commands: CommandChannel::new(Arc::clone(&region), Arc::clone(&self.clock), policy),
            stop_signal: StopSignal::new(region),
            control: self.control,
            dma: self.dma,
            clock: self.clock,
            config: self.config,
            settings: Mutex::new(settings),
            firmware: Mutex::new(None),
            max_buffers: AtomicUsize::new(0),
        }))
    }

    /// Build and run the boot handshake.
    pub fn boot(self) -> Result<Arc<LogicDevice>> {
        let device = self.build()?;
        device.boot()?;
        Ok(device)
    }
}

pub struct LogicDevice {
    shared: Arc<Shared>,
    commands: CommandChannel,
    stop_signal: StopSignal,
    control: Arc<dyn CoprocessorControl>,
    dma: Arc<dyn DmaAllocator>,
    clock: Arc<dyn Clock>,
    config: WellConfig,
    settings: Mutex<Settings>,
    firmware: Mutex<Option<FirmwareInfo>>,
    max_buffers: AtomicUsize,
}

impl LogicDevice {
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub(crate) fn timing(&self) -> &TimingConfig {
        &self.config.timing
    }

    pub(crate) fn control(&self) -> &dyn CoprocessorControl {
        &*self.control
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop_signal
    }

    pub(crate) fn waiters(&self) -> &Arc<WaitQueue> {
        &self.shared.waiters
    }

    fn settings(&self) -> Settings {
        *lock(&self.settings)
    }

    fn require_booted(&self) -> Result<()> {
        if self.shared.state.get() == CaptureState::Disabled {
            return Err(CaptureError::ConfigRejected("device not booted".into()));
        }
        Ok(())
    }

    /// Handle for whatever delivers co-processor interrupts.
    pub fn interrupts(&self) -> InterruptBridge {
        InterruptBridge::new(Arc::clone(&self.shared))
    }

    /// Token that interrupts this device's blocking waits once.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(Arc::clone(&self.shared.waiters))
    }

    /// Probe the firmware and apply configured defaults: Disabled -> Initialized.
    ///
    /// Also accepted from Error, as the start of a reconfigure cycle.
    pub fn boot(&self) -> Result<()> {
        let state = self.shared.state.get();
        if !matches!(state, CaptureState::Disabled | CaptureState::Error) {
            debug!(%state, "boot ignored, device already up");
            return Ok(());
        }
        let _op = self.shared.session.try_acquire()?;

        self.commands.check_magic()?;
        let version = self.commands.version()?;
        let max_buffers = self.commands.max_scatter_gather()?;

        *lock(&self.firmware) = Some(FirmwareInfo {
            version,
            max_buffers,
        });
        self.max_buffers.store(max_buffers as usize, Ordering::Release);

        let defaults = &self.config.device;
        {
            let mut settings = lock(&self.settings);
            settings.core_clock = defaults.core_clock_hz;
            settings.sample_rate = realized_rate(defaults.core_clock_hz, defaults.sample_rate)?;
            settings.sample_unit = defaults.sample_unit.into();
            settings.trigger = defaults.trigger.into();
            settings.unit_size = round_unit(defaults.buffer_unit_size as usize)?;
        }

        self.free_locked();
        self.shared.last_error.store(0, Ordering::Release);
        self.shared.state.set(CaptureState::Initialized);
        info!(%version, max_buffers, "co-processor ready");

        if defaults.total_buffer_size > 0 {
            self.allocate_locked(defaults.total_buffer_size as usize)?;
            self.submit_locked()?;
        }
        Ok(())
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state.get()
    }

    pub fn last_error(&self) -> LastError {
        LastError(self.shared.last_error.load(Ordering::Acquire))
    }

    pub fn firmware(&self) -> Option<FirmwareInfo> {
        *lock(&self.firmware)
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers.load(Ordering::Acquire)
    }

    pub fn core_clock(&self) -> u32 {
        self.settings().core_clock
    }

    pub fn sample_rate(&self) -> u32 {
        self.settings().sample_rate
    }

    /// Set the rate, rounded to what an integer divisor of `core_clock / 2` can produce.
    pub fn set_sample_rate(&self, hz: u32) -> Result<u32> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        let mut settings = lock(&self.settings);
        let realized = realized_rate(settings.core_clock, hz)?;
        settings.sample_rate = realized;
        debug!(requested = hz, realized, "sample rate set");
        Ok(realized)
    }

    pub fn sample_unit(&self) -> SampleUnit {
        self.settings().sample_unit
    }

    pub fn set_sample_unit(&self, unit: SampleUnit) -> Result<()> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        lock(&self.settings).sample_unit = unit;
        Ok(())
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.settings().trigger
    }

    pub fn set_trigger_mode(&self, trigger: TriggerMode) -> Result<()> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        lock(&self.settings).trigger = trigger;
        Ok(())
    }

    pub fn buffer_unit_size(&self) -> usize {
        self.settings().unit_size
    }

    /// Set the per-buffer size (rounded up to 32 bytes) and free the ring.
    pub fn set_buffer_unit_size(&self, size: usize) -> Result<usize> {
        self.require_booted()?;
        let rounded = round_unit(size)?;
        let _op = self.shared.session.try_acquire()?;
        lock(&self.settings).unit_size = rounded;
        self.free_locked();
        debug!(requested = size, rounded, "buffer unit size set");
        Ok(rounded)
    }

    /// Bytes in the current ring, 0 without one.
    pub fn buffer_size(&self) -> usize {
        self.shared.ring().map_or(0, |r| r.total_size())
    }

    /// Reallocate the ring for `total` bytes and hand it to the co-processor.
    pub fn set_buffer_size(&self, total: usize) -> Result<usize> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        self.free_locked();
        self.allocate_locked(total)?;
        self.submit_locked()?;
        Ok(self.buffer_size())
    }

    /// Allocate a fresh ring (freeing any existing one): -> MemAllocd.
    pub fn allocate(&self, total: usize) -> Result<()> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        self.free_locked();
        self.allocate_locked(total)
    }

    /// Write the ring's descriptor list into the context: -> Armed.
    pub fn submit(&self) -> Result<()> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        self.submit_locked()
    }

    /// Drop the ring. Idempotent.
    pub fn free_buffers(&self) -> Result<()> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        self.free_locked();
        Ok(())
    }

    fn free_locked(&self) {
        if let Some(old) = self.shared.install_ring(None) {
            info!(count = old.count(), "buffer ring freed");
        }
        let _ = self.shared.state.update(|s| {
            matches!(s, CaptureState::MemAllocd | CaptureState::Armed | CaptureState::Error)
                .then_some(CaptureState::Initialized)
        });
    }

    fn allocate_locked(&self, total: usize) -> Result<()> {
        let unit = self.settings().unit_size;
        let ring = BufferRing::allocate(&*self.dma, total, unit, self.max_buffers())?;
        self.shared.install_ring(Some(Arc::new(ring)));
        self.shared.state.set(CaptureState::MemAllocd);
        Ok(())
    }

    fn submit_locked(&self) -> Result<()> {
        let ring = self
            .shared
            .ring()
            .ok_or_else(|| CaptureError::ResourceExhausted("no buffers allocated".into()))?;
        if let Err(e) = self.commands.write_descriptors(&ring.descriptors()) {
            self.shared.state.set(CaptureState::Error);
            warn!(error = %e, "descriptor submission failed");
            return Err(e);
        }
        self.shared.state.set(CaptureState::Armed);
        debug!(count = ring.count(), "descriptors submitted");
        Ok(())
    }

    /// Slot the co-processor is filling.
    pub fn current_index(&self) -> Option<usize> {
        self.shared.ring().map(|r| r.write_cursor())
    }

    /// Mark every buffer consumer-ready.
    pub fn invalidate_cache(&self) -> Result<()> {
        let ring = self
            .shared
            .ring()
            .ok_or_else(|| CaptureError::ResourceExhausted("no buffers allocated".into()))?;
        ring.set_all(crate::ring::BufferState::Unmapped);
        self.shared.waiters.wake_all();
        Ok(())
    }

    pub fn fill_test_pattern(&self) -> Result<()> {
        self.require_booted()?;
        let _op = self.shared.session.try_acquire()?;
        let ring = self
            .shared
            .ring()
            .ok_or_else(|| CaptureError::ResourceExhausted("no buffers allocated".into()))?;
        ring.fill_test_pattern();
        Ok(())
    }

    /// Attribute-style entry: fills only when `value` is [`TEST_PATTERN_MAGIC`].
    pub fn fill_test_pattern_magic(&self, value: u32) -> Result<bool> {
        if value != TEST_PATTERN_MAGIC {
            return Ok(false);
        }
        self.fill_test_pattern()?;
        Ok(true)
    }

    pub fn buffers(&self) -> Vec<BufferInfo> {
        self.shared.ring().map(|r| r.snapshot()).unwrap_or_default()
    }

    /// One `phys,size` line per buffer, physical address as 8 hex digits.
    pub fn buffer_table(&self) -> String {
        let mut out = String::new();
        for info in self.buffers() {
            let _ = writeln!(out, "{:08x},{}", info.phys_addr, info.size);
        }
        out
    }

    pub fn status(&self) -> DeviceStatus {
        let settings = self.settings();
        DeviceStatus {
            state: self.state(),
            sample_rate: settings.sample_rate,
            sample_unit: settings.sample_unit,
            trigger: settings.trigger,
            buffer_unit_size: settings.unit_size,
            buffer_size: self.buffer_size(),
            current_index: self.current_index(),
            last_error: self.last_error(),
            firmware: self.firmware(),
        }
    }

    /// Trigger mode latched by the running (or last) session.
    pub(crate) fn session_trigger(&self) -> TriggerMode {
        TriggerMode::from_u8(self.shared.trigger.load(Ordering::Acquire))
    }

    /// Configure the co-processor and start a capture session.
    pub fn start(&self) -> Result<()> {
        self.require_booted()?;
        match self.shared.state.get() {
            CaptureState::Error => {
                return Err(CaptureError::Faulted {
                    last_error: self.last_error().0,
                })
            }
            CaptureState::Running | CaptureState::RequestStop => return Err(CaptureError::Busy),
            _ => {}
        }
        let op = self.shared.session.try_acquire()?;

        let ring = self
            .shared
            .ring()
            .ok_or_else(|| CaptureError::ResourceExhausted("no buffers allocated".into()))?;
        if self.shared.state.get() != CaptureState::Armed {
            self.submit_locked()?;
        }

        let settings = self.settings();
        self.stop_signal.clear();
        self.shared.trigger.store(settings.trigger as u8, Ordering::Release);
        self.commands.configure(&CaptureParams {
            divisor: settings.divisor(),
            unit: settings.sample_unit,
            trigger: settings.trigger,
        })?;

        ring.set_all(crate::ring::BufferState::Mapped);
        ring.set_write_cursor(0);
        self.shared.last_error.store(0, Ordering::Release);

        // Session and state go live before Start so an instant completion finds them.
        op.into_session();
        self.shared.state.set(CaptureState::Running);
        if let Err(e) = self.commands.start() {
            let _ = self
                .shared
                .state
                .transition(CaptureState::Running, CaptureState::Armed);
            self.shared.session.release_session();
            return Err(e);
        }

        info!(
            rate = settings.sample_rate,
            unit = ?settings.sample_unit,
            trigger = ?settings.trigger,
            buffers = ring.count(),
            "capture started"
        );
        Ok(())
    }

    /// Stop the running session, escalating to a power cycle on timeout.
    pub fn stop(&self) -> Result<StopOutcome> {
        stop::run(self, None)
    }

    /// As [`stop`](Self::stop), with a token that can cut the wait short.
    pub fn stop_with(&self, cancel: &CancelToken) -> Result<StopOutcome> {
        stop::run(self, Some(cancel))
    }

    /// Open the single consumer handle.
    pub fn open(self: &Arc<Self>) -> Result<Reader> {
        Reader::open(Arc::clone(self))
    }
}

impl std::fmt::Debug for LogicDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicDevice")
            .field("state", &self.state())
            .field("settings", &self.settings())
            .field("buffers", &self.buffers().len())
            .finish()
    }
}
