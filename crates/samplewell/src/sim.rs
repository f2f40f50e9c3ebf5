//! Software co-processor for tests and bring-up without hardware.
//!
//! Two flavours share the same command handling:
//!
//! - [`InlineFirmware`] answers commands synchronously inside the host's write
//!   to `cmd`, so the handshake needs no timing at all. Buffers are produced on
//!   demand with [`InlineFirmware::deliver_buffer`].
//! - [`SimCoprocessor`] runs the firmware loop on its own thread: it polls
//!   `cmd`, and after `Start` walks the descriptor list filling buffers at a
//!   fixed period, checking the stop flag at every buffer boundary.
//!
//! Sample data is a little-endian u32 counter that continues across buffers and
//! captures, so consumers can spot gaps.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context as _;
use tracing::{debug, error, info, warn};

use crate::context::{
    layout, read_descriptors, Command, Descriptor, FirmwareVersion, SharedMemory, SharedRegion,
    FW_MAGIC, RESP_REJECTED,
};
use crate::error::Result;
use crate::irq::{InterruptBridge, IrqOutcome, Signal};
use crate::ring::HostDma;
use crate::stop::{CoprocessorControl, CoprocessorUnit};

const IDLE_POLL: Duration = Duration::from_micros(50);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the simulated firmware presents itself.
#[derive(Debug, Clone)]
pub struct FirmwareProfile {
    pub version: FirmwareVersion,
    /// Answer to `GetMaxScatterGather`.
    pub max_buffers: u32,
    /// Descriptor slots in the context block.
    pub context_descriptors: usize,
    pub reject_config: bool,
    pub reject_start: bool,
    /// Raise capture-complete when a configuration is latched.
    pub ack_config: bool,
    /// Inline firmware only: finish the capture as soon as the stop flag is raised.
    pub complete_on_stop: bool,
}

impl Default for FirmwareProfile {
    fn default() -> Self {
        Self {
            version: FirmwareVersion { major: 0, minor: 3 },
            max_buffers: 128,
            context_descriptors: 128,
            reject_config: false,
            reject_start: false,
            ack_config: true,
            complete_on_stop: true,
        }
    }
}

fn respond(profile: &FirmwareProfile, mem: &dyn SharedRegion, code: u32) -> u32 {
    match Command::try_from(code) {
        Ok(Command::GetVersion) => profile.version.to_response(),
        Ok(Command::GetMaxScatterGather) => profile.max_buffers,
        Ok(Command::SetConfig) => {
            let divisor = mem.read_word(layout::SAMPLE_DIVISOR);
            let unit = mem.read_word(layout::SAMPLE_UNIT);
            let trigger = mem.read_word(layout::TRIGGER_FLAGS);
            if profile.reject_config || divisor == 0 || unit > 1 || trigger > 1 {
                RESP_REJECTED
            } else {
                0
            }
        }
        Ok(Command::Start) => u32::from(profile.reject_start),
        Err(unknown) => {
            warn!(code = unknown, "unknown command");
            RESP_REJECTED
        }
    }
}

/// Write counter samples over the whole descriptor range.
fn fill_descriptor(bus: &HostDma, desc: Descriptor, counter: &AtomicU32) -> Option<()> {
    let region = bus.resolve(desc.start)?;
    let words = desc.len() / 4;
    let first = counter.fetch_add(words as u32, Ordering::AcqRel);
    let mut bytes = Vec::with_capacity(desc.len());
    for i in 0..words as u32 {
        bytes.extend_from_slice(&first.wrapping_add(i).to_le_bytes());
    }
    bytes.resize(desc.len(), 0);
    region.write_at((desc.start - region.phys_addr()) as usize, &bytes);
    Some(())
}

#[derive(Clone)]
struct Link {
    bridge: InterruptBridge,
    bus: HostDma,
}

/// Firmware that answers inside the host's command write.
pub struct InlineFirmware {
    mem: SharedMemory,
    profile: FirmwareProfile,
    link: Mutex<Option<Link>>,
    next: AtomicUsize,
    counter: AtomicU32,
    starts: AtomicU32,
    muted: AtomicBool,
}

impl InlineFirmware {
    pub fn new(profile: FirmwareProfile) -> Self {
        let mem = SharedMemory::for_descriptors(profile.context_descriptors);
        mem.write_word(layout::MAGIC, FW_MAGIC);
        Self {
            mem,
            profile,
            link: Mutex::new(None),
            next: AtomicUsize::new(0),
            counter: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            muted: AtomicBool::new(false),
        }
    }

    /// Where to raise signals and which memory the descriptors point into.
    pub fn connect(&self, bridge: InterruptBridge, bus: HostDma) {
        *lock(&self.link) = Some(Link { bridge, bus });
    }

    /// Stop answering commands; the next handshake times out.
    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::Acquire)
    }

    fn link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    fn execute(&self, code: u32) {
        let resp = respond(&self.profile, &self.mem, code);
        self.mem.write_word(layout::RESP, resp);

        match Command::try_from(code) {
            Ok(Command::SetConfig) if resp == 0 && self.profile.ack_config => {
                if let Some(link) = self.link() {
                    link.bridge.raise(Signal::CaptureComplete);
                }
            }
            Ok(Command::Start) if resp == 0 => {
                self.starts.fetch_add(1, Ordering::AcqRel);
                self.next.store(0, Ordering::Release);
            }
            _ => {}
        }

        self.mem.write_word(layout::CMD, 0);
    }

    /// Fill the next descriptor and raise buffer-ready.
    pub fn deliver_buffer(&self) -> Option<IrqOutcome> {
        let link = self.link()?;
        let list = read_descriptors(&self.mem);
        if list.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel) % list.len();
        fill_descriptor(&link.bus, list[index], &self.counter)?;
        Some(link.bridge.raise(Signal::BufferReady))
    }

    /// Raise capture-complete, as at the end of a pass or after a stop request.
    pub fn complete(&self) -> Option<IrqOutcome> {
        Some(self.link()?.bridge.raise(Signal::CaptureComplete))
    }
}

impl SharedRegion for InlineFirmware {
    fn read_word(&self, offset: usize) -> u32 {
        self.mem.read_word(offset)
    }

    fn write_word(&self, offset: usize, value: u32) {
        self.mem.write_word(offset, value);
        if value == 0 || self.muted.load(Ordering::Acquire) {
            return;
        }
        match offset {
            layout::CMD => self.execute(value),
            layout::STOP_FLAG if self.profile.complete_on_stop => {
                self.complete();
            }
            _ => {}
        }
    }

    fn size(&self) -> usize {
        self.mem.size()
    }
}

/// Power control call, recorded for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    Halt(CoprocessorUnit),
    Boot(CoprocessorUnit),
}

/// Power control for the simulated units.
#[derive(Debug, Default)]
pub struct SimControl {
    halted: [AtomicBool; 2],
    /// Bumped on every halt; a capture dies if it changes under it.
    epoch: AtomicU64,
    wedged: AtomicBool,
    fail_boot: AtomicBool,
    calls: Mutex<Vec<ControlCall>>,
}

impl SimControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the co-processor ignore the stop flag and never complete, until rebooted.
    pub fn wedge(&self) {
        self.wedged.store(true, Ordering::Release);
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    pub fn fail_boot(&self, fail: bool) {
        self.fail_boot.store(fail, Ordering::Release);
    }

    pub fn is_halted(&self, unit: CoprocessorUnit) -> bool {
        self.halted[unit.index()].load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        lock(&self.calls).clone()
    }
}

impl CoprocessorControl for SimControl {
    fn halt(&self, unit: CoprocessorUnit) -> Result<()> {
        lock(&self.calls).push(ControlCall::Halt(unit));
        self.halted[unit.index()].store(true, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn boot(&self, unit: CoprocessorUnit) -> Result<()> {
        lock(&self.calls).push(ControlCall::Boot(unit));
        if self.fail_boot.load(Ordering::Acquire) {
            return Err(crate::error::CaptureError::Control(format!(
                "{} did not come back",
                unit
            )));
        }
        self.halted[unit.index()].store(false, Ordering::Release);
        if unit == CoprocessorUnit::Coordinator {
            self.wedged.store(false, Ordering::Release);
        }
        Ok(())
    }
}

/// Counters from the firmware thread.
#[derive(Debug, Default)]
pub struct SimStats {
    pub buffers_filled: AtomicU64,
    pub captures: AtomicU64,
    pub stops_honoured: AtomicU64,
}

struct SimInner {
    mem: Arc<SharedMemory>,
    profile: FirmwareProfile,
    bus: HostDma,
    control: Arc<SimControl>,
    bridge: Mutex<Option<InterruptBridge>>,
    running: AtomicBool,
    buffer_period: Duration,
    counter: AtomicU32,
    stats: SimStats,
}

impl SimInner {
    fn raise(&self, signal: Signal) {
        let bridge = lock(&self.bridge).clone();
        match bridge {
            Some(bridge) => {
                bridge.raise(signal);
            }
            None => debug!(?signal, "no host connected, signal dropped"),
        }
    }

    fn aborted(&self, epoch: u64) -> bool {
        !self.running.load(Ordering::Acquire)
            || self.control.epoch() != epoch
            || self.control.is_halted(CoprocessorUnit::Sampler)
            || self.control.is_halted(CoprocessorUnit::Coordinator)
    }
}

/// Threaded software co-processor.
pub struct SimCoprocessor {
    inner: Arc<SimInner>,
    thread: Option<JoinHandle<()>>,
}

impl SimCoprocessor {
    /// Start the firmware thread. `buffer_period` is the time to fill one buffer.
    pub fn spawn(profile: FirmwareProfile, buffer_period: Duration) -> anyhow::Result<Self> {
        let mem = Arc::new(SharedMemory::for_descriptors(profile.context_descriptors));
        mem.write_word(layout::MAGIC, FW_MAGIC);

        let inner = Arc::new(SimInner {
            mem,
            profile,
            bus: HostDma::new(),
            control: Arc::new(SimControl::new()),
            bridge: Mutex::new(None),
            running: AtomicBool::new(true),
            buffer_period,
            counter: AtomicU32::new(0),
            stats: SimStats::default(),
        });

        let inner_clone = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("samplewell-sim".to_string())
            .spawn(move || {
                if let Err(e) = run_firmware(&inner_clone) {
                    error!("simulated co-processor failed: {:#}", e);
                }
            })
            .context("spawning simulated co-processor")?;

        info!(?buffer_period, "simulated co-processor running");
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    pub fn region(&self) -> Arc<SharedMemory> {
        Arc::clone(&self.inner.mem)
    }

    /// Memory the co-processor writes into; hand it to the device as its allocator.
    pub fn bus(&self) -> HostDma {
        self.inner.bus.clone()
    }

    pub fn control(&self) -> Arc<SimControl> {
        Arc::clone(&self.inner.control)
    }

    pub fn connect(&self, bridge: InterruptBridge) {
        *lock(&self.inner.bridge) = Some(bridge);
    }

    pub fn stats(&self) -> &SimStats {
        &self.inner.stats
    }

    pub fn shutdown(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("simulated co-processor thread panicked");
            }
        }
    }
}

impl Drop for SimCoprocessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_firmware(inner: &SimInner) -> anyhow::Result<()> {
    let mem = &*inner.mem;
    while inner.running.load(Ordering::Acquire) {
        if inner.control.is_halted(CoprocessorUnit::Coordinator) {
            thread::sleep(IDLE_POLL);
            continue;
        }
        let code = mem.read_word(layout::CMD);
        if code == 0 {
            thread::sleep(IDLE_POLL);
            continue;
        }

        let resp = respond(&inner.profile, mem, code);
        mem.write_word(layout::RESP, resp);
        let command = Command::try_from(code).ok();
        if command == Some(Command::SetConfig) && resp == 0 && inner.profile.ack_config {
            inner.raise(Signal::CaptureComplete);
        }
        mem.write_word(layout::CMD, 0);

        if command == Some(Command::Start) && resp == 0 {
            capture(inner)?;
        }
    }
    Ok(())
}

fn capture(inner: &SimInner) -> anyhow::Result<()> {
    let mem = &*inner.mem;
    let list = read_descriptors(mem);
    if list.is_empty() {
        warn!("start with an empty descriptor list");
        return Ok(());
    }
    let oneshot = mem.read_word(layout::TRIGGER_FLAGS) == 0;
    let epoch = inner.control.epoch();
    inner.stats.captures.fetch_add(1, Ordering::Relaxed);
    debug!(buffers = list.len(), oneshot, "capture running");

    let mut index = 0;
    loop {
        thread::sleep(inner.buffer_period);
        if inner.aborted(epoch) {
            return Ok(());
        }

        let desc = list[index];
        fill_descriptor(&inner.bus, desc, &inner.counter)
            .with_context(|| format!("descriptor {:#010x} is not backed by host memory", desc.start))?;
        inner.stats.buffers_filled.fetch_add(1, Ordering::Relaxed);
        inner.raise(Signal::BufferReady);

        index += 1;
        if index == list.len() {
            if oneshot {
                break;
            }
            index = 0;
        }
        if inner.aborted(epoch) {
            return Ok(());
        }
        if mem.read_word(layout::STOP_FLAG) != 0 && !inner.control.is_wedged() {
            inner.stats.stops_honoured.fetch_add(1, Ordering::Relaxed);
            break;
        }
    }

    while inner.control.is_wedged() {
        if inner.aborted(epoch) {
            return Ok(());
        }
        thread::sleep(IDLE_POLL);
    }
    if inner.aborted(epoch) {
        return Ok(());
    }
    inner.raise(Signal::CaptureComplete);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::{CommandChannel, HandshakePolicy};

    #[test]
    fn test_inline_firmware_handshake() {
        let fw = Arc::new(InlineFirmware::new(FirmwareProfile::default()));
        let ch = CommandChannel::new(fw.clone(), Arc::new(ManualClock::new()), HandshakePolicy::default());
        ch.check_magic().unwrap();
        assert_eq!(ch.max_scatter_gather().unwrap(), 128);
        ch.start().unwrap();
        assert_eq!(fw.starts(), 1);
    }

    #[test]
    fn test_muted_inline_firmware_times_out() {
        let fw = Arc::new(InlineFirmware::new(FirmwareProfile::default()));
        fw.mute(true);
        let ch = CommandChannel::new(
            fw,
            Arc::new(ManualClock::new()),
            HandshakePolicy::default().with_spin_limit(10),
        );
        assert!(ch.version().is_err());
    }

    #[test]
    fn test_threaded_firmware_answers_commands() {
        let sim = SimCoprocessor::spawn(FirmwareProfile::default(), Duration::from_millis(1)).unwrap();
        let ch = CommandChannel::new(
            sim.region(),
            Arc::new(crate::clock::MonotonicClock::new()),
            HandshakePolicy::default()
                .with_timeout(Duration::from_secs(2))
                .with_spin_limit(u64::MAX),
        );
        assert_eq!(ch.version().unwrap(), FirmwareVersion { major: 0, minor: 3 });
    }

    #[test]
    fn test_sim_control_reboot_clears_wedge() {
        let control = SimControl::new();
        control.wedge();
        control.halt(CoprocessorUnit::Sampler).unwrap();
        assert!(control.is_halted(CoprocessorUnit::Sampler));
        control.boot(CoprocessorUnit::Coordinator).unwrap();
        assert!(!control.is_wedged());
        assert_eq!(
            control.calls(),
            vec![
                ControlCall::Halt(CoprocessorUnit::Sampler),
                ControlCall::Boot(CoprocessorUnit::Coordinator)
            ]
        );
    }
}
