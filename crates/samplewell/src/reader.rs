//! Consumer handle: the ring as a byte stream.
//!
//! One `Reader` may exist per device. The first read of a session starts the
//! capture; each read then copies from the buffer at the read cursor once the
//! co-processor has retired it. A buffer the producer is already refilling when
//! the consumer reaches it is marked Dropped and recorded in the last-error
//! register; the stream carries on.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Deadline;
use crate::device::{LastError, LogicDevice};
use crate::error::{CaptureError, Result};
use crate::ring::{BufferInfo, BufferRing, BufferState};
use crate::state::{CaptureState, TriggerMode};
use crate::stop::StopOutcome;
use crate::wait::{CancelToken, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    #[default]
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
}

/// Seek targets the stream supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    /// Skip forward, dropping stale buffers on the way.
    Forward(u64),
    /// Abort the session and rewind; the next read restarts capture.
    Start,
}

pub struct Reader {
    device: Arc<LogicDevice>,
    ring: Weak<BufferRing>,
    /// None until the first read of a session.
    cursor: Option<usize>,
    /// Offset into the buffer at `cursor`.
    pos: usize,
    remaining: usize,
    /// Bytes consumed or skipped this session.
    offset: u64,
    /// Cursor has wrapped back to the head at least once.
    wrapped: bool,
    mode: ReadMode,
    cancel: CancelToken,
    closed: bool,
}

impl Reader {
    pub(crate) fn open(device: Arc<LogicDevice>) -> Result<Self> {
        let ring = Self::claim(&device)?;
        debug!(buffers = ring.count(), "reader opened");
        let cancel = device.cancel_token();
        Ok(Self {
            device,
            ring: Arc::downgrade(&ring),
            cursor: None,
            pos: 0,
            remaining: 0,
            offset: 0,
            wrapped: false,
            mode: ReadMode::Blocking,
            cancel,
            closed: false,
        })
    }

    /// Take the single reader slot and return every buffer to the co-processor.
    fn claim(device: &LogicDevice) -> Result<Arc<BufferRing>> {
        let shared = device.shared();
        if shared.state.get() == CaptureState::Disabled {
            return Err(CaptureError::ConfigRejected("device not booted".into()));
        }
        let _op = shared.session.try_acquire()?;
        let ring = shared
            .ring()
            .ok_or_else(|| CaptureError::ResourceExhausted("no buffers allocated".into()))?;

        if shared
            .reader_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::Busy);
        }
        if let Err(e) = ring.repair() {
            shared.reader_open.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(ring)
    }

    pub fn device(&self) -> &Arc<LogicDevice> {
        &self.device
    }

    pub fn set_mode(&mut self, mode: ReadMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Token that interrupts this reader's next (or current) blocking wait.
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Index of the buffer the next read copies from.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    fn rewind(&mut self) {
        self.cursor = None;
        self.pos = 0;
        self.remaining = 0;
        self.offset = 0;
        self.wrapped = false;
    }

    fn position_at_head(&mut self, ring: &BufferRing) {
        self.cursor = Some(0);
        self.pos = 0;
        self.remaining = ring.unit_size();
        self.offset = 0;
        self.wrapped = false;
    }

    /// Current ring; a replaced ring resets the reader to a fresh session.
    fn ring(&mut self) -> Result<Arc<BufferRing>> {
        let current = self
            .device
            .shared()
            .ring()
            .ok_or_else(|| CaptureError::ResourceExhausted("no buffers allocated".into()))?;
        let same = self
            .ring
            .upgrade()
            .is_some_and(|r| Arc::ptr_eq(&r, &current));
        if !same {
            debug!("ring replaced under reader, rewinding");
            self.ring = Arc::downgrade(&current);
            self.rewind();
        }
        Ok(current)
    }

    fn faulted(&self) -> CaptureError {
        CaptureError::Faulted {
            last_error: self.device.last_error().0,
        }
    }

    /// Wait for `ready`, honouring mode, cancellation and the read timeout.
    fn wait_for<F>(&self, mut ready: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let shared = self.device.shared();
        if ready() {
            return Ok(());
        }
        if self.mode == ReadMode::NonBlocking {
            return Err(CaptureError::WouldBlock);
        }

        let clock = self.device.clock();
        let timing = self.device.timing();
        let read_timeout = timing.read_timeout();
        let deadline = read_timeout.map(|t| Deadline::after(clock, t));

        let outcome = self.device.waiters().wait_until(
            clock,
            deadline,
            timing.wait_slice(),
            Some(&self.cancel),
            || ready() || !shared.state.get().is_capturing(),
        );
        match outcome {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::Cancelled => Err(CaptureError::Interrupted),
            WaitOutcome::TimedOut => Err(CaptureError::ReadTimeout(read_timeout.unwrap_or_default())),
        }
    }

    /// Wait until the buffer at `index` is filled.
    fn wait_filled(&self, ring: &BufferRing, index: usize) -> Result<()> {
        let buf = ring.buffer(index);
        if buf.state() != BufferState::Unmapped {
            self.check_live(index)?;
            self.wait_for(|| buf.state() == BufferState::Unmapped)?;
            if buf.state() != BufferState::Unmapped {
                // woken because the session ended
                self.check_live(index)?;
            }
        }
        Ok(())
    }

    /// Fail if no session will ever fill buffer `index`.
    fn check_live(&self, index: usize) -> Result<()> {
        match self.device.shared().state.get() {
            CaptureState::Error => Err(self.faulted()),
            state if !state.is_capturing() => Err(CaptureError::SessionEnded {
                index: index as u16,
            }),
            _ => Ok(()),
        }
    }

    /// Copy up to `dst.len()` bytes; `Ok(0)` is end of stream.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let device = Arc::clone(&self.device);
        let shared = device.shared();
        if shared.state.get() == CaptureState::Error {
            return Err(self.faulted());
        }
        let ring = self.ring()?;

        if self.pos == 0 {
            let cursor = self.cursor;
            match cursor {
                None => {
                    self.position_at_head(&ring);
                    if !shared.state.get().is_capturing() {
                        if let Err(e) = device.start() {
                            self.rewind();
                            return Err(e);
                        }
                    }
                }
                Some(0) if self.wrapped && device.session_trigger() == TriggerMode::Oneshot => {
                    // Whole ring consumed; the pass is over once the completion lands.
                    self.wait_for(|| !shared.state.get().is_capturing())?;
                    match shared.state.get() {
                        CaptureState::Error => return Err(self.faulted()),
                        _ => return Ok(0),
                    }
                }
                // nothing captured at the head and nothing left to capture it
                Some(0)
                    if ring.buffer(0).state() != BufferState::Unmapped
                        && !shared.state.get().is_capturing() =>
                {
                    return Ok(0)
                }
                Some(_) => {}
            }

            let index = self.cursor.unwrap_or(0);
            self.wait_filled(&ring, index)?;
        }

        let index = self.cursor.unwrap_or(0);
        let buf = ring.buffer(index);
        let want = self.remaining.min(dst.len());
        let copied = buf.read_at(self.pos, &mut dst[..want]);

        if buf.mark_dropped_if_stale() {
            shared.record_drop(buf.index());
            warn!(index, "buffer overrun, marked dropped");
        }

        self.advance(&ring, copied);
        Ok(copied)
    }

    fn advance(&mut self, ring: &BufferRing, n: usize) {
        self.pos += n;
        self.remaining -= n;
        self.offset += n as u64;
        if self.remaining == 0 {
            let next = ring.next_index(self.cursor.unwrap_or(0));
            if next == 0 {
                self.wrapped = true;
            }
            self.cursor = Some(next);
            self.pos = 0;
            self.remaining = ring.unit_size();
        }
    }

    /// Move within the stream. Returns the new stream offset.
    pub fn seek(&mut self, target: SeekTarget) -> Result<u64> {
        match target {
            SeekTarget::Start => {
                self.rewind();
                self.device.stop()?;
                Ok(0)
            }
            SeekTarget::Forward(mut n) => {
                let ring = self.ring()?;
                if self.cursor.is_none() {
                    return Err(CaptureError::NotStarted);
                }
                let device = Arc::clone(&self.device);
                let shared = device.shared();
                while n > 0 {
                    let buf = ring.buffer(self.cursor.unwrap_or(0));
                    let step = (self.remaining as u64).min(n) as usize;
                    if buf.mark_dropped_if_stale() {
                        shared.record_drop(buf.index());
                        warn!(index = buf.index(), "buffer skipped before fill, marked dropped");
                    }
                    self.advance(&ring, step);
                    n -= step as u64;
                }
                Ok(self.offset)
            }
        }
    }

    /// Ready when the buffer at the read cursor is filled.
    pub fn poll(&mut self) -> Result<Readiness> {
        let state = self.device.shared().state.get();
        if self.cursor.is_none() && !state.is_capturing() {
            return Err(CaptureError::NotStarted);
        }
        let ring = self.ring()?;
        let index = self.cursor.unwrap_or(0);
        Ok(if ring.buffer(index).state() == BufferState::Unmapped {
            Readiness::Ready
        } else {
            Readiness::Pending
        })
    }

    /// Blocking half of [`poll`](Self::poll): wait up to `timeout` for readiness.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        if self.poll()? == Readiness::Ready {
            return Ok(Readiness::Ready);
        }
        let ring = self.ring()?;
        let buf = ring.buffer(self.cursor.unwrap_or(0));
        let clock = self.device.clock();
        let deadline = Deadline::after(clock, timeout);
        let outcome = self.device.waiters().wait_until(
            clock,
            Some(deadline),
            self.device.timing().wait_slice(),
            Some(&self.cancel),
            || buf.state() == BufferState::Unmapped,
        );
        match outcome {
            WaitOutcome::Ready => Ok(Readiness::Ready),
            WaitOutcome::TimedOut => Ok(Readiness::Pending),
            WaitOutcome::Cancelled => Err(CaptureError::Interrupted),
        }
    }

    /// Read-only view of the whole ring, in ring order.
    pub fn mmap(&mut self, len: usize) -> Result<RingMap> {
        let ring = self.ring()?;
        if len > ring.total_size() {
            return Err(CaptureError::InvalidArgument(format!(
                "mapping {} bytes of a {} byte ring",
                len,
                ring.total_size()
            )));
        }
        Ok(RingMap { ring, len })
    }

    /// Rewind to the head and start a session explicitly.
    pub fn start(&mut self) -> Result<()> {
        let ring = self.ring()?;
        self.position_at_head(&ring);
        self.device.start()
    }

    pub fn stop(&mut self) -> Result<StopOutcome> {
        self.device.stop_with(&self.cancel)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.device.current_index()
    }

    pub fn last_error(&self) -> LastError {
        self.device.last_error()
    }

    /// Stop any session and release the handle.
    pub fn close(mut self) -> Result<StopOutcome> {
        self.release()
    }

    fn release(&mut self) -> Result<StopOutcome> {
        if self.closed {
            return Ok(StopOutcome::Idle);
        }
        self.closed = true;
        let result = self.device.stop();
        self.device
            .shared()
            .reader_open
            .store(false, Ordering::Release);
        debug!("reader closed");
        result
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "stop on reader drop failed");
        }
    }
}

impl io::Read for Reader {
    /// Cancellation surfaces as `ErrorKind::Interrupted`, which `read_exact`
    /// and `read_to_end` retry; call [`Reader::read`] directly to observe it.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Seek for Reader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(0) => SeekTarget::Start,
            io::SeekFrom::Current(n) if n >= 0 => SeekTarget::Forward(n as u64),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported seek {:?}", other),
                ))
            }
        };
        Reader::seek(self, target).map_err(io::Error::from)
    }
}

/// Read-only linear view over the ring.
pub struct RingMap {
    ring: Arc<BufferRing>,
    len: usize,
}

impl RingMap {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy from `offset`; returns bytes copied.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let end = dst.len().min(self.len - offset);
        self.ring.read_linear(offset, &mut dst[..end])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        let n = self.ring.read_linear(0, &mut out);
        out.truncate(n);
        out
    }

    /// The buffers behind the view, in mapping order.
    pub fn segments(&self) -> Vec<BufferInfo> {
        self.ring.snapshot()
    }
}
