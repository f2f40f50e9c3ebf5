//! Ring of DMA-capable capture buffers.
//!
//! Buffers live in a fixed array and are linked by index arithmetic only:
//! the successor of `i` is `(i + 1) % count`. Each slot carries an atomic
//! state tag so the interrupt path can retire and re-arm buffers without a lock.
//!
//! ```text
//!   write cursor (co-processor)          read cursor (consumer)
//!          │                                    │
//!          ▼                                    ▼
//!   ┌────────┐   ┌────────┐   ┌────────┐   ┌────────┐
//!   │ Mapped │──▶│ Mapped │──▶│Unmapped│──▶│Unmapped│──┐
//!   └────────┘   └────────┘   └────────┘   └────────┘  │
//!        ▲                                             │
//!        └─────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use memmap2::MmapMut;
use serde::Serialize;
use tracing::{debug, info};

use crate::context::Descriptor;
use crate::error::{CaptureError, Result};

/// Lifecycle of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum BufferState {
    /// Allocated, not yet handed to the co-processor.
    Alloc = 0,
    /// Owned by the co-processor, waiting to be filled.
    Mapped = 1,
    /// Filled and ready for the consumer.
    Unmapped = 2,
    /// Consumer reached it before it was filled.
    Dropped = 3,
}

impl BufferState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Alloc,
            1 => Self::Mapped,
            2 => Self::Unmapped,
            _ => Self::Dropped,
        }
    }
}

/// Physically contiguous memory the co-processor can write.
pub trait DmaRegion: Send + Sync {
    /// Bus address as seen by the co-processor. Zero means no backing.
    fn phys_addr(&self) -> u32;
    fn len(&self) -> usize;
    /// Copy out from `offset`; returns bytes copied.
    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize;
    /// Copy in at `offset`; returns bytes copied.
    fn write_at(&self, offset: usize, src: &[u8]) -> usize;
    fn fill(&self, byte: u8);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of DMA-capable regions.
pub trait DmaAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<Arc<dyn DmaRegion>>;
}

const HOST_DMA_BASE: u32 = 0x9000_0000;
const HOST_DMA_ALIGN: u32 = 4096;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HostPool {
    next_phys: Mutex<u32>,
    budget: Option<usize>,
    in_use: AtomicUsize,
    live: Mutex<BTreeMap<u32, Weak<HostRegion>>>,
}

/// Anonymous-mapping allocator with synthetic bus addresses.
///
/// Stands in for a coherent DMA pool on hosts without one. Addresses are
/// page aligned, never zero, and resolvable back to their region so a
/// software co-processor can write through them.
#[derive(Clone)]
pub struct HostDma {
    pool: Arc<HostPool>,
}

impl HostDma {
    pub fn new() -> Self {
        Self::with_budget(None)
    }

    /// Fail allocations once `budget` bytes are live.
    pub fn with_budget(budget: Option<usize>) -> Self {
        Self {
            pool: Arc::new(HostPool {
                next_phys: Mutex::new(HOST_DMA_BASE),
                budget,
                in_use: AtomicUsize::new(0),
                live: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.pool.in_use.load(Ordering::Acquire)
    }

    /// Region containing bus address `phys`.
    pub fn resolve(&self, phys: u32) -> Option<Arc<dyn DmaRegion>> {
        let live = lock(&self.pool.live);
        let (_, weak) = live.range(..=phys).next_back()?;
        let region = weak.upgrade()?;
        let end = region.phys as u64 + region.len as u64;
        if (phys as u64) < end {
            Some(region as Arc<dyn DmaRegion>)
        } else {
            None
        }
    }
}

impl Default for HostDma {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostDma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDma")
            .field("in_use", &self.bytes_in_use())
            .field("budget", &self.pool.budget)
            .finish()
    }
}

impl HostPool {
    /// Claim `size` bytes against the budget in one atomic step.
    fn reserve(&self, size: usize) -> Result<()> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use
                    .checked_add(size)
                    .filter(|&total| self.budget.map_or(true, |budget| total <= budget))
            })
            .map(|_| ())
            .map_err(|in_use| {
                CaptureError::ResourceExhausted(format!(
                    "DMA pool: {} bytes requested, {} of {:?} in use",
                    size, in_use, self.budget
                ))
            })
    }

    fn release(&self, size: usize) {
        self.in_use.fetch_sub(size, Ordering::AcqRel);
    }
}

impl HostDma {
    fn map_region(&self, size: usize) -> Result<Arc<HostRegion>> {
        let span = u32::try_from(size)
            .ok()
            .and_then(|s| s.checked_next_multiple_of(HOST_DMA_ALIGN))
            .ok_or_else(|| {
                CaptureError::ResourceExhausted(format!("{} bytes exceed the 32-bit bus", size))
            })?;

        let phys = {
            let mut next = lock(&self.pool.next_phys);
            let phys = *next;
            *next = next.checked_add(span).ok_or_else(|| {
                CaptureError::ResourceExhausted("DMA address space exhausted".into())
            })?;
            phys
        };

        let map = MmapMut::map_anon(size)
            .map_err(|e| CaptureError::ResourceExhausted(format!("mapping {} bytes: {}", size, e)))?;

        Ok(Arc::new(HostRegion {
            phys,
            len: size,
            map: Mutex::new(map),
            pool: Arc::downgrade(&self.pool),
        }))
    }
}

impl DmaAllocator for HostDma {
    fn allocate(&self, size: usize) -> Result<Arc<dyn DmaRegion>> {
        if size == 0 {
            return Err(CaptureError::InvalidArgument("zero-sized DMA region".into()));
        }
        self.pool.reserve(size)?;

        // the region hands the reservation back when dropped
        let region = match self.map_region(size) {
            Ok(region) => region,
            Err(e) => {
                self.pool.release(size);
                return Err(e);
            }
        };
        lock(&self.pool.live).insert(region.phys, Arc::downgrade(&region));

        Ok(region)
    }
}

struct HostRegion {
    phys: u32,
    len: usize,
    map: Mutex<MmapMut>,
    pool: Weak<HostPool>,
}

impl DmaRegion for HostRegion {
    fn phys_addr(&self) -> u32 {
        self.phys
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let map = lock(&self.map);
        let Some(src) = map.get(offset..) else {
            return 0;
        };
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut map = lock(&self.map);
        let Some(dst) = map.get_mut(offset..) else {
            return 0;
        };
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    fn fill(&self, byte: u8) {
        lock(&self.map).fill(byte);
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.len);
            lock(&pool.live).remove(&self.phys);
        }
    }
}

/// One slot of the ring.
pub struct LogicBuffer {
    index: u16,
    region: Arc<dyn DmaRegion>,
    state: AtomicU8,
}

impl LogicBuffer {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn phys_addr(&self) -> u32 {
        self.region.phys_addr()
    }

    pub fn size(&self) -> usize {
        self.region.len()
    }

    pub fn region(&self) -> &Arc<dyn DmaRegion> {
        &self.region
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: BufferState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mapped -> Dropped. True if this call recorded the drop.
    pub fn mark_dropped_if_stale(&self) -> bool {
        self.state
            .compare_exchange(
                BufferState::Mapped as u8,
                BufferState::Dropped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn descriptor(&self) -> Descriptor {
        let start = self.phys_addr();
        Descriptor {
            start,
            end: start.wrapping_add(self.size() as u32),
        }
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        self.region.read_at(offset, dst)
    }
}

impl fmt::Debug for LogicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicBuffer")
            .field("index", &self.index)
            .field("phys", &format_args!("{:#010x}", self.phys_addr()))
            .field("size", &self.size())
            .field("state", &self.state())
            .finish()
    }
}

/// Snapshot row for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    pub index: u16,
    pub phys_addr: u32,
    pub size: usize,
    pub state: BufferState,
}

/// Number of buffers for a `total` byte request in `unit` sized slots.
pub fn ring_count(total: usize, unit: usize) -> usize {
    total.div_ceil(unit).max(2)
}

#[derive(Debug)]
pub struct BufferRing {
    buffers: Box<[LogicBuffer]>,
    unit_size: usize,
    write_cursor: AtomicUsize,
}

impl BufferRing {
    /// Allocate `ring_count(total, unit)` regions, all Mapped and filled with 0xFF.
    pub fn allocate(
        dma: &dyn DmaAllocator,
        total: usize,
        unit: usize,
        max_count: usize,
    ) -> Result<Self> {
        if unit == 0 {
            return Err(CaptureError::InvalidArgument("buffer unit size 0".into()));
        }
        let count = ring_count(total, unit);
        if count > max_count {
            return Err(CaptureError::ResourceExhausted(format!(
                "{} bytes need {} buffers of {}, co-processor takes at most {}",
                total, count, unit, max_count
            )));
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let region = dma.allocate(unit)?;
            region.fill(0xFF);
            debug!(index, phys = format_args!("{:#010x}", region.phys_addr()), "buffer allocated");
            buffers.push(LogicBuffer {
                index: index as u16,
                region,
                state: AtomicU8::new(BufferState::Mapped as u8),
            });
        }

        info!(count, unit, "buffer ring allocated");
        Ok(Self {
            buffers: buffers.into_boxed_slice(),
            unit_size: unit,
            write_cursor: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn total_size(&self) -> usize {
        self.unit_size * self.count()
    }

    pub fn buffer(&self, index: usize) -> &LogicBuffer {
        &self.buffers[index % self.buffers.len()]
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.buffers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicBuffer> {
        self.buffers.iter()
    }

    /// Slot the co-processor is filling next.
    pub fn write_cursor(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_cursor(&self, index: usize) {
        self.write_cursor.store(index % self.count(), Ordering::Release);
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.buffers.iter().map(LogicBuffer::descriptor).collect()
    }

    pub fn set_all(&self, state: BufferState) {
        for buf in self.buffers.iter() {
            buf.set_state(state);
        }
    }

    /// Return every slot with real backing to Mapped. Fails on a slot without backing.
    pub fn repair(&self) -> Result<usize> {
        let mut repaired = 0;
        for buf in self.buffers.iter() {
            if buf.state() == BufferState::Mapped {
                continue;
            }
            if buf.phys_addr() == 0 {
                return Err(CaptureError::InvalidArgument(format!(
                    "buffer {} has no physical backing",
                    buf.index
                )));
            }
            buf.set_state(BufferState::Mapped);
            repaired += 1;
        }
        if repaired > 0 {
            debug!(repaired, "buffers returned to Mapped");
        }
        Ok(repaired)
    }

    /// Little-endian u32 counter continuing across buffers in ring order.
    pub fn fill_test_pattern(&self) {
        let mut counter: u32 = 0;
        for buf in self.buffers.iter() {
            let words = buf.size() / 4;
            let mut bytes = Vec::with_capacity(words * 4);
            for _ in 0..words {
                bytes.extend_from_slice(&counter.to_le_bytes());
                counter = counter.wrapping_add(1);
            }
            buf.region.write_at(0, &bytes);
        }
        info!(words = counter, "test pattern written");
    }

    pub fn snapshot(&self) -> Vec<BufferInfo> {
        self.buffers
            .iter()
            .map(|b| BufferInfo {
                index: b.index,
                phys_addr: b.phys_addr(),
                size: b.size(),
                state: b.state(),
            })
            .collect()
    }

    /// Copy from the ring as if it were one region laid out in ring order.
    pub fn read_linear(&self, mut offset: usize, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() && offset < self.total_size() {
            let buf = &self.buffers[offset / self.unit_size];
            let n = buf.read_at(offset % self.unit_size, &mut dst[copied..]);
            if n == 0 {
                break;
            }
            copied += n;
            offset += n;
        }
        copied
    }
}
