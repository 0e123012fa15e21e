//! Fixed pool of shareable image buffers and the ownership map both device
//! domains go through.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use tracing::{debug, warn};

use crate::capture::PixelFormat;
use crate::error::{Error, Result};

const NO_SCANOUT: usize = usize::MAX;

/// Stable identity of a pool buffer; also its device-side buffer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    Free = 0,
    OwnedByCapture = 1,
    CapturedPending = 2,
    OwnedByDisplay = 3,
}

impl Ownership {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::OwnedByCapture,
            2 => Self::CapturedPending,
            _ => Self::OwnedByDisplay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Exported from a device, importable by DRM PRIME
    DmaBuf,
    /// Anonymous shared memory, only usable by in-process devices
    Memfd,
}

/// Memory handed out by a [`BufferAllocator`] for one buffer.
#[derive(Debug)]
pub struct BufferMemory {
    pub fd: OwnedFd,
    pub kind: MemoryKind,
    pub len: usize,
    pub planes: Vec<PlaneLayout>,
}

/// Source of shareable buffer memory, implemented by capture devices.
pub trait BufferAllocator {
    fn allocate(
        &mut self,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<BufferMemory>>;
}

#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    width: u32,
    height: u32,
    format: PixelFormat,
    memory: BufferMemory,
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn planes(&self) -> &[PlaneLayout] {
        &self.memory.planes
    }

    pub fn len(&self) -> usize {
        self.memory.len
    }

    pub fn is_empty(&self) -> bool {
        self.memory.len == 0
    }

    pub fn kind(&self) -> MemoryKind {
        self.memory.kind
    }

    /// Shareable handle; the same memory the other domain sees.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.memory.fd.as_fd()
    }
}

struct Slot {
    buffer: Buffer,
    state: CachePadded<AtomicU8>,
}

/// Per-state buffer counts at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub free: usize,
    pub capture: usize,
    pub pending: usize,
    pub display: usize,
}

impl Census {
    pub fn total(&self) -> usize {
        self.free + self.capture + self.pending + self.display
    }

    /// Buffers the capture side still has to hand back.
    pub fn in_flight(&self) -> usize {
        self.capture + self.pending
    }
}

/// Fixed set of buffers created once at setup. Transitions are single
/// compare-and-swap operations so diagnostics can read states at any time.
pub struct BufferPool {
    slots: Box<[Slot]>,
    scanout: AtomicUsize,
}

impl BufferPool {
    pub fn create<A: BufferAllocator + ?Sized>(
        allocator: &mut A,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if count < 2 {
            return Err(Error::Allocation(format!(
                "a handoff pool needs at least 2 buffers, {count} requested"
            )));
        }

        let memory = allocator.allocate(count, format, width, height)?;
        if memory.len() != count {
            return Err(Error::Allocation(format!(
                "device provided {} of {count} buffers",
                memory.len()
            )));
        }

        let slots = memory
            .into_iter()
            .enumerate()
            .map(|(index, memory)| Slot {
                buffer: Buffer {
                    id: BufferId(index),
                    width,
                    height,
                    format,
                    memory,
                },
                state: CachePadded::new(AtomicU8::new(Ownership::Free as u8)),
            })
            .collect();

        debug!(count, ?format, width, height, "buffer pool created");

        Ok(Self {
            slots,
            scanout: AtomicUsize::new(NO_SCANOUT),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        (0..self.slots.len()).map(BufferId)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> + '_ {
        self.slots.iter().map(|slot| &slot.buffer)
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.slots.get(id.0).map(|slot| &slot.buffer)
    }

    pub fn state(&self, id: BufferId) -> Ownership {
        Ownership::from_u8(self.slots[id.0].state.load(Ordering::Acquire))
    }

    /// A buffer in `Free`, or `None` when the pool is exhausted. Never blocks.
    pub fn acquire_free(&self) -> Option<BufferId> {
        self.slots
            .iter()
            .position(|slot| slot.state.load(Ordering::Acquire) == Ownership::Free as u8)
            .map(BufferId)
    }

    pub fn mark_owned_by_capture(&self, id: BufferId) -> Result<()> {
        self.transition(id, &[Ownership::Free], Ownership::OwnedByCapture)
    }

    pub fn mark_captured_pending(&self, id: BufferId) -> Result<()> {
        self.transition(id, &[Ownership::OwnedByCapture], Ownership::CapturedPending)
    }

    pub fn mark_owned_by_display(&self, id: BufferId) -> Result<()> {
        self.transition(id, &[Ownership::CapturedPending], Ownership::OwnedByDisplay)
    }

    /// Returns a buffer to `Free`. The buffer currently on screen can't be freed.
    pub fn mark_free(&self, id: BufferId) -> Result<()> {
        if self.scanout.load(Ordering::Acquire) == id.0 {
            return Err(Error::InvalidOwnershipTransition {
                buffer: id,
                from: Ownership::OwnedByDisplay,
                to: Ownership::Free,
            });
        }
        self.transition(
            id,
            &[
                Ownership::OwnedByCapture,
                Ownership::CapturedPending,
                Ownership::OwnedByDisplay,
            ],
            Ownership::Free,
        )
    }

    /// Records `id` as the buffer on screen and returns the one it replaced.
    pub fn promote_to_scanout(&self, id: BufferId) -> Result<Option<BufferId>> {
        let current = self.state(id);
        if current != Ownership::OwnedByDisplay {
            return Err(Error::InvalidOwnershipTransition {
                buffer: id,
                from: current,
                to: Ownership::OwnedByDisplay,
            });
        }
        let previous = self.scanout.swap(id.0, Ordering::AcqRel);
        Ok((previous != NO_SCANOUT && previous != id.0).then_some(BufferId(previous)))
    }

    pub fn scanout(&self) -> Option<BufferId> {
        let current = self.scanout.load(Ordering::Acquire);
        (current != NO_SCANOUT).then_some(BufferId(current))
    }

    /// Forgets the on-screen buffer so teardown can free it.
    pub fn release_scanout(&self) -> Option<BufferId> {
        let previous = self.scanout.swap(NO_SCANOUT, Ordering::AcqRel);
        (previous != NO_SCANOUT).then_some(BufferId(previous))
    }

    pub fn census(&self) -> Census {
        let mut census = Census::default();
        for slot in self.slots.iter() {
            match Ownership::from_u8(slot.state.load(Ordering::Acquire)) {
                Ownership::Free => census.free += 1,
                Ownership::OwnedByCapture => census.capture += 1,
                Ownership::CapturedPending => census.pending += 1,
                Ownership::OwnedByDisplay => census.display += 1,
            }
        }
        census
    }

    /// Teardown only: forces every buffer back to `Free`. Returns how many
    /// buffers had not been handed back.
    pub fn reclaim_all(&self) -> usize {
        self.scanout.store(NO_SCANOUT, Ordering::Release);
        let mut forced = 0;
        for slot in self.slots.iter() {
            let previous = slot.state.swap(Ownership::Free as u8, Ordering::AcqRel);
            if previous != Ownership::Free as u8 {
                warn!(
                    buffer = %slot.buffer.id,
                    state = ?Ownership::from_u8(previous),
                    "reclaiming buffer that was never returned"
                );
                forced += 1;
            }
        }
        forced
    }

    fn transition(&self, id: BufferId, from: &[Ownership], to: Ownership) -> Result<()> {
        let state = &self.slots[id.0].state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if !from.iter().any(|allowed| *allowed as u8 == current) {
                return Err(Error::InvalidOwnershipTransition {
                    buffer: id,
                    from: Ownership::from_u8(current),
                    to,
                });
            }
            match state.compare_exchange_weak(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.slots.len())
            .field("census", &self.census())
            .field("scanout", &self.scanout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::HeapAllocator;

    fn pool(count: usize) -> BufferPool {
        BufferPool::create(&mut HeapAllocator::default(), count, PixelFormat::Xrgb8888, 64, 48)
            .unwrap()
    }

    #[test]
    fn create_rejects_single_buffer_pools() {
        let err = BufferPool::create(
            &mut HeapAllocator::default(),
            1,
            PixelFormat::Xrgb8888,
            64,
            48,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
    }

    #[test]
    fn create_surfaces_allocator_failure() {
        let mut allocator = HeapAllocator {
            fail: true,
            ..Default::default()
        };
        let err = BufferPool::create(&mut allocator, 4, PixelFormat::Xrgb8888, 64, 48).unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
    }

    #[test]
    fn buffers_carry_geometry_and_layout() {
        let pool = pool(3);
        let buffer = pool.buffer(BufferId(2)).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (64, 48));
        assert_eq!(buffer.planes()[0].stride, 64 * 4);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn full_cycle_keeps_census_consistent() {
        let pool = pool(4);
        let id = pool.acquire_free().unwrap();

        pool.mark_owned_by_capture(id).unwrap();
        pool.mark_captured_pending(id).unwrap();
        pool.mark_owned_by_display(id).unwrap();
        assert_eq!(pool.census().display, 1);
        assert_eq!(pool.census().total(), 4);

        pool.mark_free(id).unwrap();
        assert_eq!(pool.census().free, 4);
    }

    #[test]
    fn exhausted_pool_signals_backpressure() {
        let pool = pool(2);
        for id in pool.ids().collect::<Vec<_>>() {
            pool.mark_owned_by_capture(id).unwrap();
        }
        assert_eq!(pool.acquire_free(), None);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let pool = pool(2);
        let id = BufferId(0);

        let err = pool.mark_owned_by_display(id).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidOwnershipTransition {
                from: Ownership::Free,
                to: Ownership::OwnedByDisplay,
                ..
            }
        ));
        assert!(pool.mark_free(id).is_err());
        assert_eq!(pool.state(id), Ownership::Free);
    }

    #[test]
    fn scanout_buffer_cannot_be_freed() {
        let pool = pool(3);
        let (a, b) = (BufferId(0), BufferId(1));
        for id in [a, b] {
            pool.mark_owned_by_capture(id).unwrap();
            pool.mark_captured_pending(id).unwrap();
            pool.mark_owned_by_display(id).unwrap();
        }

        assert_eq!(pool.promote_to_scanout(a).unwrap(), None);
        assert!(pool.mark_free(a).is_err());

        assert_eq!(pool.promote_to_scanout(b).unwrap(), Some(a));
        pool.mark_free(a).unwrap();
        assert!(pool.mark_free(b).is_err());

        assert_eq!(pool.release_scanout(), Some(b));
        pool.mark_free(b).unwrap();
        assert_eq!(pool.census().free, 3);
    }

    #[test]
    fn reclaim_forces_everything_free() {
        let pool = pool(3);
        pool.mark_owned_by_capture(BufferId(0)).unwrap();
        pool.mark_owned_by_capture(BufferId(1)).unwrap();
        pool.mark_captured_pending(BufferId(1)).unwrap();

        assert_eq!(pool.reclaim_all(), 2);
        assert_eq!(pool.census().free, 3);
    }
}
