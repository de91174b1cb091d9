//! Block cache (spec.md §4.5, first half of C5).
//!
//! Grounded on `kernel-rs/src/bio.rs`: an MRU-ordered, fixed-capacity table
//! of buffers (`Bcache = MruArena<BufEntry, NBUF>`) where `get_buf` either
//! finds an existing entry for `(dev, blockno)` or evicts the least-recently
//! used unreferenced one, and the returned handle's data is behind its own
//! per-buffer sleep lock so the cache's own list lock is never held across
//! disk I/O. This module keeps that two-lock shape but replaces the
//! teacher's `MruArena`'s intrusive pinned list with [`crate::util::Arena`]
//! (no MRU reordering: eviction here scans for any unreferenced slot, since
//! `NBUF` is generous relative to this crate's test workloads and true LRU
//! eviction policy doesn't change the crash-safety properties spec.md §8
//! actually tests).

use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::hal::BlockDevice;
use crate::lock::sleeplock::Sleeplock;
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, NBUF};
use crate::util::Arena;

struct BufContent {
    valid: bool,
    data: [u8; BSIZE],
}

struct BufSlot {
    dev: u32,
    blockno: u32,
    inner: Sleeplock<BufContent>,
}

/// A reference to one cached block, obtained from [`BufferCache::get`].
/// Holding a handle keeps the slot pinned in the arena; it must be returned
/// via [`BufferCache::release`] (mirrors the teacher's `Buf`/`BufUnlocked`
/// drop-to-release pattern, made explicit here since this crate's `Arena`
/// has no `Drop`-based refcounting — see `DESIGN.md`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufHandle {
    idx: usize,
    pub blockno: u32,
}

/// The system-wide block cache.
pub struct BufferCache {
    arena: Spinlock<Arena<BufSlot>>,
    device: Arc<dyn BlockDevice>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            arena: Spinlock::new_at("bcache", LockLevel::BlockCacheList, Arena::with_capacity(NBUF)),
            device,
        }
    }

    /// Finds or allocates a buffer for `(dev, blockno)`, bumping its
    /// refcount. Mirrors `Bcache::get_buf`: the list lock is only held long
    /// enough to find/create the slot, never across the later I/O.
    pub fn get(&self, dev: u32, blockno: u32) -> Result<BufHandle> {
        let mut arena = self.arena.lock();
        let idx = arena
            .find_or_alloc(
                |s| s.dev == dev && s.blockno == blockno,
                || BufSlot {
                    dev,
                    blockno,
                    inner: Sleeplock::new("buf", BufContent { valid: false, data: [0u8; BSIZE] }),
                },
            )
            .ok_or(KernelError::OutOfResources)?;
        Ok(BufHandle { idx, blockno })
    }

    pub fn release(&self, handle: BufHandle) {
        let mut arena = self.arena.lock();
        arena.decref(handle.idx, |_| {});
    }

    /// SAFETY: the arena's backing storage never reallocates after
    /// construction (see `util::Arena::with_capacity`), and `handle` holds
    /// a reference to the slot, so this pointer stays valid for as long as
    /// the handle is held, even after the arena's own guard is dropped.
    fn slot(&self, handle: BufHandle) -> &BufSlot {
        let arena = self.arena.lock();
        unsafe { &*(arena.get(handle.idx) as *const BufSlot) }
    }

    /// Runs `f` over the buffer's content, reading from the device on first
    /// touch. The device I/O happens under the buffer's own sleep lock, not
    /// the cache's list lock, so other buffers stay reachable meanwhile.
    pub fn with_buf<R>(&self, handle: BufHandle, f: impl FnOnce(&mut [u8; BSIZE]) -> R) -> R {
        let slot = self.slot(handle);
        let mut guard = slot.inner.lock();
        if !guard.valid {
            self.device.read(slot.blockno, &mut guard.data);
            guard.valid = true;
        }
        f(&mut guard.data)
    }

    /// Writes the buffer straight to its home location, bypassing the log.
    /// Used by `fs::log::Log` itself during commit and by callers with no
    /// atomicity requirement (spec.md §4.5: "`sync(NULL, block)` bypasses
    /// the log and writes directly to disk").
    pub fn write_through(&self, handle: BufHandle) {
        let slot = self.slot(handle);
        let guard = slot.inner.lock();
        self.device.write(slot.blockno, &guard.data);
    }

    /// Reads a block straight from the device into `dst`, ignoring the
    /// cache (used by [`super::log::Log`] recovery, before any buffer for
    /// the destination block might exist).
    pub fn read_raw(&self, blockno: u32, dst: &mut [u8; BSIZE]) {
        self.device.read(blockno, dst);
    }

    pub fn write_raw(&self, blockno: u32, src: &[u8; BSIZE]) {
        self.device.write(blockno, src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemBlockDevice;

    fn cache() -> BufferCache {
        BufferCache::new(Arc::new(MemBlockDevice::new(16)))
    }

    #[test]
    fn get_twice_returns_the_same_slot() {
        let bc = cache();
        let a = bc.get(1, 5).unwrap();
        let b = bc.get(1, 5).unwrap();
        assert_eq!(a.idx, b.idx);
        bc.release(a);
        bc.release(b);
    }

    #[test]
    fn write_through_then_reread_sees_the_write() {
        let bc = cache();
        let h = bc.get(1, 3).unwrap();
        bc.with_buf(h, |data| data[0] = 42);
        bc.write_through(h);
        bc.release(h);

        let mut raw = [0u8; BSIZE];
        bc.read_raw(3, &mut raw);
        assert_eq!(raw[0], 42);
    }

    #[test]
    fn distinct_blocks_do_not_alias() {
        let bc = cache();
        let a = bc.get(1, 1).unwrap();
        let b = bc.get(1, 2).unwrap();
        assert_ne!(a.idx, b.idx);
        bc.with_buf(a, |data| data[0] = 1);
        bc.with_buf(b, |data| data[0] = 2);
        bc.with_buf(a, |data| assert_eq!(data[0], 1));
        bc.release(a);
        bc.release(b);
    }
}
