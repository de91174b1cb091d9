//! Physical page allocator.
//!
//! Grounded on `kernel-rs/src/kalloc.rs` (`Kmem`: a singly-linked free list
//! over a physical range, bump a watermark cursor on miss) and
//! `kernel-rs/src/page.rs` (`Page`, a 4 KB-aligned newtype). The teacher's
//! `Kmem` never needs reference counts because xv6-as-taught never shares a
//! physical page outside fork's (eager) copy; this spec's COW and shared
//! `mmap` (spec.md §4.4) require one, so `PageAllocator` adds the explicit
//! atomic refcount table spec.md §3 describes ("Each page carries an atomic
//! reference count stored in an array indexed by page number").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::param::PAGE;

/// A physical page frame number. Opaque index into [`PageAllocator`]'s
/// backing storage; not a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFrame(pub usize);

struct Frame {
    bytes: Mutex<[u8; PAGE]>,
    refcount: AtomicUsize,
}

/// Page-grained physical memory manager with reference counts.
///
/// Invariant (spec.md §4.1): a page whose refcount is `n` is reachable by
/// exactly `n` strong references (page-table entries or kernel holders).
/// The free list contains only pages with refcount 0.
pub struct PageAllocator {
    frames: Vec<Frame>,
    free_list: Mutex<Vec<PageFrame>>,
    watermark: AtomicUsize,
    zero_page: OnceLock<PageFrame>,
}

impl PageAllocator {
    /// Creates an allocator over `num_pages` physical pages, none of which
    /// are allocated yet.
    pub fn new(num_pages: usize) -> Self {
        let mut frames = Vec::with_capacity(num_pages);
        frames.resize_with(num_pages, || Frame {
            bytes: Mutex::new([0u8; PAGE]),
            refcount: AtomicUsize::new(0),
        });
        Self {
            frames,
            free_list: Mutex::new(Vec::new()),
            watermark: AtomicUsize::new(0),
            zero_page: OnceLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns a 4 KB page with refcount 1. Prefers the free list; on miss,
    /// bumps the watermark cursor (`kalloc.rs`'s behavior, minus the
    /// physical-address arithmetic since this crate owns the whole backing
    /// array instead of a raw address range).
    ///
    /// Returns `None` on out-of-memory (spec.md §4.1: "out-of-memory
    /// returns a null sentinel").
    pub fn alloc_page(&self) -> Option<PageFrame> {
        if let Some(frame) = self.free_list.lock().unwrap().pop() {
            self.frames[frame.0].refcount.store(1, Ordering::SeqCst);
            return Some(frame);
        }
        let idx = self.watermark.fetch_add(1, Ordering::SeqCst);
        if idx >= self.frames.len() {
            self.watermark.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        self.frames[idx].refcount.store(1, Ordering::SeqCst);
        Some(PageFrame(idx))
    }

    /// Decrements `frame`'s refcount; when it reaches 0, the frame is
    /// returned to the free list.
    pub fn free_page(&self, frame: PageFrame) {
        if self.decref(frame) == 0 {
            self.free_list.lock().unwrap().push(frame);
        }
    }

    pub fn incref(&self, frame: PageFrame) -> usize {
        self.frames[frame.0].refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements and returns the new refcount. Does *not* free the page;
    /// callers that want free-on-zero should use [`Self::free_page`].
    pub fn decref(&self, frame: PageFrame) -> usize {
        let prev = self.frames[frame.0].refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "decref on a page with refcount 0");
        prev - 1
    }

    pub fn refcount(&self, frame: PageFrame) -> usize {
        self.frames[frame.0].refcount.load(Ordering::SeqCst)
    }

    pub fn read(&self, frame: PageFrame, out: &mut [u8; PAGE]) {
        out.copy_from_slice(&*self.frames[frame.0].bytes.lock().unwrap());
    }

    pub fn write(&self, frame: PageFrame, data: &[u8; PAGE]) {
        self.frames[frame.0].bytes.lock().unwrap().copy_from_slice(data);
    }

    pub fn with_bytes<R>(&self, frame: PageFrame, f: impl FnOnce(&mut [u8; PAGE]) -> R) -> R {
        f(&mut self.frames[frame.0].bytes.lock().unwrap())
    }

    /// A shared, never-freed, zero-filled page used for read-only lazy
    /// mapping (spec.md §4.1). The allocator itself holds a permanent
    /// reference on top of every caller's, so its refcount never reaches 0
    /// through ordinary `free_page` calls.
    pub fn zero_page(&self) -> PageFrame {
        let frame = *self.zero_page.get_or_init(|| {
            let frame = self.alloc_page().expect("out of memory allocating zero page");
            frame
        });
        self.incref(frame);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_returns_to_free_list() {
        let alloc = PageAllocator::new(4);
        let a = alloc.alloc_page().unwrap();
        assert_eq!(alloc.refcount(a), 1);
        alloc.free_page(a);
        assert_eq!(alloc.refcount(a), 0);
        let b = alloc.alloc_page().unwrap();
        assert_eq!(a, b, "freed page should be reused before bumping watermark");
    }

    #[test]
    fn out_of_memory_returns_none() {
        let alloc = PageAllocator::new(1);
        assert!(alloc.alloc_page().is_some());
        assert!(alloc.alloc_page().is_none());
    }

    #[test]
    fn shared_refcount_tracks_holders() {
        let alloc = PageAllocator::new(4);
        let a = alloc.alloc_page().unwrap();
        alloc.incref(a);
        assert_eq!(alloc.refcount(a), 2);
        alloc.free_page(a);
        assert_eq!(alloc.refcount(a), 1);
        alloc.free_page(a);
        assert_eq!(alloc.refcount(a), 0);
    }

    #[test]
    fn zero_page_never_reaches_zero() {
        let alloc = PageAllocator::new(4);
        let z1 = alloc.zero_page();
        let z2 = alloc.zero_page();
        assert_eq!(z1, z2);
        alloc.free_page(z1);
        assert!(alloc.refcount(z1) >= 1, "zero page must survive a caller's free");
    }
}
