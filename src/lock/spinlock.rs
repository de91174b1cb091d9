//! Spinlocks: busy-wait mutual exclusion.
//!
//! Grounded on `kernel-rs/src/lock/spinlock.rs`'s `RawSpinlock`: an atomic
//! compare-exchange busy loop that records which holder has the lock. The
//! teacher additionally disables interrupts for the duration of the
//! critical section (`push_off`/`pop_off`) because a real CPU could take a
//! timer interrupt mid-section; since this crate's "CPUs" are `std::thread`s
//! with no asynchronous interrupt delivery (see `DESIGN.md`), that half is
//! dropped and the holder is a [`std::thread::ThreadId`] instead of a `*mut
//! Cpu`.
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};
use std::cell::Cell;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use super::{Lock, RawLock};

/// Position of a spinlock in the acquire order documented in spec.md §5:
/// `process-table → scheduler → block-cache.list → log → bitmap →
/// per-block sleep-lock → inode sleep-lock → per-file-table`.
///
/// Sleep-locks are not spinlocks and are checked separately by
/// [`super::sleeplock::Sleeplock`]. This is a debug-only aid; it costs
/// nothing in release builds and the teacher has no equivalent (a kernel
/// text this size is usually checked by a human instead), but it is cheap
/// and the spec's own lock-order table all but asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    ProcessTable = 0,
    Scheduler = 1,
    BlockCacheList = 2,
    Log = 3,
    Bitmap = 4,
    Other = 5,
}

thread_local! {
    static HELD_LEVELS: Cell<Vec<LockLevel>> = const { Cell::new(Vec::new()) };
}

fn push_level(level: LockLevel) {
    HELD_LEVELS.with(|cell| {
        let mut v = cell.take();
        if let Some(&top) = v.last() {
            debug_assert!(
                level >= top,
                "lock order violation: acquired {:?} while holding {:?}",
                level,
                top
            );
        }
        v.push(level);
        cell.set(v);
    });
}

fn pop_level() {
    HELD_LEVELS.with(|cell| {
        let mut v = cell.take();
        v.pop();
        cell.set(v);
    });
}

/// Mutual-exclusion lock that busy-waits.
pub struct RawSpinlock {
    name: &'static str,
    level: LockLevel,
    locked: AtomicBool,
    holder: Mutex<Option<ThreadId>>,
}

pub type SpinlockRaw = RawSpinlock;
pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str, level: LockLevel) -> Self {
        Self {
            name,
            level,
            locked: AtomicBool::new(false),
            holder: Mutex::new(None),
        }
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        assert!(!self.holding(), "acquire {}: already held by caller", self.name);
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        *self.holder.lock().unwrap() = Some(thread::current().id());
        push_level(self.level);
    }

    fn release(&self) {
        assert!(self.holding(), "release {}: not held by caller", self.name);
        pop_level();
        *self.holder.lock().unwrap() = None;
        self.locked.store(false, Ordering::Release);
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && *self.holder.lock().unwrap() == Some(thread::current().id())
    }
}

impl<T> Spinlock<T> {
    pub const fn new_at(name: &'static str, level: LockLevel, data: T) -> Self {
        Lock::from_raw(RawSpinlock::new(name, level), data)
    }

    pub const fn new(name: &'static str, data: T) -> Self {
        Self::new_at(name, LockLevel::Other, data)
    }
}
