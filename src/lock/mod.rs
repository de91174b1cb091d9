//! Lock primitives.
//!
//! Grounded on `kernel-rs-lib/src/lock.rs`'s `RawLock`/`Lock`/`Guard` split:
//! a [`Lock<R, T>`] pairs a raw locking strategy `R` with the data `T` it
//! protects, and handing out a [`Guard`] is the only way to reach `T`. The
//! teacher's version additionally threads `Pin`/`StrongPin` through this
//! type so that `!Unpin` data living inside a lock can be self-referential;
//! this crate's arenas never need that (see `DESIGN.md`), so that half of
//! the teacher's `Lock` is dropped and `Guard` is a plain `DerefMut` guard.
//!
//! [`spinlock`] and [`sleeplock`] each supply an `R: RawLock`.

pub mod sleeplock;
pub mod spinlock;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub use sleeplock::Sleeplock;
pub use spinlock::Spinlock;

/// A raw mutual-exclusion strategy: acquire/release a critical section
/// around `Lock<R, T>`'s data. Implementors decide *how* a thread waits
/// (busy loop vs. parking).
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn holding(&self) -> bool;
}

/// Mutual-exclusion lock built from a [`RawLock`] strategy `R` plus the
/// data `T` it protects.
pub struct Lock<R: RawLock, T> {
    raw: R,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only possible through a `Guard`, which is only
// handed out while `raw` is held.
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn from_raw(raw: R, data: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.raw.acquire();
        Guard { lock: self }
    }

    pub fn raw(&self) -> &R {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Guarantees exclusive access to a [`Lock`]'s data for as long as it lives.
/// Releases the lock on drop, matching the teacher's `Guard`.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, then reacquires.
    ///
    /// Used by [`crate::proc::semaphore::Semaphore::wait`] to release a
    /// process's scheduler lock around the actual descheduling step, the
    /// same pattern `kernel-rs/src/proc/wait_channel.rs`'s `sleep` uses.
    pub fn reacquire_after<F: FnOnce() -> U, U>(&mut self, f: F) -> U {
        self.lock.raw.release();
        let result = f();
        self.lock.raw.acquire();
        result
    }

    pub fn get_lock(&self) -> &Lock<R, T> {
        self.lock
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: `raw` is held for the lifetime of this guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: `raw` is held exclusively for the lifetime of this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}
