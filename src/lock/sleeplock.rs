//! Sleeplocks: long-term locks held across blocking operations (disk I/O,
//! inode metadata edits), which deschedule the waiter instead of spinning.
//!
//! Grounded on `kernel-rs/src/lock/sleeplock.rs`, which implements
//! `RawSleeplock` on top of a `Sleepablelock<i32>` holding the pid of the
//! current owner (`-1` when free) and a wait/wakeup pair. This crate
//! doesn't have a free-standing wait-channel type (see
//! [`crate::proc::semaphore`]), so the same "holder id, -1 means free" idea
//! is implemented directly on a [`std::sync::Condvar`].
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use super::{Lock, RawLock};

pub struct RawSleeplock {
    name: &'static str,
    holder: Mutex<Option<ThreadId>>,
    cvar: Condvar,
}

pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = super::Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            holder: Mutex::new(None),
            cvar: Condvar::new(),
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let me = thread::current().id();
        let mut holder = self.holder.lock().unwrap();
        assert_ne!(*holder, Some(me), "acquire {}: already held by caller", self.name);
        while holder.is_some() {
            holder = self.cvar.wait(holder).unwrap();
        }
        *holder = Some(me);
    }

    fn release(&self) {
        let mut holder = self.holder.lock().unwrap();
        assert_eq!(
            *holder,
            Some(thread::current().id()),
            "release {}: not held by caller",
            self.name
        );
        *holder = None;
        self.cvar.notify_one();
    }

    fn holding(&self) -> bool {
        *self.holder.lock().unwrap() == Some(thread::current().id())
    }
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(RawSleeplock::new(name), data)
    }
}
