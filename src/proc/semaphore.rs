//! Counting semaphores with alertable wait: the kernel's one blocking
//! primitive, used for run-queue admission ([`super::scheduler`]), pipe and
//! console flow control, and `wait(2)`/child-exit notification.
//!
//! Grounded on `kernel-rs/src/proc/wait_channel.rs`'s `WaitChannel`
//! (`sleep` atomically releases a caller-held lock and blocks; `wakeup`
//! scans every process sleeping on the channel and makes it runnable
//! again). `WaitChannel` is a bare broadcast condition with no notion of a
//! count or of a specific sleeper, because xv6's `kill` never needs to
//! reach into a sleeper individually — it just flips a "killed" flag the
//! sleeper checks *after* it next wakes for an unrelated reason. spec.md's
//! kill-while-blocked-in-read scenario needs the opposite: a blocked reader
//! must wake up immediately and return `Interrupted`, without anyone else
//! posting the semaphore. `Semaphore` keeps `WaitChannel`'s broadcast
//! `Condvar` shape but adds a per-pid alert set so [`Semaphore::alert_proc`]
//! can target exactly one blocked waiter.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use crate::error::{KernelError, Result};

struct State {
    count: i64,
    alerted: HashSet<i32>,
}

/// A counting semaphore. `wait`/`unalertable_wait` block while the count is
/// zero or negative; `post` increments it and wakes every waiter so they can
/// recheck.
pub struct Semaphore {
    state: Mutex<State>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: i64) -> Self {
        Self {
            state: Mutex::new(State {
                count: initial,
                alerted: HashSet::new(),
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn count(&self) -> i64 {
        self.state.lock().unwrap().count
    }

    /// Increments the count and wakes every blocked waiter.
    pub fn post(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        self.cvar.notify_all();
    }

    /// Blocks `pid` until the count is positive, then consumes one unit.
    /// Returns `Err(Interrupted)` without consuming anything if another
    /// thread calls [`Self::alert_proc`] with the same pid while blocked
    /// (spec.md §4.8's "kill wakes a process blocked in a syscall").
    pub fn wait(&self, pid: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.alerted.remove(&pid) {
                return Err(KernelError::Interrupted);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            state = self.cvar.wait(state).unwrap();
        }
    }

    /// Like [`Self::wait`], but ignores alerts. Used for sections that must
    /// not be interrupted by `kill` (e.g. holding a sleeplock across disk
    /// I/O), matching the teacher's plain, non-interruptible `sleep`.
    pub fn unalertable_wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.count <= 0 {
            state = self.cvar.wait(state).unwrap();
        }
        state.count -= 1;
    }

    /// Marks `pid` for interruption. If `pid` is currently blocked in
    /// [`Self::wait`] on this semaphore, it wakes with `Err(Interrupted)`.
    /// If `pid` is not currently waiting, the alert is consumed by its next
    /// `wait` call instead of being lost, mirroring `kill`'s
    /// fire-and-forget semantics when the target hasn't blocked yet.
    pub fn alert_proc(&self, pid: i32) {
        let mut state = self.state.lock().unwrap();
        state.alerted.insert(pid);
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_consumes_a_unit_posted_by_another_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || sem2.wait(1));
        thread::sleep(Duration::from_millis(20));
        sem.post();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn alert_proc_interrupts_a_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || sem2.wait(42));
        thread::sleep(Duration::from_millis(20));
        sem.alert_proc(42);
        assert_eq!(handle.join().unwrap(), Err(KernelError::Interrupted));
    }

    #[test]
    fn alert_does_not_affect_other_pids() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || sem2.wait(7));
        thread::sleep(Duration::from_millis(20));
        sem.alert_proc(99);
        sem.post();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }
}
