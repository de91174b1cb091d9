//! CPU admission: at most [`crate::param::NCPU`] processes run at once.
//!
//! Grounded on `kernel-rs/src/proc/procs.rs`'s per-CPU run queues and
//! `scheduler()` loop, which pick a `RUNNABLE` proc and `swtch()` into it.
//! Since this crate models a process as a real `std::thread` rather than a
//! context `swtch()`es into (spec.md §9's "green thread over kernel
//! thread" license; see `DESIGN.md`), there is no context to switch to —
//! the OS scheduler already interleaves the threads. What the teacher's run
//! queues actually bound is *how many processes may be running
//! simultaneously*, so `Scheduler` reproduces exactly that bound as an
//! `NCPU`-permit [`super::semaphore::Semaphore`]: a process calls
//! [`Scheduler::acquire_cpu`] before running user code and
//! [`Scheduler::release_cpu`] before blocking or exiting, and
//! [`Scheduler::yield_cpu`] implements preemption at a timer tick
//! (spec.md §4.9) by releasing and immediately re-acquiring a permit,
//! giving any other waiting process a chance to run first.
//!
//! `Scheduler` itself only bounds admission; the actual state-transition
//! table (spec.md §4.9: `UNUSED → RUNNABLE`, `RUNNING ⇄ RUNNABLE`,
//! `RUNNING → SLEEPING`, `RUNNING → ZOMBIE`) is recorded on [`super::Proc`]
//! and driven from the two places a process's run state actually changes:
//! [`super::syscall::dispatch`] calls [`Scheduler::acquire_cpu`] then
//! [`super::ProcessTable::mark_running`] on entry and
//! [`super::ProcessTable::mark_runnable`] on return, and
//! [`super::Proc::set_blocked_on`] flips a process to `Sleeping` for the
//! duration of a blocking pipe/console read or write. The runqueue itself
//! (spec.md §8 property 5) is queryable via [`super::ProcessTable::runqueue`].

use super::semaphore::Semaphore;
use crate::error::Result;

pub struct Scheduler {
    cpu_permits: Semaphore,
}

impl Scheduler {
    pub fn new(ncpu: usize) -> Self {
        Self {
            cpu_permits: Semaphore::new(ncpu as i64),
        }
    }

    /// Blocks `pid` until a CPU is free, then claims it. Interruptible by
    /// `kill` so a process killed while merely waiting to be scheduled
    /// doesn't wait forever.
    pub fn acquire_cpu(&self, pid: i32) -> Result<()> {
        self.cpu_permits.wait(pid)
    }

    pub fn release_cpu(&self) {
        self.cpu_permits.post();
    }

    /// Voluntary preemption point: give up the CPU and get back in line for
    /// one, called when a timer tick lands on the running process
    /// (spec.md §4.9's `ELAPSE`-tick quantum).
    pub fn yield_cpu(&self, pid: i32) -> Result<()> {
        self.release_cpu();
        self.acquire_cpu(pid)
    }

    pub fn cpus_free(&self) -> i64 {
        self.cpu_permits.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn admits_at_most_ncpu_at_once() {
        let sched = Arc::new(Scheduler::new(2));
        sched.acquire_cpu(1).unwrap();
        sched.acquire_cpu(2).unwrap();
        assert_eq!(sched.cpus_free(), 0);
        sched.release_cpu();
        assert_eq!(sched.cpus_free(), 1);
    }

    #[test]
    fn yield_cpu_lets_another_process_in() {
        let sched = Arc::new(Scheduler::new(1));
        sched.acquire_cpu(1).unwrap();
        let sched2 = sched.clone();
        let handle = thread::spawn(move || sched2.acquire_cpu(2));
        sched.yield_cpu(1).unwrap();
        handle.join().unwrap().unwrap();
    }
}
