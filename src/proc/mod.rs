//! Process table and lifecycle: fork/exit/wait/kill over a fixed-capacity
//! table of processes (spec.md §4.9, §4.10).
//!
//! Grounded on `kernel-rs/src/proc/mod.rs`'s `Proc`/`ProcInfo`/`ProcData`
//! split (lock-protected state vs. process-private data) and
//! `kernel-rs/src/proc/procs.rs`'s `Procs` (the fixed `[Proc; NPROC]` table,
//! `alloc_proc` scanning for an `UNUSED` slot, `wait`/`exit` reparenting
//! orphans to `initial_proc`). The teacher's table lives behind a
//! `SpinLock` and processes block via `WaitChannel` broadcast; this
//! module's table instead sits behind a plain `Mutex` + `Condvar` pair
//! (`wait(2)`'s "recheck a predicate, sleep if false" shape doesn't fit a
//! spinning lock) while [`semaphore::Semaphore`] still drives every other
//! blocking point (pipes, console, the log, [`scheduler::Scheduler`]).

pub mod scheduler;
pub mod semaphore;

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{KernelError, Result};
use crate::mm::AddressSpace;
use crate::param::{MAXPROCNAME, NOFILE, NPROC};
use crate::util::Arena;
use semaphore::Semaphore;

pub type Pid = i32;

/// spec.md §3/§4.9's process state machine (`DEEPSLEEPING` folds into
/// `Sleeping` here: both are "blocked on a semaphore", and this crate's
/// [`semaphore::Semaphore::unalertable_wait`] already distinguishes
/// interruptibility without needing a second state to track it). `Used`
/// mirrors spec.md's `UNUSED` naming but is never constructed: `alloc`
/// doubles as spec.md's `init_proc` *and* `start_proc` (there is no
/// reserved-but-not-yet-runnable slot in this table), so a process is
/// `Runnable` from the moment it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Used,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// One process. `open_files` holds indices into the system-wide file table
/// (spec.md §4.7); `cwd` holds an index into the inode cache. Both are
/// opaque `usize`s here to avoid a dependency from `proc` on `fs`/`file` —
/// the syscall layer, which depends on all three, interprets them.
pub struct Proc {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: [u8; MAXPROCNAME],
    pub state: ProcState,
    pub xstate: i32,
    pub killed: bool,
    pub cwd: Option<usize>,
    pub open_files: [Option<usize>; NOFILE],
    pub address_space: Option<AddressSpace>,
    /// The semaphore `pid` is currently blocked on, if any. Populated by
    /// whatever subsystem is about to block this process (pipe, console,
    /// log) so [`ProcessTable::kill`] can reach in and interrupt it.
    blocked_on: Option<Arc<Semaphore>>,
}

impl Proc {
    fn new(pid: Pid, parent: Option<Pid>, name: &[u8]) -> Self {
        let mut name_buf = [0u8; MAXPROCNAME];
        let n = name.len().min(MAXPROCNAME);
        name_buf[..n].copy_from_slice(&name[..n]);
        Self {
            pid,
            parent,
            name: name_buf,
            state: ProcState::Runnable,
            xstate: 0,
            killed: false,
            cwd: None,
            open_files: std::array::from_fn(|_| None),
            address_space: None,
            blocked_on: None,
        }
    }

    /// Records (or clears, with `None`) which semaphore this process is
    /// about to block on, and drives its [`ProcState`] to match (spec.md
    /// §4.9's state-transition table: `RUNNING → SLEEPING` on a semaphore
    /// wait). Clearing the block (`None`) restores `Running`, since the
    /// caller is [`super::syscall::file::with_blocked_on`] resuming the
    /// same dispatch that was already running when it blocked — the
    /// `RUNNING → RUNNABLE` half of a wake is [`ProcessTable::mark_runnable`]
    /// once the whole syscall returns to [`super::syscall::dispatch`]. A
    /// no-op on a process that has already exited (state `Zombie`).
    pub fn set_blocked_on(&mut self, sem: Option<Arc<Semaphore>>) {
        if self.state != ProcState::Zombie {
            self.state = if sem.is_some() { ProcState::Sleeping } else { ProcState::Running };
        }
        self.blocked_on = sem;
    }
}

struct Inner {
    procs: Arena<Proc>,
    by_pid: std::collections::HashMap<Pid, usize>,
    next_pid: Pid,
    /// Pids freed by a reaped zombie (spec.md line 59/194: "PIDs are
    /// allocated from a monotonically increasing counter with a freelist of
    /// reusable ids"), grounded on `examples/original_source/src/kernel/
    /// proc.c`'s `pidpool` (`init_proc` pulls from it before bumping the
    /// counter; `destroy_proc` pushes the freed pid back). Popped
    /// LIFO-before-counter in [`ProcessTable::alloc`].
    free_pids: Vec<Pid>,
    alerted: HashSet<Pid>,
}

/// The system-wide process table.
pub struct ProcessTable {
    inner: Mutex<Inner>,
    cvar: Condvar,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                procs: Arena::with_capacity(NPROC),
                by_pid: std::collections::HashMap::new(),
                next_pid: 1,
                free_pids: Vec::new(),
                alerted: HashSet::new(),
            }),
            cvar: Condvar::new(),
        }
    }

    /// Allocates a new process slot with no address space yet (the caller
    /// — `exec`/`fork` — fills that in). Returns its pid.
    pub fn alloc(&self, parent: Option<Pid>, name: &[u8]) -> Result<Pid> {
        let mut inner = self.inner.lock().unwrap();
        let pid = match inner.free_pids.pop() {
            Some(pid) => pid,
            None => {
                let pid = inner.next_pid;
                inner.next_pid += 1;
                pid
            }
        };
        let idx = inner
            .procs
            .alloc(|| Proc::new(pid, parent, name))
            .ok_or(KernelError::OutOfResources)?;
        inner.by_pid.insert(pid, idx);
        Ok(pid)
    }

    pub fn with_proc<R>(&self, pid: Pid, f: impl FnOnce(&Proc) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        let idx = *inner.by_pid.get(&pid)?;
        Some(f(inner.procs.get(idx)))
    }

    pub fn with_proc_mut<R>(&self, pid: Pid, f: impl FnOnce(&mut Proc) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.by_pid.get(&pid)?;
        Some(f(inner.procs.get_mut(idx)))
    }

    /// `RUNNABLE → RUNNING` (spec.md §4.9's state-transition table), called
    /// by [`super::syscall::dispatch`] once it has claimed a CPU permit from
    /// [`scheduler::Scheduler`] for `pid`. A no-op on a process that has
    /// already exited.
    pub fn mark_running(&self, pid: Pid) {
        self.with_proc_mut(pid, |p| {
            if p.state != ProcState::Zombie {
                p.state = ProcState::Running;
            }
        });
    }

    /// `RUNNING → RUNNABLE` (spec.md §4.9: "yield / timer"), called once a
    /// dispatched syscall returns control and releases its CPU permit. A
    /// no-op on a process that has already exited, so `exit`'s `ZOMBIE`
    /// transition is never clobbered by the dispatch loop unwinding after it.
    pub fn mark_runnable(&self, pid: Pid) {
        self.with_proc_mut(pid, |p| {
            if p.state != ProcState::Zombie {
                p.state = ProcState::Runnable;
            }
        });
    }

    /// Testable property 5 (spec.md §8): "Runqueue contains exactly the set
    /// of processes whose state is RUNNABLE (plus possibly the currently
    /// RUNNING ones)". Returns every such pid.
    pub fn runqueue(&self) -> Vec<Pid> {
        let inner = self.inner.lock().unwrap();
        inner
            .procs
            .iter_occupied()
            .filter(|(_, p)| matches!(p.state, ProcState::Runnable | ProcState::Running))
            .map(|(_, p)| p.pid)
            .collect()
    }

    /// Marks `pid` as killed and interrupts it if it is currently blocked,
    /// either in its own [`Self::wait`] or on a subsystem semaphore
    /// (spec.md §4.8). Returns `Err(NotFound)` if no such process exists.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        let sem = {
            let mut inner = self.inner.lock().unwrap();
            let idx = *inner.by_pid.get(&pid).ok_or(KernelError::NotFound)?;
            let proc = inner.procs.get_mut(idx);
            proc.killed = true;
            let blocked_on = proc.blocked_on.clone();
            inner.alerted.insert(pid);
            blocked_on
        };
        self.cvar.notify_all();
        if let Some(sem) = sem {
            sem.alert_proc(pid);
        }
        Ok(())
    }

    /// Marks `pid` a zombie with `xstate`, reparenting its children to
    /// `init` (pid 1), and wakes anyone waiting for a child to exit.
    /// Mirrors `Procs::exit`/`Procs::reparent`.
    pub fn exit(&self, pid: Pid, xstate: i32) {
        let mut inner = self.inner.lock().unwrap();
        let child_indices: Vec<usize> = inner
            .procs
            .iter_occupied()
            .filter(|(_, p)| p.parent == Some(pid))
            .map(|(i, _)| i)
            .collect();
        for idx in child_indices {
            inner.procs.get_mut(idx).parent = Some(1);
        }
        if let Some(&idx) = inner.by_pid.get(&pid) {
            let proc = inner.procs.get_mut(idx);
            proc.state = ProcState::Zombie;
            proc.xstate = xstate;
        }
        drop(inner);
        self.cvar.notify_all();
    }

    /// Blocks `parent` until one of its children exits, then reaps it and
    /// returns `(child_pid, xstate)`. Returns `Err(NotFound)` if `parent`
    /// has no children at all, `Err(Interrupted)` if `parent` is killed
    /// while waiting.
    pub fn wait(&self, parent: Pid) -> Result<(Pid, i32)> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let has_children = inner.procs.iter_occupied().any(|(_, p)| p.parent == Some(parent));
            if !has_children {
                return Err(KernelError::NotFound);
            }
            let zombie = inner
                .procs
                .iter_occupied()
                .find(|(_, p)| p.parent == Some(parent) && p.state == ProcState::Zombie)
                .map(|(i, p)| (i, p.pid, p.xstate));
            if let Some((idx, pid, xstate)) = zombie {
                inner.by_pid.remove(&pid);
                inner.procs.decref(idx, |_| {});
                inner.free_pids.push(pid);
                return Ok((pid, xstate));
            }
            if inner.alerted.remove(&parent) {
                return Err(KernelError::Interrupted);
            }
            inner = self.cvar.wait(inner).unwrap();
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_then_wait_reaps_child() {
        let table = ProcessTable::new();
        let parent = table.alloc(None, b"init").unwrap();
        let child = table.alloc(Some(parent), b"child").unwrap();
        table.exit(child, 7);
        let (pid, xstate) = table.wait(parent).unwrap();
        assert_eq!(pid, child);
        assert_eq!(xstate, 7);
    }

    #[test]
    fn wait_with_no_children_returns_not_found() {
        let table = ProcessTable::new();
        let parent = table.alloc(None, b"lonely").unwrap();
        assert_eq!(table.wait(parent), Err(KernelError::NotFound));
    }

    #[test]
    fn exit_reparents_orphans_to_init() {
        let table = ProcessTable::new();
        let init = table.alloc(None, b"init").unwrap();
        assert_eq!(init, 1);
        let parent = table.alloc(None, b"mid").unwrap();
        let grandchild = table.alloc(Some(parent), b"gc").unwrap();
        table.exit(parent, 0);
        table.with_proc(grandchild, |p| assert_eq!(p.parent, Some(1)));
    }

    #[test]
    fn exited_pid_is_recycled_before_the_counter_advances() {
        let table = ProcessTable::new();
        let init = table.alloc(None, b"init").unwrap();
        let child = table.alloc(Some(init), b"child").unwrap();
        table.exit(child, 0);
        table.wait(init).unwrap();

        let reused = table.alloc(Some(init), b"new").unwrap();
        assert_eq!(reused, child);
    }

    #[test]
    fn runqueue_tracks_runnable_and_running_but_not_sleeping_or_zombie() {
        let table = ProcessTable::new();
        let a = table.alloc(None, b"a").unwrap();
        let b = table.alloc(None, b"b").unwrap();
        assert_eq!(table.runqueue(), vec![a, b]);

        table.mark_running(a);
        let rq = table.runqueue();
        assert!(rq.contains(&a) && rq.contains(&b));

        table.with_proc_mut(b, |p| p.set_blocked_on(Some(Arc::new(Semaphore::new(0)))));
        assert_eq!(table.runqueue(), vec![a]);

        table.with_proc_mut(b, |p| p.set_blocked_on(None));
        table.mark_runnable(b);
        assert_eq!(table.runqueue(), vec![a, b]);

        table.exit(a, 0);
        assert_eq!(table.runqueue(), vec![b]);
    }

    #[test]
    fn kill_marks_killed_and_alerts() {
        let table = ProcessTable::new();
        let pid = table.alloc(None, b"victim").unwrap();
        table.kill(pid).unwrap();
        table.with_proc(pid, |p| assert!(p.killed));
    }
}
