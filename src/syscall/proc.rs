//! Process-lifecycle syscalls (spec.md §4.11): `fork`, `exec`, `wait`,
//! `exit`, `kill`.
//!
//! Grounded on `kernel-rs/src/sysproc.rs`: `fork` COW-duplicates the
//! address space then copies the fd table and cwd reference with fresh
//! refcounts, `exit` releases every resource a process holds before
//! handing off to the process table's reparenting/zombie logic
//! (`kernel-rs/src/proc/procs.rs`'s `Procs::exit`).

use std::array;

use crate::error::{KernelError, Result};
use crate::file::FileHandle;
use crate::kernel::Kernel;
use crate::param::NOFILE;
use crate::proc::Pid;

use super::{current_cwd, with_space_mut};

pub fn fork(kernel: &Kernel, pid: Pid) -> Result<Pid> {
    let space = with_space_mut(kernel, pid, |space| space.fork(&kernel.page_allocator).ok_or(KernelError::OutOfResources))?;

    let (name, open_files, cwd) = kernel
        .procs
        .with_proc(pid, |p| (p.name, p.open_files, p.cwd))
        .ok_or(KernelError::NotFound)?;

    let child_pid = match kernel.procs.alloc(Some(pid), &name) {
        Ok(child_pid) => child_pid,
        Err(e) => {
            space.destroy(&kernel.page_allocator);
            return Err(e);
        }
    };

    let mut dupped_files: [Option<usize>; NOFILE] = array::from_fn(|_| None);
    for (i, slot) in open_files.iter().enumerate() {
        if let Some(idx) = slot {
            let dupped = kernel.files.dup(FileHandle::from_raw(*idx));
            dupped_files[i] = Some(dupped.raw());
        }
    }
    let dupped_cwd = cwd.map(|idx| kernel.fs.itable.dup(kernel.fs.itable.inode_at(idx)).raw());

    kernel.procs.with_proc_mut(child_pid, |p| {
        p.address_space = Some(space);
        p.open_files = dupped_files;
        p.cwd = dupped_cwd;
    });

    Ok(child_pid)
}

/// What `exec` hands back once the new image is installed. Spec.md §9
/// licenses modeling CPUs as `std::thread`s rather than real trap frames
/// (see `DESIGN.md`'s Open Question 6), so there's no register file to
/// write `entry`/`sp`/`argc` into — the dispatch layer returns `entry` as
/// the syscall's result and a real caller-side thread harness would seed
/// its simulated registers from the rest.
pub struct ExecOutcome {
    pub entry: usize,
    pub sp: usize,
    pub argc: usize,
}

pub fn exec(kernel: &Kernel, pid: Pid, path: &[u8], argv: &[&[u8]], envp: &[&[u8]]) -> Result<ExecOutcome> {
    let cwd = current_cwd(kernel, pid)?;
    let image = crate::exec::exec(&kernel.fs, &kernel.page_allocator, &cwd, path, argv, envp);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, cwd);
    let image = image?;

    let outcome = ExecOutcome {
        entry: image.entry,
        sp: image.sp,
        argc: image.argc,
    };

    let old = kernel
        .procs
        .with_proc_mut(pid, |p| p.address_space.replace(image.address_space))
        .ok_or(KernelError::NotFound)?;
    if let Some(old) = old {
        old.destroy(&kernel.page_allocator);
    }
    Ok(outcome)
}

pub fn wait(kernel: &Kernel, pid: Pid) -> Result<(Pid, i32)> {
    kernel.procs.wait(pid)
}

/// Tears down every resource `pid` holds before handing off to
/// [`crate::proc::ProcessTable::exit`]'s reparenting/zombie bookkeeping.
/// The calling syscall dispatch only ever reaches this with a `pid` that
/// owns the in-flight trap, so an unknown `pid` here is a kernel bug, not a
/// user-triggerable condition — matches how `kernel-rs/src/sysproc.rs`'s
/// `sys_exit` treats `myproc()` as infallible.
pub fn exit(kernel: &Kernel, pid: Pid, status: i32) {
    let (open_files, cwd, address_space) = kernel
        .procs
        .with_proc_mut(pid, |p| (std::mem::replace(&mut p.open_files, [None; NOFILE]), p.cwd.take(), p.address_space.take()))
        .expect("exit called on an unknown pid");

    for slot in open_files.into_iter().flatten() {
        kernel.files.close(&kernel.fs, FileHandle::from_raw(slot));
    }
    if let Some(idx) = cwd {
        kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, kernel.fs.itable.inode_at(idx));
    }
    if let Some(space) = address_space {
        space.destroy(&kernel.page_allocator);
    }

    kernel.procs.exit(pid, status);
}

pub fn kill(kernel: &Kernel, pid: Pid) -> Result<()> {
    kernel.procs.kill(pid)
}
