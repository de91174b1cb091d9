//! Syscall dispatch (spec.md §4.11, component C11): a fixed-size table
//! indexed by an id, pointer arguments validated by walking the calling
//! process's page table before any subsystem sees raw user memory.
//!
//! Grounded on `kernel-rs/src/syscall.rs`'s `KernelCtx::syscall` (a plain
//! numeric `match` over one id per syscall, each arm reading its own
//! register arguments via `sys_arg*`/`fetch*str`) and `sysfile.rs`/
//! `sysproc.rs` for the per-syscall argument shapes this table marshals.
//! The teacher reads arguments out of a live trap frame; this kernel has no
//! trap frame (spec.md §9's std-thread license — see `DESIGN.md`), so
//! [`dispatch`] takes already-extracted `x0..x5` values directly. Pointer
//! arguments still cross exactly the same boundary the teacher's
//! `user_readable`/`user_writeable`/`fetchstr` enforce: every one of them
//! goes through [`crate::mm::AddressSpace::copy_in`]/`copy_out`/
//! `copy_in_str` against the calling process's own page table, never a raw
//! dereference.

pub mod file;
pub mod proc;

use std::convert::TryInto;

use zerocopy::AsBytes;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::mm::AddressSpace;
use crate::param::{MAXARG, MAXPATH, NOFILE, PAGE};
use crate::proc::Pid;

const SYS_READ: i64 = 1;
const SYS_WRITE: i64 = 2;
const SYS_WRITEV: i64 = 3;
const SYS_CLOSE: i64 = 4;
const SYS_DUP: i64 = 5;
const SYS_FSTAT: i64 = 6;
const SYS_NEWFSTATAT: i64 = 7;
const SYS_OPENAT: i64 = 8;
const SYS_MKDIRAT: i64 = 9;
const SYS_MKNODAT: i64 = 10;
const SYS_UNLINKAT: i64 = 11;
const SYS_CHDIR: i64 = 12;
const SYS_PIPE2: i64 = 13;
const SYS_MMAP: i64 = 14;
const SYS_MUNMAP: i64 = 15;
const SYS_IOCTL: i64 = 16;
const SYS_FORK: i64 = 17;
const SYS_EXEC: i64 = 18;
const SYS_WAIT: i64 = 19;
const SYS_EXIT: i64 = 20;
const SYS_KILL: i64 = 21;

/// Looks up `pid`'s open-file slot `fd`, an index into the system-wide file
/// table stored as a raw `usize` (spec.md's `proc::Proc::open_files` doc
/// comment explains why it isn't a typed handle there). Shared by
/// [`file`] and [`proc`]'s fork/exit paths.
pub(crate) fn fd_handle(kernel: &Kernel, pid: Pid, fd: i32) -> Result<crate::file::FileHandle> {
    if fd < 0 || fd as usize >= NOFILE {
        return Err(KernelError::InvalidArgument);
    }
    let fd = fd as usize;
    kernel
        .procs
        .with_proc(pid, |p| p.open_files[fd])
        .flatten()
        .map(crate::file::FileHandle::from_raw)
        .ok_or(KernelError::InvalidArgument)
}

/// Installs `handle` into the first free descriptor slot of `pid`'s table.
pub(crate) fn alloc_fd(kernel: &Kernel, pid: Pid, handle: crate::file::FileHandle) -> Result<i32> {
    kernel
        .procs
        .with_proc_mut(pid, |p| {
            for (fd, slot) in p.open_files.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(handle.raw());
                    return Some(fd as i32);
                }
            }
            None
        })
        .flatten()
        .ok_or(KernelError::OutOfResources)
}

/// Returns a freshly `dup`'d reference to `pid`'s working directory. The
/// caller owns the returned reference and must eventually `put` it — the
/// process's own `cwd` slot is never decremented by reading it.
pub(crate) fn current_cwd(kernel: &Kernel, pid: Pid) -> Result<crate::fs::inode::Inode> {
    let idx = kernel.procs.with_proc(pid, |p| p.cwd).flatten().ok_or(KernelError::NotFound)?;
    Ok(kernel.fs.itable.dup(kernel.fs.itable.inode_at(idx)))
}

/// Runs `f` against `pid`'s address space. `Err(NotFound)` if `pid` doesn't
/// exist; `Err(InvalidArgument)` if it has none yet (between `alloc` and
/// `exec`/`fork` installing one).
pub(crate) fn with_space<R>(kernel: &Kernel, pid: Pid, f: impl FnOnce(&AddressSpace) -> Result<R>) -> Result<R> {
    kernel
        .procs
        .with_proc(pid, |p| {
            let space = p.address_space.as_ref().ok_or(KernelError::InvalidArgument)?;
            f(space)
        })
        .ok_or(KernelError::NotFound)?
}

pub(crate) fn with_space_mut<R>(kernel: &Kernel, pid: Pid, f: impl FnOnce(&mut AddressSpace) -> Result<R>) -> Result<R> {
    kernel
        .procs
        .with_proc_mut(pid, |p| {
            let space = p.address_space.as_mut().ok_or(KernelError::InvalidArgument)?;
            f(space)
        })
        .ok_or(KernelError::NotFound)?
}

/// Copies a NUL-terminated path out of user memory at `ptr`, capped at
/// [`MAXPATH`] (spec.md §3). Mirrors `fetchstr`.
fn read_path(kernel: &Kernel, pid: Pid, ptr: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAXPATH];
    let len = with_space(kernel, pid, |space| space.copy_in_str(&kernel.page_allocator, &mut buf, ptr))?;
    buf.truncate(len);
    Ok(buf)
}

/// Reads a NUL-pointer-terminated array of string pointers (an `argv` or
/// `envp`), each entry itself read via [`read_path`]. Mirrors the teacher's
/// `fetchaddr`-in-a-loop shape in `sys_exec`.
fn read_string_array(kernel: &Kernel, pid: Pid, ptr: usize) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for i in 0..MAXARG {
        let mut raw = [0u8; 8];
        with_space(kernel, pid, |space| space.copy_in(&kernel.page_allocator, &mut raw, ptr + i * 8))?;
        let str_ptr = u64::from_le_bytes(raw) as usize;
        if str_ptr == 0 {
            return Ok(out);
        }
        out.push(read_path(kernel, pid, str_ptr)?);
    }
    Err(KernelError::InvalidArgument)
}

/// Entry point from the trap handler: `num` is `x8`, `args` is `x0..x5`.
/// Returns the value to load into `x0` — negative on error (spec.md §6's
/// "Negative return values are error indicators"). An id with no arm is a
/// corruption, not a user-origin error (spec.md §4.11: "Unknown id
/// panics"), so it goes through [`crate::kernel_panic`] rather than
/// returning `-1`.
///
/// Claims a CPU permit from [`crate::proc::scheduler::Scheduler`] before
/// running the syscall and releases it on the way out, driving `pid`
/// through `RUNNABLE → RUNNING → RUNNABLE` (spec.md §4.9's state-transition
/// table) around the call. `acquire_cpu` is itself interruptible by `kill`
/// (spec.md §4.8), so a process killed while merely waiting for a CPU never
/// reaches `run` at all.
pub fn dispatch(kernel: &Kernel, pid: Pid, num: i64, args: [i64; 6]) -> i64 {
    if let Err(e) = kernel.scheduler.acquire_cpu(pid) {
        return e.to_errno();
    }
    kernel.procs.mark_running(pid);
    let result = run(kernel, pid, num, args);
    kernel.procs.mark_runnable(pid);
    kernel.scheduler.release_cpu();
    match result {
        Ok(v) => v,
        Err(e) => e.to_errno(),
    }
}

fn run(kernel: &Kernel, pid: Pid, num: i64, args: [i64; 6]) -> Result<i64> {
    match num {
        SYS_READ => {
            let (fd, ptr, len) = (args[0] as i32, args[1] as usize, args[2] as usize);
            let mut buf = vec![0u8; len];
            let n = file::read(kernel, pid, fd, &mut buf)?;
            with_space_mut(kernel, pid, |space| space.copy_out(&kernel.page_allocator, ptr, &buf[..n]))?;
            Ok(n as i64)
        }
        SYS_WRITE => {
            let (fd, ptr, len) = (args[0] as i32, args[1] as usize, args[2] as usize);
            let mut buf = vec![0u8; len];
            with_space(kernel, pid, |space| space.copy_in(&kernel.page_allocator, &mut buf, ptr))?;
            Ok(file::write(kernel, pid, fd, &buf)? as i64)
        }
        SYS_WRITEV => {
            let (fd, iov_ptr, iovcnt) = (args[0] as i32, args[1] as usize, args[2] as usize);
            let mut total = 0usize;
            for i in 0..iovcnt {
                let mut entry = [0u8; 16];
                with_space(kernel, pid, |space| space.copy_in(&kernel.page_allocator, &mut entry, iov_ptr + i * 16))?;
                let base = u64::from_le_bytes(entry[0..8].try_into().unwrap()) as usize;
                let len = u64::from_le_bytes(entry[8..16].try_into().unwrap()) as usize;
                if len == 0 {
                    continue;
                }
                let mut buf = vec![0u8; len];
                with_space(kernel, pid, |space| space.copy_in(&kernel.page_allocator, &mut buf, base))?;
                let n = file::write(kernel, pid, fd, &buf)?;
                total += n;
                if n < len {
                    break;
                }
            }
            Ok(total as i64)
        }
        SYS_CLOSE => {
            file::close(kernel, pid, args[0] as i32)?;
            Ok(0)
        }
        SYS_DUP => Ok(file::dup(kernel, pid, args[0] as i32)? as i64),
        SYS_FSTAT => {
            let stat = file::fstat(kernel, pid, args[0] as i32)?;
            with_space_mut(kernel, pid, |space| space.copy_out(&kernel.page_allocator, args[1] as usize, stat.as_bytes()))?;
            Ok(0)
        }
        SYS_NEWFSTATAT => {
            let path = read_path(kernel, pid, args[1] as usize)?;
            let stat = file::newfstatat(kernel, pid, args[0] as i32, &path)?;
            with_space_mut(kernel, pid, |space| space.copy_out(&kernel.page_allocator, args[2] as usize, stat.as_bytes()))?;
            Ok(0)
        }
        SYS_OPENAT => {
            let path = read_path(kernel, pid, args[1] as usize)?;
            Ok(file::openat(kernel, pid, args[0] as i32, &path, args[2] as i32)? as i64)
        }
        SYS_MKDIRAT => {
            let path = read_path(kernel, pid, args[1] as usize)?;
            file::mkdirat(kernel, pid, args[0] as i32, &path)?;
            Ok(0)
        }
        SYS_MKNODAT => {
            let path = read_path(kernel, pid, args[1] as usize)?;
            file::mknodat(kernel, pid, args[0] as i32, &path, args[2] as u16, args[3] as u16)?;
            Ok(0)
        }
        SYS_UNLINKAT => {
            let path = read_path(kernel, pid, args[1] as usize)?;
            file::unlinkat(kernel, pid, args[0] as i32, &path)?;
            Ok(0)
        }
        SYS_CHDIR => {
            let path = read_path(kernel, pid, args[0] as usize)?;
            file::chdir(kernel, pid, &path)?;
            Ok(0)
        }
        SYS_PIPE2 => {
            let (rfd, wfd) = file::pipe2(kernel, pid)?;
            let mut buf = [0u8; 8];
            buf[0..4].copy_from_slice(&rfd.to_le_bytes());
            buf[4..8].copy_from_slice(&wfd.to_le_bytes());
            with_space_mut(kernel, pid, |space| space.copy_out(&kernel.page_allocator, args[0] as usize, &buf))?;
            Ok(0)
        }
        SYS_MMAP => {
            let addr = file::mmap(
                kernel,
                pid,
                args[0] as usize,
                args[1] as usize,
                args[2] as i32,
                args[3] as i32,
                args[4] as i32,
                args[5] as u64,
            )?;
            Ok(addr as i64)
        }
        SYS_MUNMAP => {
            file::munmap(kernel, pid, args[0] as usize, args[1] as usize)?;
            Ok(0)
        }
        SYS_IOCTL => Ok(file::ioctl(kernel, pid, args[0] as i32, args[1] as u64)? as i64),
        SYS_FORK => Ok(proc::fork(kernel, pid)? as i64),
        SYS_EXEC => {
            let path = read_path(kernel, pid, args[0] as usize)?;
            let argv_bytes = read_string_array(kernel, pid, args[1] as usize)?;
            let envp_bytes = read_string_array(kernel, pid, args[2] as usize)?;
            let argv: Vec<&[u8]> = argv_bytes.iter().map(Vec::as_slice).collect();
            let envp: Vec<&[u8]> = envp_bytes.iter().map(Vec::as_slice).collect();
            let outcome = proc::exec(kernel, pid, &path, &argv, &envp)?;
            Ok(outcome.entry as i64)
        }
        SYS_WAIT => {
            let (child, xstate) = proc::wait(kernel, pid)?;
            let status_ptr = args[0] as usize;
            if status_ptr != 0 {
                with_space_mut(kernel, pid, |space| space.copy_out(&kernel.page_allocator, status_ptr, &xstate.to_le_bytes()))?;
            }
            Ok(child as i64)
        }
        SYS_EXIT => {
            proc::exit(kernel, pid, args[0] as i32);
            Ok(0)
        }
        SYS_KILL => {
            proc::kill(kernel, args[0] as Pid)?;
            Ok(0)
        }
        _ => crate::kernel_panic!("unknown syscall id {num}"),
    }
}
