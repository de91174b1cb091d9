//! File-and-memory-related syscalls (spec.md §4.11): `read`, `write`,
//! `writev`, `close`, `dup`, `fstat`, `newfstatat`, `openat`, `mkdirat`,
//! `mknodat`, `unlinkat`, `chdir`, `pipe2`, `mmap`, `munmap`, `ioctl`.
//!
//! Grounded on `kernel-rs/src/sysfile.rs`: same split between a thin
//! fd-resolving wrapper and a `create`-style inner helper for the
//! `O_CREAT`/`mkdir`/`mknod` family, same `begin_op`/`end_op` bracketing
//! around every directory mutation. The teacher's ABI is a flat
//! `open`/`mkdir`/`mknod`/`unlink`, not the `*at` family; this crate only
//! implements the `AT_FDCWD` case of each `*at` call (spec.md's component
//! list never asks for per-fd relative directories), so `dirfd` is
//! validated and otherwise ignored.

use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::file::FileHandle;
use crate::fs::dir;
use crate::fs::inode::{DInodeType, Inode, InodeFile};
use crate::fs::path;
use crate::fs::FileSystem;
use crate::kernel::Kernel;
use crate::mm::{AddressSpace, PageSource, PteFlags};
use crate::param::PAGE;
use crate::pipe::Pipe;
use crate::proc::Pid;
use crate::stat::Stat;

use super::{alloc_fd, current_cwd, fd_handle, with_space, with_space_mut};

pub const AT_FDCWD: i32 = -100;

pub const O_RDONLY: i32 = 0;
pub const O_WRONLY: i32 = 1;
pub const O_RDWR: i32 = 2;
pub const O_CREAT: i32 = 0o100;

pub const PROT_READ: i32 = 1;
pub const PROT_WRITE: i32 = 2;
pub const PROT_EXEC: i32 = 4;

pub const MAP_SHARED: i32 = 1;
pub const MAP_PRIVATE: i32 = 2;
pub const MAP_ANONYMOUS: i32 = 0x20;

/// Where the next unhinted `mmap` looks for room: past every section a
/// freshly-`exec`'d image could plausibly occupy.
const MMAP_BASE: usize = 0x0010_0000;

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

fn require_at_fdcwd(dirfd: i32) -> Result<()> {
    if dirfd != AT_FDCWD {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

/// Registers `sem` (the semaphore a pipe-backed `read`/`write` is about to
/// block on, if any) in the caller's `blocked_on` slot for the duration of
/// `f`, so a concurrent `kill(2)` can find and interrupt it (spec.md §4.8).
/// Cleared again once `f` returns, blocking or not.
fn with_blocked_on<R>(kernel: &Kernel, pid: Pid, sem: Option<Arc<crate::proc::semaphore::Semaphore>>, f: impl FnOnce() -> R) -> R {
    if sem.is_some() {
        kernel.procs.with_proc_mut(pid, |p| p.set_blocked_on(sem));
    }
    let result = f();
    kernel.procs.with_proc_mut(pid, |p| p.set_blocked_on(None));
    result
}

pub fn read(kernel: &Kernel, pid: Pid, fd: i32, dst: &mut [u8]) -> Result<usize> {
    let handle = fd_handle(kernel, pid, fd)?;
    let sem = kernel.files.pipe_of(handle).map(|p| p.read_ready());
    with_blocked_on(kernel, pid, sem, || kernel.files.read(&kernel.fs, &kernel.devices, handle, pid, dst))
}

pub fn write(kernel: &Kernel, pid: Pid, fd: i32, src: &[u8]) -> Result<usize> {
    let handle = fd_handle(kernel, pid, fd)?;
    let sem = kernel.files.pipe_of(handle).map(|p| p.write_ready());
    with_blocked_on(kernel, pid, sem, || kernel.files.write(&kernel.fs, &kernel.devices, handle, pid, src))
}

pub fn close(kernel: &Kernel, pid: Pid, fd: i32) -> Result<()> {
    let handle = fd_handle(kernel, pid, fd)?;
    kernel.procs.with_proc_mut(pid, |p| p.open_files[fd as usize] = None);
    kernel.files.close(&kernel.fs, handle);
    Ok(())
}

pub fn dup(kernel: &Kernel, pid: Pid, fd: i32) -> Result<i32> {
    let handle = fd_handle(kernel, pid, fd)?;
    let dupped = kernel.files.dup(handle);
    match alloc_fd(kernel, pid, dupped) {
        Ok(newfd) => Ok(newfd),
        Err(e) => {
            kernel.files.close(&kernel.fs, dupped);
            Err(e)
        }
    }
}

pub fn fstat(kernel: &Kernel, pid: Pid, fd: i32) -> Result<Stat> {
    let handle = fd_handle(kernel, pid, fd)?;
    kernel.files.stat(&kernel.fs, handle)
}

/// `AT_FDCWD`-relative `fstatat`: resolves `path` against the calling
/// process's working directory and stats it directly, without opening a
/// file descriptor.
pub fn newfstatat(kernel: &Kernel, pid: Pid, dirfd: i32, path_bytes: &[u8]) -> Result<Stat> {
    require_at_fdcwd(dirfd)?;
    let cwd = current_cwd(kernel, pid)?;
    let result = kernel.fs.resolve(&cwd, path_bytes);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, cwd);
    let inode = result?;
    let guard = kernel.fs.itable.lock(&kernel.fs.bcache, inode);
    let stat = Stat::new(inode.inum, guard.kind, guard.nlink, guard.size);
    drop(guard);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, inode);
    Ok(stat)
}

fn create_file(fs: &FileSystem, cwd: &Inode, path_bytes: &[u8]) -> Result<Inode> {
    let (parent, name) = path::nameiparent(fs, cwd, path_bytes)?;
    let new_inode = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::File);
    {
        let mut guard = fs.itable.lock(&fs.bcache, new_inode);
        guard.nlink = 1;
        fs.itable.update(&fs.bcache, &fs.log, new_inode, &guard);
    }
    let result = dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, parent, name, new_inode.inum);
    fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, parent);
    if let Err(e) = result {
        fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, new_inode);
        return Err(e);
    }
    Ok(new_inode)
}

/// `openat(AT_FDCWD, path, flags)`. With `O_CREAT`, a concurrent creator
/// winning the race is not an error — this falls back to a plain resolve,
/// matching the teacher's `sys_open`'s `create` returning `AlreadyExists`
/// is actually impossible for it (it holds the parent's ilock across the
/// lookup-then-insert), but this crate's `dir::insert` checks for the
/// duplicate without holding the parent locked across it, so the race is
/// real here and is handled rather than ignored.
pub fn openat(kernel: &Kernel, pid: Pid, dirfd: i32, path_bytes: &[u8], flags: i32) -> Result<i32> {
    require_at_fdcwd(dirfd)?;
    let cwd = current_cwd(kernel, pid)?;
    let result = open_inner(kernel, pid, &cwd, path_bytes, flags);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, cwd);
    result
}

fn open_inner(kernel: &Kernel, pid: Pid, cwd: &Inode, path_bytes: &[u8], flags: i32) -> Result<i32> {
    let fs = &kernel.fs;
    let inode = if flags & O_CREAT != 0 {
        fs.log.begin_op(pid)?;
        let result = create_file(fs, cwd, path_bytes);
        fs.log.end_op(pid);
        match result {
            Ok(inode) => inode,
            Err(KernelError::AlreadyExists) => fs.resolve(cwd, path_bytes)?,
            Err(e) => return Err(e),
        }
    } else {
        fs.resolve(cwd, path_bytes)?
    };

    let (kind, major, minor) = {
        let guard = fs.itable.lock(&fs.bcache, inode);
        (guard.kind, guard.major, guard.minor)
    };

    let writable = flags & (O_WRONLY | O_RDWR) != 0;
    if kind == DInodeType::Dir && writable {
        fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, inode);
        return Err(KernelError::IsADirectory);
    }
    let readable = flags & O_WRONLY == 0;

    let handle = if kind == DInodeType::Device {
        fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, inode);
        kernel.files.open_device(major, readable, writable)?
    } else {
        kernel.files.open_inode(inode, readable, writable)?
    };

    match alloc_fd(kernel, pid, handle) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            kernel.files.close(fs, handle);
            Err(e)
        }
    }
}

fn mkdirat_inner(fs: &FileSystem, pid: Pid, cwd: &Inode, path_bytes: &[u8]) -> Result<()> {
    fs.log.begin_op(pid)?;
    let result = (|| -> Result<()> {
        let (parent, name) = path::nameiparent(fs, cwd, path_bytes)?;
        let parent = scopeguard::guard(parent, |p| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, p));
        let new_dir = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::Dir);
        let new_dir = scopeguard::guard(new_dir, |d| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, d));
        {
            let mut guard = fs.itable.lock(&fs.bcache, *new_dir);
            guard.nlink = 1;
            fs.itable.update(&fs.bcache, &fs.log, *new_dir, &guard);
        }
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, *parent, name, new_dir.inum)?;
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, *new_dir, b".", new_dir.inum)?;
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, *new_dir, b"..", parent.inum)?;
        Ok(())
    })();
    fs.log.end_op(pid);
    result
}

pub fn mkdirat(kernel: &Kernel, pid: Pid, dirfd: i32, path_bytes: &[u8]) -> Result<()> {
    require_at_fdcwd(dirfd)?;
    let cwd = current_cwd(kernel, pid)?;
    let result = mkdirat_inner(&kernel.fs, pid, &cwd, path_bytes);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, cwd);
    result
}

fn mknodat_inner(fs: &FileSystem, pid: Pid, cwd: &Inode, path_bytes: &[u8], major: u16, minor: u16) -> Result<()> {
    fs.log.begin_op(pid)?;
    let result = (|| -> Result<()> {
        let (parent, name) = path::nameiparent(fs, cwd, path_bytes)?;
        let parent = scopeguard::guard(parent, |p| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, p));
        let new_inode = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::Device);
        let new_inode = scopeguard::guard(new_inode, |i| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, i));
        {
            let mut guard = fs.itable.lock(&fs.bcache, *new_inode);
            guard.nlink = 1;
            guard.major = major;
            guard.minor = minor;
            fs.itable.update(&fs.bcache, &fs.log, *new_inode, &guard);
        }
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, *parent, name, new_inode.inum)
    })();
    fs.log.end_op(pid);
    result
}

pub fn mknodat(kernel: &Kernel, pid: Pid, dirfd: i32, path_bytes: &[u8], major: u16, minor: u16) -> Result<()> {
    require_at_fdcwd(dirfd)?;
    let cwd = current_cwd(kernel, pid)?;
    let result = mknodat_inner(&kernel.fs, pid, &cwd, path_bytes, major, minor);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, cwd);
    result
}

/// Directories created by `mkdirat` carry `nlink = 1`, not the traditional
/// Unix "2 plus one per subdirectory" count — `.`/`..` here exist only for
/// path traversal (`fs::dir::is_empty` already special-cases them), not for
/// link accounting, and spec.md doesn't ask for the latter. Recorded as a
/// deliberate simplification in `DESIGN.md`.
fn unlinkat_inner(fs: &FileSystem, pid: Pid, cwd: &Inode, path_bytes: &[u8]) -> Result<()> {
    fs.log.begin_op(pid)?;
    let result = (|| -> Result<()> {
        let (parent, name) = path::nameiparent(fs, cwd, path_bytes)?;
        let parent = scopeguard::guard(parent, |p| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, p));
        if name == b".".as_slice() || name == b"..".as_slice() {
            return Err(KernelError::InvalidArgument);
        }
        let (inum, off) = dir::lookup(&fs.bcache, &fs.itable, *parent, name).ok_or(KernelError::NotFound)?;
        let target = fs.itable.get(&fs.bcache, inum);
        let target = scopeguard::guard(target, |t| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, t));

        if !dir::is_empty(&fs.bcache, &fs.itable, *target) {
            return Err(KernelError::PermissionDenied);
        }

        dir::remove(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, *parent, off)?;
        let mut guard = fs.itable.lock(&fs.bcache, *target);
        guard.nlink = guard.nlink.saturating_sub(1);
        fs.itable.update(&fs.bcache, &fs.log, *target, &guard);
        Ok(())
    })();
    fs.log.end_op(pid);
    result
}

pub fn unlinkat(kernel: &Kernel, pid: Pid, dirfd: i32, path_bytes: &[u8]) -> Result<()> {
    require_at_fdcwd(dirfd)?;
    let cwd = current_cwd(kernel, pid)?;
    let result = unlinkat_inner(&kernel.fs, pid, &cwd, path_bytes);
    kernel.fs.itable.put(&kernel.fs.bcache, &kernel.fs.log, &kernel.fs.bitmap, cwd);
    result
}

pub fn chdir(kernel: &Kernel, pid: Pid, path_bytes: &[u8]) -> Result<()> {
    let fs = &kernel.fs;
    let cwd = current_cwd(kernel, pid)?;
    let resolved = fs.resolve(&cwd, path_bytes);
    fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, cwd);
    let new_inode = resolved?;

    let is_dir = fs.itable.lock(&fs.bcache, new_inode).kind == DInodeType::Dir;
    if !is_dir {
        fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, new_inode);
        return Err(KernelError::NotADirectory);
    }

    let old = kernel.procs.with_proc_mut(pid, |p| p.cwd.replace(new_inode.raw())).ok_or(KernelError::NotFound)?;
    if let Some(idx) = old {
        fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, fs.itable.inode_at(idx));
    }
    Ok(())
}

pub fn pipe2(kernel: &Kernel, pid: Pid) -> Result<(i32, i32)> {
    let pipe = Arc::new(Pipe::new());
    let reader = kernel.files.open_pipe(pipe.clone(), true, false)?;
    let writer = match kernel.files.open_pipe(pipe, false, true) {
        Ok(w) => w,
        Err(e) => {
            kernel.files.close(&kernel.fs, reader);
            return Err(e);
        }
    };

    let rfd = match alloc_fd(kernel, pid, reader) {
        Ok(fd) => fd,
        Err(e) => {
            kernel.files.close(&kernel.fs, reader);
            kernel.files.close(&kernel.fs, writer);
            return Err(e);
        }
    };
    let wfd = match alloc_fd(kernel, pid, writer) {
        Ok(fd) => fd,
        Err(e) => {
            close(kernel, pid, rfd).ok();
            kernel.files.close(&kernel.fs, writer);
            return Err(e);
        }
    };
    Ok((rfd, wfd))
}

fn pick_mmap_address(space: &AddressSpace) -> usize {
    space.sections().iter().map(|s| s.end).filter(|&e| e >= MMAP_BASE).max().unwrap_or(MMAP_BASE)
}

/// `mmap`: file-backed mappings only (spec.md §6 doesn't ask for anonymous
/// memory beyond what `sbrk`-equivalents would use, and this crate has no
/// `sbrk`), no `PROT_EXEC` (nothing here runs mapped code — `exec` builds
/// its own executable sections directly).
pub fn mmap(kernel: &Kernel, pid: Pid, addr: usize, length: usize, prot: i32, flags: i32, fd: i32, offset: u64) -> Result<usize> {
    if length == 0 || prot & PROT_EXEC != 0 || flags & MAP_ANONYMOUS != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let shared = flags & MAP_SHARED != 0;
    if !shared && flags & MAP_PRIVATE == 0 {
        return Err(KernelError::InvalidArgument);
    }

    let handle = fd_handle(kernel, pid, fd)?;
    if shared && prot & PROT_WRITE != 0 && !kernel.files.is_writable(handle) {
        return Err(KernelError::PermissionDenied);
    }

    let inode = kernel.files.inode_of(handle)?;
    let source: Arc<dyn PageSource> = {
        let data = kernel.fs.itable.lock(&kernel.fs.bcache, inode);
        Arc::new(InodeFile::snapshot(kernel.fs.bcache.clone(), kernel.fs.log.clone(), &data))
    };

    let mut pte_prot = PteFlags::empty();
    if prot & PROT_READ != 0 {
        pte_prot |= PteFlags::READ;
    }
    if prot & PROT_WRITE != 0 {
        pte_prot |= PteFlags::WRITE;
    }

    let len = round_up(length, PAGE);
    with_space_mut(kernel, pid, |space| {
        let start = if addr != 0 { addr } else { pick_mmap_address(space) };
        space.map_file(start, len, pte_prot, source, offset, shared)?;
        Ok(start)
    })
}

/// `munmap`: writes back `MAP_SHARED` dirty pages before unmapping, inside
/// its own `begin_op`/`end_op` bracket since `InodeFile::writeback` touches
/// the log (spec.md §6).
pub fn munmap(kernel: &Kernel, pid: Pid, addr: usize, length: usize) -> Result<()> {
    if length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let start = addr & !(PAGE - 1);
    let len = round_up(addr - start + length, PAGE);

    kernel.fs.log.begin_op(pid)?;
    let writeback = with_space(kernel, pid, |space| space.writeback_shared(&kernel.page_allocator, start, len));
    kernel.fs.log.end_op(pid);
    writeback?;

    with_space_mut(kernel, pid, |space| space.unmap(&kernel.page_allocator, start, len))
}

/// Stubbed per spec.md §4.11 ("ioctl (stub)"): only the `TCGETS`-style
/// no-op request used by line-discipline-probing shells is recognized.
pub fn ioctl(kernel: &Kernel, pid: Pid, fd: i32, request: u64) -> Result<i32> {
    fd_handle(kernel, pid, fd)?;
    match request {
        0x5413 => Ok(0),
        _ => Err(KernelError::InvalidArgument),
    }
}
