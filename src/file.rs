//! Open-file table and the `File` abstraction unifying inodes, pipes, and
//! device streams (spec.md §3, §4.7, component C7 part 1).
//!
//! Grounded on `kernel-rs/src/file.rs`'s `File`/`FileType`/`RcFile`: a
//! refcounted handle into a system-wide table, dispatching `read`/`write` by
//! variant (`Pipe`, `Inode`, `Device`). That file keeps `off` in an
//! `UnsafeCell` behind the inode's own lock; this crate gives each open file
//! its own `Mutex<u32>` offset instead, since a `File` here isn't always
//! paired with an inode lock held for the whole call. `FileTable` reuses the
//! same "spinlock-guarded [`crate::util::Arena`], `Copy` handle, explicit
//! `close`" shape as [`crate::fs::bcache::BufferCache`] and
//! [`crate::fs::inode::InodeTable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{KernelError, Result};
use crate::fs::inode::{DInodeType, Inode};
use crate::fs::FileSystem;
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, NFILE, OP_MAX_BLOCKS};
use crate::pipe::Pipe;
use crate::proc::Pid;
use crate::stat::Stat;
use crate::util::Arena;

/// A character device reachable through the file table by major number.
/// [`crate::console::Console`] is the only implementor in this kernel, but
/// the indirection mirrors the teacher's `Devsw` dispatch table
/// (`kernel-rs/src/file.rs`'s `Devsw`) so a second device type doesn't need
/// to touch `File`'s dispatch logic.
pub trait CharDevice: Send + Sync {
    fn read(&self, pid: Pid, dst: &mut [u8]) -> Result<usize>;
    fn write(&self, pid: Pid, src: &[u8]) -> Result<usize>;
}

/// The `major -> device` registry backing `FileKind::Device`. Mirrors
/// `Devsw`'s role without the teacher's fixed-size array, since this crate
/// has exactly one device (the console) today and no `mknod`-created device
/// numbers to size a table for ahead of time.
#[derive(Default)]
pub struct Devices {
    table: Mutex<HashMap<u16, Arc<dyn CharDevice>>>,
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, major: u16, device: Arc<dyn CharDevice>) {
        self.table.lock().unwrap().insert(major, device);
    }

    fn get(&self, major: u16) -> Result<Arc<dyn CharDevice>> {
        self.table.lock().unwrap().get(&major).cloned().ok_or(KernelError::NotFound)
    }
}

enum FileKind {
    Inode { inode: Inode, off: Mutex<u32> },
    Device { major: u16 },
    Pipe(Arc<Pipe>),
}

/// One open-file-table entry (spec.md §3: "File (open-file)"). `readable`/
/// `writable` gate `read`/`write` independent of what the underlying object
/// itself allows, matching `open(2)`'s access-mode check.
struct File {
    kind: FileKind,
    readable: bool,
    writable: bool,
}

/// A cheap, `Copy` handle into the system-wide file table. The same role
/// [`crate::fs::bcache::BufHandle`] and [`crate::fs::inode::Inode`] play for
/// their own arenas: obtained from [`FileTable::open_inode`]/
/// [`FileTable::open_pipe`]/[`FileTable::open_device`]/[`FileTable::dup`],
/// every copy must eventually reach [`FileTable::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle {
    idx: usize,
}

impl FileHandle {
    /// Exposes the raw slot index so [`crate::proc::Proc::open_files`] — an
    /// opaque `usize` table, per that module's doc comment — can store a
    /// file descriptor without `proc` depending on `file`.
    pub fn raw(self) -> usize {
        self.idx
    }

    /// Rebuilds a handle from a raw slot index previously obtained from
    /// [`Self::raw`]. The caller (the syscall layer) is the one place that
    /// knows a `usize` taken out of `open_files` is really a `FileHandle`.
    pub fn from_raw(idx: usize) -> Self {
        Self { idx }
    }
}

pub struct FileTable {
    arena: Spinlock<Arena<File>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            arena: Spinlock::new_at("ftable", LockLevel::Other, Arena::with_capacity(NFILE)),
        }
    }

    fn alloc(&self, kind: FileKind, readable: bool, writable: bool) -> Result<FileHandle> {
        let mut arena = self.arena.lock();
        let idx = arena.alloc(|| File { kind, readable, writable }).ok_or(KernelError::OutOfResources)?;
        Ok(FileHandle { idx })
    }

    pub fn open_inode(&self, inode: Inode, readable: bool, writable: bool) -> Result<FileHandle> {
        self.alloc(FileKind::Inode { inode, off: Mutex::new(0) }, readable, writable)
    }

    pub fn open_device(&self, major: u16, readable: bool, writable: bool) -> Result<FileHandle> {
        self.alloc(FileKind::Device { major }, readable, writable)
    }

    pub fn open_pipe(&self, pipe: Arc<Pipe>, readable: bool, writable: bool) -> Result<FileHandle> {
        self.alloc(FileKind::Pipe(pipe), readable, writable)
    }

    /// Increments the handle's reference count (`dup(2)`, `fork`'s shared fd
    /// table).
    pub fn dup(&self, handle: FileHandle) -> FileHandle {
        self.arena.lock().incref(handle.idx);
        handle
    }

    /// SAFETY: matches the invariant documented on `util::Arena::with_capacity`
    /// and already relied on by `fs::bcache`/`fs::inode`: the backing storage
    /// never reallocates, so a slot's address stays valid for as long as the
    /// handle's reference is held — i.e. as long as no concurrent call
    /// drives this same handle's refcount to zero.
    fn slot(&self, handle: FileHandle) -> &File {
        let arena = self.arena.lock();
        unsafe { &*(arena.get(handle.idx) as *const File) }
    }

    /// Releases one reference. On the last one, releases the inode (inside
    /// an operation) or closes the pipe end (spec.md §4.7: "closing
    /// decrements and on last close releases the inode ... or closes the
    /// pipe end"). Mirrors `fs::inode::InodeTable::put`'s two-phase
    /// decref/teardown split: the arena lock is `LockLevel::Other`, so
    /// nothing that touches the log or bitmap may run while it's held.
    pub fn close(&self, fs: &FileSystem, handle: FileHandle) {
        enum Teardown {
            None,
            Pipe(Arc<Pipe>, bool),
            Inode(Inode),
        }
        let mut teardown = Teardown::None;
        {
            let mut arena = self.arena.lock();
            arena.decref(handle.idx, |file| {
                teardown = match &file.kind {
                    FileKind::Pipe(pipe) => Teardown::Pipe(pipe.clone(), file.writable),
                    FileKind::Inode { inode, .. } => Teardown::Inode(*inode),
                    FileKind::Device { .. } => Teardown::None,
                };
            });
        }
        match teardown {
            Teardown::Pipe(pipe, writable) => {
                pipe.close(writable);
            }
            Teardown::Inode(inode) => {
                fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, inode);
            }
            Teardown::None => {}
        }
    }

    /// `fstat`/`newfstatat`: only inodes and devices carry inode metadata; a
    /// pipe has none (spec.md §6).
    pub fn stat(&self, fs: &FileSystem, handle: FileHandle) -> Result<Stat> {
        let file = self.slot(handle);
        let inode = match &file.kind {
            FileKind::Inode { inode, .. } => *inode,
            _ => return Err(KernelError::InvalidArgument),
        };
        let guard = fs.itable.lock(&fs.bcache, inode);
        Ok(Stat::new(inode.inum, guard.kind, guard.nlink, guard.size))
    }

    /// Dispatches to the pipe, inode (tracking and advancing its own `off`),
    /// or device read path (spec.md §4.7: "`file_read` dispatches to inode
    /// `read` ... or `pipe_read`").
    pub fn read(&self, fs: &FileSystem, devices: &Devices, handle: FileHandle, pid: Pid, dst: &mut [u8]) -> Result<usize> {
        let file = self.slot(handle);
        if !file.readable {
            return Err(KernelError::PermissionDenied);
        }
        match &file.kind {
            FileKind::Pipe(pipe) => pipe.read(pid, dst),
            FileKind::Device { major } => devices.get(*major)?.read(pid, dst),
            FileKind::Inode { inode, off } => {
                let mut off = off.lock().unwrap();
                let n = fs.itable.read(&fs.bcache, *inode, dst, *off as usize)?;
                *off += n as u32;
                Ok(n)
            }
        }
    }

    /// Dispatches to the pipe, inode, or device write path. Inode writes are
    /// chunked to `≤ ((OP_MAX_BLOCKS − 4) / 2) × BSIZE` bytes, each chunk its
    /// own `begin_op`/`end_op` bracket, because one atomic operation has a
    /// fixed log budget (spec.md §4.7).
    pub fn write(&self, fs: &FileSystem, devices: &Devices, handle: FileHandle, pid: Pid, src: &[u8]) -> Result<usize> {
        let file = self.slot(handle);
        if !file.writable {
            return Err(KernelError::PermissionDenied);
        }
        match &file.kind {
            FileKind::Pipe(pipe) => pipe.write(pid, src),
            FileKind::Device { major } => devices.get(*major)?.write(pid, src),
            FileKind::Inode { inode, off } => {
                const MAX_CHUNK: usize = ((OP_MAX_BLOCKS - 1 - 1 - 2) / 2) * BSIZE;
                let mut done = 0;
                while done < src.len() {
                    let chunk = (src.len() - done).min(MAX_CHUNK);
                    fs.log.begin_op(pid)?;
                    let mut off_guard = off.lock().unwrap();
                    let result = fs.itable.write(&fs.bcache, &fs.log, &fs.bitmap, *inode, &src[done..done + chunk], *off_guard as usize);
                    fs.log.end_op(pid);
                    let written = result?;
                    assert_eq!(written, chunk, "short write inside a single operation");
                    *off_guard += written as u32;
                    drop(off_guard);
                    done += chunk;
                }
                Ok(done)
            }
        }
    }

    /// `true` if `handle` refers to a directory inode; used by `openat`
    /// (spec.md §4.11) to reject `O_WRONLY`/`O_RDWR` on directories.
    pub fn is_dir(&self, fs: &FileSystem, handle: FileHandle) -> bool {
        let file = self.slot(handle);
        matches!(&file.kind, FileKind::Inode { inode, .. } if fs.itable.lock(&fs.bcache, *inode).kind == DInodeType::Dir)
    }

    /// `true` if `handle` was opened for writing; `mmap` (spec.md §6) checks
    /// this before building a `MAP_SHARED` + `PROT_WRITE` section.
    pub fn is_writable(&self, handle: FileHandle) -> bool {
        self.slot(handle).writable
    }

    /// The inode backing `handle`, for `mmap` to build a file-backed
    /// section over. Pipes and devices have no inode to map.
    pub fn inode_of(&self, handle: FileHandle) -> Result<Inode> {
        match &self.slot(handle).kind {
            FileKind::Inode { inode, .. } => Ok(*inode),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// The pipe backing `handle`, if any — `read`/`write` use this to
    /// register the calling process's [`crate::proc::Proc::blocked_on`]
    /// before making a call that might block, so `kill(2)` can interrupt it.
    pub fn pipe_of(&self, handle: FileHandle) -> Option<Arc<Pipe>> {
        match &self.slot(handle).kind {
            FileKind::Pipe(pipe) => Some(pipe.clone()),
            _ => None,
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
