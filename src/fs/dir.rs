//! Directory entries and operations (spec.md §3, §4.6).
//!
//! Grounded on `kernel-rs/src/fs/ufs/inode.rs`'s `Dirent` (`#[repr(C)]`,
//! `AsBytes`/`FromBytes`) and `InodeGuard::{dirlookup, dirlink,
//! iter_dirents}`: a directory's data is just a flat array of fixed-size
//! entries read/written through the ordinary inode `read`/`write` path.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::bcache::BufferCache;
use super::bitmap::BitmapAllocator;
use super::inode::{DInodeType, Inode, InodeTable};
use super::log::Log;
use crate::error::{KernelError, Result};
use crate::param::DIRSIZ;

/// One directory entry: spec.md §3's `{inode_no:u16, name[14]}`, 16 bytes.
/// `inode_no == 0` marks an empty slot.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct Dirent {
    pub inode_no: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn empty() -> Self {
        Self { inode_no: 0, name: [0; DIRSIZ] }
    }

    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    fn set_name(&mut self, name: &[u8]) {
        self.name = [0; DIRSIZ];
        let n = name.len().min(DIRSIZ);
        self.name[..n].copy_from_slice(&name[..n]);
    }
}

/// Linear-scans `dir`'s entries for `name`, returning the matching inode
/// number and its byte offset within the directory (so callers can
/// overwrite or compute a free slot). Mirrors `dirlookup`.
pub fn lookup(bcache: &BufferCache, itable: &InodeTable, dir: Inode, name: &[u8]) -> Option<(u32, usize)> {
    let guard = itable.lock(bcache, dir);
    if guard.kind != DInodeType::Dir {
        return None;
    }
    let size = guard.size as usize;
    drop(guard);
    let mut off = 0;
    let mut raw = [0u8; Dirent::SIZE];
    while off < size {
        let n = itable.read(bcache, dir, &mut raw, off).ok()?;
        if n < Dirent::SIZE {
            break;
        }
        let entry = Dirent::read_from(&raw[..]).unwrap();
        if entry.inode_no != 0 && entry.name() == name {
            return Some((entry.inode_no as u32, off));
        }
        off += Dirent::SIZE;
    }
    None
}

/// Inserts `(name, inum)` into the first empty slot (or appends), refusing
/// a duplicate name. Must run inside a `begin_op`/`end_op` bracket. Mirrors
/// `dirlink`.
pub fn insert(
    bcache: &BufferCache,
    log: &Log,
    bitmap: &BitmapAllocator,
    itable: &InodeTable,
    dir: Inode,
    name: &[u8],
    inum: u32,
) -> Result<()> {
    if lookup(bcache, itable, dir, name).is_some() {
        return Err(KernelError::AlreadyExists);
    }
    let guard = itable.lock(bcache, dir);
    let size = guard.size as usize;
    drop(guard);

    let mut off = 0;
    let mut raw = [0u8; Dirent::SIZE];
    let mut slot = size;
    while off < size {
        let n = itable.read(bcache, dir, &mut raw, off)?;
        if n < Dirent::SIZE {
            break;
        }
        let entry = Dirent::read_from(&raw[..]).unwrap();
        if entry.inode_no == 0 {
            slot = off;
            break;
        }
        off += Dirent::SIZE;
    }

    let mut entry = Dirent::empty();
    entry.inode_no = inum as u16;
    entry.set_name(name);
    itable.write(bcache, log, bitmap, dir, entry.as_bytes(), slot)?;
    Ok(())
}

/// Zeroes the entry at byte offset `off` (the inode number becomes 0, so
/// the slot reads as empty and is reused by a later `insert`). Mirrors
/// `remove(off)`.
pub fn remove(bcache: &BufferCache, log: &Log, bitmap: &BitmapAllocator, itable: &InodeTable, dir: Inode, off: usize) -> Result<()> {
    let empty = Dirent::empty();
    itable.write(bcache, log, bitmap, dir, empty.as_bytes(), off)?;
    Ok(())
}

/// `false` if `dir` has any entry besides `.`/`..`.
pub fn is_empty(bcache: &BufferCache, itable: &InodeTable, dir: Inode) -> bool {
    let size = itable.lock(bcache, dir).size as usize;
    let mut off = 0;
    let mut raw = [0u8; Dirent::SIZE];
    while off < size {
        if itable.read(bcache, dir, &mut raw, off).unwrap_or(0) < Dirent::SIZE {
            break;
        }
        let entry = Dirent::read_from(&raw[..]).unwrap();
        if entry.inode_no != 0 && entry.name() != b".".as_slice() && entry.name() != b"..".as_slice() {
            return false;
        }
        off += Dirent::SIZE;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::DInodeType;
    use crate::fs::log::Log;
    use crate::fs::superblock::{Superblock, FSMAGIC};
    use crate::hal::MemBlockDevice;
    use std::sync::Arc;

    fn fixture() -> (Arc<BufferCache>, Log, BitmapAllocator, InodeTable) {
        let device = Arc::new(MemBlockDevice::new(200));
        let bcache = Arc::new(BufferCache::new(device));
        let sb = Superblock {
            magic: FSMAGIC,
            num_blocks: 200,
            num_data_blocks: 150,
            num_inodes: 40,
            num_log_blocks: 31,
            log_start: 2,
            inode_start: 33,
            bitmap_start: 34,
        };
        let log = Log::new(&sb, bcache.clone());
        let bitmap = BitmapAllocator::new(&sb);
        let itable = InodeTable::new(sb);
        (bcache, log, bitmap, itable)
    }

    #[test]
    fn insert_then_lookup_finds_the_entry() {
        let (bcache, log, bitmap, itable) = fixture();
        log.begin_op(1).unwrap();
        let dir = itable.alloc(&bcache, &log, DInodeType::Dir);
        let file = itable.alloc(&bcache, &log, DInodeType::File);
        insert(&bcache, &log, &bitmap, &itable, dir, b"a.txt", file.inum).unwrap();
        log.end_op(1);

        let found = lookup(&bcache, &itable, dir, b"a.txt");
        assert_eq!(found.map(|(inum, _)| inum), Some(file.inum));
    }

    #[test]
    fn insert_rejects_duplicate_names() {
        let (bcache, log, bitmap, itable) = fixture();
        log.begin_op(1).unwrap();
        let dir = itable.alloc(&bcache, &log, DInodeType::Dir);
        let file = itable.alloc(&bcache, &log, DInodeType::File);
        insert(&bcache, &log, &bitmap, &itable, dir, b"x", file.inum).unwrap();
        let err = insert(&bcache, &log, &bitmap, &itable, dir, b"x", file.inum);
        log.end_op(1);
        assert_eq!(err, Err(KernelError::AlreadyExists));
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let (bcache, log, bitmap, itable) = fixture();
        log.begin_op(1).unwrap();
        let dir = itable.alloc(&bcache, &log, DInodeType::Dir);
        let file = itable.alloc(&bcache, &log, DInodeType::File);
        insert(&bcache, &log, &bitmap, &itable, dir, b"x", file.inum).unwrap();
        let (_, off) = lookup(&bcache, &itable, dir, b"x").unwrap();
        remove(&bcache, &log, &bitmap, &itable, dir, off).unwrap();
        log.end_op(1);

        assert!(lookup(&bcache, &itable, dir, b"x").is_none());
        assert!(is_empty(&bcache, &itable, dir));
    }
}
