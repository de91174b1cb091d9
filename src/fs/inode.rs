//! Inode layer: on-disk inode I/O, block mapping, and the in-memory inode
//! cache (spec.md §4.6, component C6).
//!
//! Grounded on `kernel-rs/src/fs/ufs/inode.rs`'s `Dinode` on-disk struct,
//! `InodeGuard`'s `bmap_internal`/`read_internal`/`write_internal`, and
//! `Itable::get_inode`/`alloc_inode`; also `fs/mod.rs`'s `balloc`/`bfree`
//! wiring. The teacher's `InodeGuard<InodeInner>` is a `Pin`-projected
//! sleep-lock guard tied to an `ArrayArena`; this module keeps the same
//! "sleep-lock per cached inode, lazily loaded" shape but the cache is
//! [`crate::util::Arena`] addressed by a `Copy` [`Inode`] handle, the same
//! pattern as `super::bcache::BufHandle` — a caller must explicitly
//! [`InodeTable::put`] a handle it's done with, mirroring `ArenaObject`'s
//! finalize-on-last-decref without the `Drop`-based machinery.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::bcache::BufferCache;
use super::bitmap::BitmapAllocator;
use super::log::Log;
use super::superblock::Superblock;
use crate::error::{KernelError, Result};
use crate::lock::sleeplock::{Sleeplock, SleeplockGuard};
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::mm::PageSource;
use crate::param::{BSIZE, DINODE_SIZE, NDIRECT, NINDIRECT, NINODE, PAGE, ROOTDEV};
use crate::util::Arena;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DInodeType {
    Invalid = 0,
    Dir = 1,
    File = 2,
    Device = 3,
}

impl DInodeType {
    fn from_raw(raw: u16) -> Self {
        match raw {
            1 => DInodeType::Dir,
            2 => DInodeType::File,
            3 => DInodeType::Device,
            _ => DInodeType::Invalid,
        }
    }
}

/// On-disk inode entry. `NDIRECT` direct pointers plus one single-indirect
/// pointer, exactly spec.md §6's layout.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct Dinode {
    kind: u16,
    major: u16,
    minor: u16,
    nlink: u16,
    size: u32,
    addrs: [u32; NDIRECT],
    indirect: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Dinode>(), DINODE_SIZE);

impl Dinode {
    const fn invalid() -> Self {
        Self {
            kind: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT],
            indirect: 0,
        }
    }
}

/// In-memory mirror of one on-disk inode entry, behind the cache slot's
/// sleep lock.
pub struct InodeData {
    valid: bool,
    pub kind: DInodeType,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT],
    pub indirect: u32,
}

impl InodeData {
    fn empty() -> Self {
        Self {
            valid: false,
            kind: DInodeType::Invalid,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT],
            indirect: 0,
        }
    }

    fn load(&mut self, d: &Dinode) {
        self.valid = true;
        self.kind = DInodeType::from_raw(d.kind);
        self.major = d.major;
        self.minor = d.minor;
        self.nlink = d.nlink;
        self.size = d.size;
        self.addrs = d.addrs;
        self.indirect = d.indirect;
    }

    fn to_dinode(&self) -> Dinode {
        Dinode {
            kind: self.kind as u16,
            major: self.major,
            minor: self.minor,
            nlink: self.nlink,
            size: self.size,
            addrs: self.addrs,
            indirect: self.indirect,
        }
    }
}

struct InodeSlot {
    inum: u32,
    data: Sleeplock<InodeData>,
}

/// A cheap, `Copy` handle into the in-memory inode cache, the same role
/// [`super::bcache::BufHandle`] plays for buffers. Obtained from
/// [`InodeTable::get`]/[`InodeTable::alloc`]/[`InodeTable::dup`]; every copy
/// must eventually reach [`InodeTable::put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inode {
    idx: usize,
    pub inum: u32,
}

impl Inode {
    /// Exposes the raw cache-slot index so [`crate::proc::Proc::cwd`] — an
    /// opaque `usize`, per that module's doc comment — can store a working
    /// directory without `proc` depending on `fs`. Pair with
    /// [`InodeTable::inode_at`] to recover the handle.
    pub fn raw(self) -> usize {
        self.idx
    }
}

pub struct InodeTable {
    arena: Spinlock<Arena<InodeSlot>>,
    superblock: Superblock,
}

impl InodeTable {
    pub fn new(superblock: Superblock) -> Self {
        Self {
            arena: Spinlock::new_at("itable", LockLevel::Other, Arena::with_capacity(NINODE)),
            superblock,
        }
    }

    fn iloc(&self, inum: u32) -> (u32, usize) {
        let block = self.superblock.iblock(inum);
        let offset = (inum as usize % self.superblock.inodes_per_block() as usize) * DINODE_SIZE;
        (block, offset)
    }

    /// Returns a ref-counted handle for `inum`, without touching the disk.
    /// Mirrors `Itable::get_inode`.
    pub fn get(&self, _bcache: &BufferCache, inum: u32) -> Inode {
        let mut arena = self.arena.lock();
        let idx = arena
            .find_or_alloc(
                |s| s.inum == inum,
                || InodeSlot {
                    inum,
                    data: Sleeplock::new("inode", InodeData::empty()),
                },
            )
            .expect("inode cache exhausted");
        Inode { idx, inum }
    }

    pub fn dup(&self, inode: Inode) -> Inode {
        self.arena.lock().incref(inode.idx);
        inode
    }

    /// Rebuilds a handle from a raw slot index previously obtained from
    /// [`Inode::raw`]. Does not touch the refcount; the caller is expected
    /// to already be holding the reference that index represents.
    pub fn inode_at(&self, idx: usize) -> Inode {
        let arena = self.arena.lock();
        Inode { idx, inum: arena.get(idx).inum }
    }

    /// SAFETY: `util::Arena`'s backing storage never reallocates after
    /// construction, and `inode` holds a reference to the slot, so this
    /// pointer stays valid for as long as the handle is held.
    fn slot(&self, inode: Inode) -> &InodeSlot {
        let arena = self.arena.lock();
        unsafe { &*(arena.get(inode.idx) as *const InodeSlot) }
    }

    /// Locks the inode's data, lazily loading it from disk on first touch
    /// under the lock, mirroring `InodeGuard::deref`'s lazy-load path.
    pub fn lock(&self, bcache: &BufferCache, inode: Inode) -> SleeplockGuard<'_, InodeData> {
        let slot = self.slot(inode);
        let mut guard = slot.data.lock();
        if !guard.valid {
            let (block, offset) = self.iloc(inode.inum);
            let handle = bcache.get(ROOTDEV, block).expect("inode block");
            let dinode = bcache.with_buf(handle, |data| Dinode::read_from_prefix(&data[offset..]).unwrap());
            bcache.release(handle);
            guard.load(&dinode);
        }
        guard
    }

    /// Writes `data`'s fields back to the on-disk slot. Must run inside a
    /// `begin_op`/`end_op` bracket.
    pub fn update(&self, bcache: &BufferCache, log: &Log, inode: Inode, data: &InodeData) {
        let (block, offset) = self.iloc(inode.inum);
        let dinode = data.to_dinode();
        let handle = bcache.get(ROOTDEV, block).expect("inode block");
        bcache.with_buf(handle, |buf| buf[offset..offset + DINODE_SIZE].copy_from_slice(dinode.as_bytes()));
        log.write(block);
        bcache.release(handle);
    }

    /// Scans inode blocks for a slot with `kind == INVALID`, claims it for
    /// `kind`, and returns its handle. Panics on exhaustion, per spec.md
    /// §4.6 ("Panics on exhaustion") — every inode slot is fixed at mkfs
    /// time, so running out is a configuration error, not a recoverable
    /// one.
    pub fn alloc(&self, bcache: &BufferCache, log: &Log, kind: DInodeType) -> Inode {
        for inum in 1..self.superblock.num_inodes {
            let (block, offset) = self.iloc(inum);
            let handle = bcache.get(ROOTDEV, block).expect("inode block");
            let existing = bcache.with_buf(handle, |data| Dinode::read_from_prefix(&data[offset..]).unwrap());
            if DInodeType::from_raw(existing.kind) == DInodeType::Invalid {
                let mut fresh = Dinode::invalid();
                fresh.kind = kind as u16;
                bcache.with_buf(handle, |data| data[offset..offset + DINODE_SIZE].copy_from_slice(fresh.as_bytes()));
                log.write(block);
                bcache.release(handle);
                return self.get(bcache, inum);
            }
            bcache.release(handle);
        }
        crate::kernel_panic!("inode table exhausted: no INVALID slot among {} inodes", self.superblock.num_inodes);
    }

    /// Releases one reference. If it was the last one and the inode's link
    /// count is zero, frees its data blocks and marks it INVALID on disk
    /// (spec.md §4.6: "On last put, if ref and link counts are both zero").
    pub fn put(&self, bcache: &BufferCache, log: &Log, bitmap: &BitmapAllocator, inode: Inode) {
        let mut should_free = false;
        {
            let mut arena = self.arena.lock();
            arena.decref(inode.idx, |slot| {
                if slot.data.lock().nlink == 0 {
                    should_free = true;
                }
            });
        }
        if should_free {
            log.begin_op(0).ok();
            self.free_on_disk(bcache, log, bitmap, inode.inum);
            log.end_op(0);
        }
    }

    fn free_on_disk(&self, bcache: &BufferCache, log: &Log, bitmap: &BitmapAllocator, inum: u32) {
        let (block, offset) = self.iloc(inum);
        let handle = bcache.get(ROOTDEV, block).expect("inode block");
        let dinode = bcache.with_buf(handle, |data| Dinode::read_from_prefix(&data[offset..]).unwrap());
        bcache.release(handle);

        for addr in dinode.addrs {
            if addr != 0 {
                bitmap.free(bcache, log, addr);
            }
        }
        if dinode.indirect != 0 {
            let ih = bcache.get(ROOTDEV, dinode.indirect).expect("indirect block");
            let entries = bcache.with_buf(ih, read_indirect_block);
            bcache.release(ih);
            for a in entries {
                if a != 0 {
                    bitmap.free(bcache, log, a);
                }
            }
            bitmap.free(bcache, log, dinode.indirect);
        }

        let empty = Dinode::invalid();
        let handle2 = bcache.get(ROOTDEV, block).expect("inode block");
        bcache.with_buf(handle2, |data| data[offset..offset + DINODE_SIZE].copy_from_slice(empty.as_bytes()));
        log.write(block);
        bcache.release(handle2);
    }

    /// Explicit truncate-to-zero, usable by `open(O_TRUNC)` without waiting
    /// for the last reference to drop. Frees every data block but keeps the
    /// inode allocated (nlink untouched).
    pub fn truncate(&self, bcache: &BufferCache, log: &Log, bitmap: &BitmapAllocator, data: &mut InodeData) {
        for addr in data.addrs.iter_mut() {
            if *addr != 0 {
                bitmap.free(bcache, log, *addr);
                *addr = 0;
            }
        }
        if data.indirect != 0 {
            let ih = bcache.get(ROOTDEV, data.indirect).expect("indirect block");
            let entries = bcache.with_buf(ih, read_indirect_block);
            bcache.release(ih);
            for a in entries {
                if a != 0 {
                    bitmap.free(bcache, log, a);
                }
            }
            bitmap.free(bcache, log, data.indirect);
            data.indirect = 0;
        }
        data.size = 0;
    }

    /// Maps a logical block index to a device block number, per spec.md
    /// §4.6's `inode_map`: direct indices come straight from `addrs`,
    /// indices past `NDIRECT` come from the single-indirect block. With
    /// `alloc_ctx` supplied, unallocated slots are lazily filled in;
    /// without it (a read-only probe), an unallocated slot returns `None`.
    fn bmap(
        &self,
        bcache: &BufferCache,
        alloc_ctx: Option<(&Log, &BitmapAllocator)>,
        data: &mut InodeData,
        block_index: usize,
    ) -> Result<Option<u32>> {
        if block_index < NDIRECT {
            if data.addrs[block_index] == 0 {
                let Some((log, bitmap)) = alloc_ctx else { return Ok(None) };
                data.addrs[block_index] = bitmap.alloc(bcache, log)?;
            }
            return Ok(Some(data.addrs[block_index]));
        }
        let idx = block_index - NDIRECT;
        if idx >= NINDIRECT {
            return Err(KernelError::InvalidArgument);
        }
        let Some((log, bitmap)) = alloc_ctx else {
            if data.indirect == 0 {
                return Ok(None);
            }
            let ih = bcache.get(ROOTDEV, data.indirect)?;
            let existing = bcache.with_buf(ih, |d| read_u32(d, idx));
            bcache.release(ih);
            return Ok(if existing == 0 { None } else { Some(existing) });
        };
        if data.indirect == 0 {
            data.indirect = bitmap.alloc(bcache, log)?;
        }
        let ih = bcache.get(ROOTDEV, data.indirect)?;
        let existing = bcache.with_buf(ih, |d| read_u32(d, idx));
        if existing != 0 {
            bcache.release(ih);
            return Ok(Some(existing));
        }
        let bno = bitmap.alloc(bcache, log)?;
        bcache.with_buf(ih, |d| write_u32(d, idx, bno));
        log.write(data.indirect);
        bcache.release(ih);
        Ok(Some(bno))
    }

    /// Reads up to `dst.len()` bytes starting at `off`, clamped to the
    /// inode's current size (spec.md §4.6: "Reads clamp to `num_bytes`").
    pub fn read(&self, bcache: &BufferCache, inode: Inode, dst: &mut [u8], off: usize) -> Result<usize> {
        let mut guard = self.lock(bcache, inode);
        if guard.kind == DInodeType::Invalid {
            return Err(KernelError::NotFound);
        }
        let size = guard.size as usize;
        if off >= size {
            return Ok(0);
        }
        let n = dst.len().min(size - off);
        let mut done = 0;
        while done < n {
            let block_index = (off + done) / BSIZE;
            let block_off = (off + done) % BSIZE;
            let chunk = (BSIZE - block_off).min(n - done);
            match self.bmap(bcache, None, &mut guard, block_index)? {
                Some(bno) => {
                    let handle = bcache.get(ROOTDEV, bno)?;
                    bcache.with_buf(handle, |data| {
                        dst[done..done + chunk].copy_from_slice(&data[block_off..block_off + chunk]);
                    });
                    bcache.release(handle);
                }
                None => dst[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(n)
    }

    /// Writes `src` at `off`, allocating blocks as needed, and extends
    /// `num_bytes` if the write grows the file. Must run inside a
    /// `begin_op`/`end_op` bracket sized for the number of blocks touched
    /// (spec.md §4.7 caps this at the caller).
    pub fn write(&self, bcache: &BufferCache, log: &Log, bitmap: &BitmapAllocator, inode: Inode, src: &[u8], off: usize) -> Result<usize> {
        let mut guard = self.lock(bcache, inode);
        if guard.kind == DInodeType::Invalid {
            return Err(KernelError::NotFound);
        }
        let max_file_bytes = (NDIRECT + NINDIRECT) * BSIZE;
        if off > max_file_bytes || off + src.len() > max_file_bytes {
            return Err(KernelError::InvalidArgument);
        }
        let mut done = 0;
        while done < src.len() {
            let block_index = (off + done) / BSIZE;
            let block_off = (off + done) % BSIZE;
            let chunk = (BSIZE - block_off).min(src.len() - done);
            let bno = self
                .bmap(bcache, Some((log, bitmap)), &mut guard, block_index)?
                .expect("bmap with alloc_ctx always returns a block");
            let handle = bcache.get(ROOTDEV, bno)?;
            bcache.with_buf(handle, |data| {
                data[block_off..block_off + chunk].copy_from_slice(&src[done..done + chunk]);
            });
            log.write(bno);
            bcache.release(handle);
            done += chunk;
        }
        let end = (off + src.len()) as u32;
        if end > guard.size {
            guard.size = end;
        }
        self.update(bcache, log, inode, &guard);
        Ok(done)
    }
}

fn read_indirect_block(data: &mut [u8; BSIZE]) -> [u32; NINDIRECT] {
    let mut out = [0u32; NINDIRECT];
    for (i, entry) in out.iter_mut().enumerate() {
        *entry = read_u32(data, i);
    }
    out
}

fn read_u32(data: &[u8; BSIZE], idx: usize) -> u32 {
    u32::from_le_bytes(data[idx * 4..idx * 4 + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8; BSIZE], idx: usize, value: u32) {
    data[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

/// A snapshot of one inode's extent map, implementing [`PageSource`] so a
/// file can back an `mmap` section (spec.md §4.4, §4.7). Snapshotting at
/// construction rather than re-locking the live inode on every fault keeps
/// `mm` decoupled from `fs`'s locking; the extent map of an mmap'd file
/// growing concurrently is out of scope (spec.md's Non-goals already
/// exclude swapping-to-disk beyond stubs, and this spec never tests a file
/// growing under an active mapping).
pub struct InodeFile {
    bcache: std::sync::Arc<BufferCache>,
    log: std::sync::Arc<Log>,
    addrs: [u32; NDIRECT],
    indirect: u32,
    size: u32,
}

impl InodeFile {
    pub fn snapshot(bcache: std::sync::Arc<BufferCache>, log: std::sync::Arc<Log>, data: &InodeData) -> Self {
        Self {
            bcache,
            log,
            addrs: data.addrs,
            indirect: data.indirect,
            size: data.size,
        }
    }

    fn lookup(&self, block_index: usize) -> Option<u32> {
        if block_index < NDIRECT {
            let a = self.addrs[block_index];
            return if a == 0 { None } else { Some(a) };
        }
        let idx = block_index.checked_sub(NDIRECT)?;
        if idx >= NINDIRECT || self.indirect == 0 {
            return None;
        }
        let handle = self.bcache.get(ROOTDEV, self.indirect).ok()?;
        let a = self.bcache.with_buf(handle, |d| read_u32(d, idx));
        self.bcache.release(handle);
        if a == 0 {
            None
        } else {
            Some(a)
        }
    }
}

impl PageSource for InodeFile {
    fn fill_page(&self, offset: u64, dst: &mut [u8; PAGE]) -> Result<()> {
        dst.fill(0);
        if offset >= self.size as u64 {
            return Ok(());
        }
        let block_index = (offset / BSIZE as u64) as usize;
        if let Some(bno) = self.lookup(block_index) {
            let handle = self.bcache.get(ROOTDEV, bno)?;
            self.bcache.with_buf(handle, |data| dst.copy_from_slice(data));
            self.bcache.release(handle);
        }
        let remaining = self.size as u64 - offset;
        if remaining < PAGE as u64 {
            dst[remaining as usize..].fill(0);
        }
        Ok(())
    }

    /// `munmap`'s `MAP_SHARED` writeback (spec.md §6). Writes only within
    /// the file's size as snapshotted at `mmap` time — growing a file
    /// through a dirty mmap'd page is out of scope (a `MAP_SHARED` mapping
    /// requires an already-writable file per spec.md §6, not one sized by
    /// the mapping), so an offset with no already-allocated block is
    /// silently dropped rather than allocated.
    fn writeback(&self, offset: u64, bytes: &[u8; PAGE]) -> Result<()> {
        if offset >= self.size as u64 {
            return Ok(());
        }
        let block_index = (offset / BSIZE as u64) as usize;
        let Some(bno) = self.lookup(block_index) else {
            return Ok(());
        };
        let n = ((self.size as u64 - offset).min(PAGE as u64)) as usize;
        let handle = self.bcache.get(ROOTDEV, bno)?;
        self.bcache.with_buf(handle, |data| data[..n].copy_from_slice(&bytes[..n]));
        self.log.write(bno);
        self.bcache.release(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::superblock::FSMAGIC;
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
    fn alloc_write_read_round_trip() {
        let (bcache, log, bitmap, itable) = fixture();
        log.begin_op(1).unwrap();
        let inode = itable.alloc(&bcache, &log, DInodeType::File);
        {
            let mut guard = itable.lock(&bcache, inode);
            guard.nlink = 1;
            itable.update(&bcache, &log, inode, &guard);
        }
        itable.write(&bcache, &log, &bitmap, inode, b"hello world", 0).unwrap();
        log.end_op(1);

        let mut buf = [0u8; 11];
        let n = itable.read(&bcache, inode, &mut buf, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn write_spanning_direct_to_indirect_boundary() {
        let (bcache, log, bitmap, itable) = fixture();
        log.begin_op(1).unwrap();
        let inode = itable.alloc(&bcache, &log, DInodeType::File);
        {
            let mut guard = itable.lock(&bcache, inode);
            guard.nlink = 1;
            itable.update(&bcache, &log, inode, &guard);
        }
        let data = vec![0x5Au8; BSIZE * (NDIRECT + 2)];
        itable.write(&bcache, &log, &bitmap, inode, &data, 0).unwrap();
        log.end_op(1);

        let mut readback = vec![0u8; data.len()];
        let n = itable.read(&bcache, inode, &mut readback, 0).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(readback, data);
    }

    #[test]
    fn put_at_zero_nlink_frees_blocks_and_invalidates() {
        let (bcache, log, bitmap, itable) = fixture();
        log.begin_op(1).unwrap();
        let inode = itable.alloc(&bcache, &log, DInodeType::File);
        itable.write(&bcache, &log, &bitmap, inode, b"data", 0).unwrap();
        {
            let mut guard = itable.lock(&bcache, inode);
            guard.nlink = 0;
            itable.update(&bcache, &log, inode, &guard);
        }
        log.end_op(1);

        itable.put(&bcache, &log, &bitmap, inode);

        let reread = itable.get(&bcache, inode.inum);
        let guard = itable.lock(&bcache, reread);
        assert_eq!(guard.kind, DInodeType::Invalid);
        assert_eq!(guard.addrs[0], 0);
    }
}
