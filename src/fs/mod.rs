//! Buffered block layer, write-ahead log, bitmap allocator, and the inode
//! filesystem built on top of them (spec.md §4.5–§4.7, component C5/C6).
//!
//! Grounded on the teacher's `kernel-rs/src/fs` module tree: `superblock.rs`
//! (on-disk layout), `bio.rs` (MRU block cache), `fs/ufs/log.rs` (group-commit
//! WAL), `fs/mod.rs` (bitmap allocator), and `fs/ufs/inode.rs` (inode I/O,
//! directories, path resolution). Each is split into its own file here the
//! same way the teacher splits them, minus the `Pin`/`StrongPin` machinery
//! (see `DESIGN.md`).

pub mod bcache;
pub mod bitmap;
pub mod dir;
pub mod inode;
pub mod log;
pub mod path;
pub mod superblock;

use std::sync::Arc;

use crate::error::Result;
use crate::hal::BlockDevice;
use crate::param::ROOTINO;

pub use bcache::BufferCache;
pub use bitmap::BitmapAllocator;
pub use inode::{DInodeType, Inode, InodeTable};
pub use log::Log;
pub use superblock::Superblock;

/// Everything C5/C6 needs, wired together: the block cache, log, bitmap
/// allocator, and inode table that share one device. Mirrors the teacher's
/// habit of stitching these into one `FileSystem`/`Ufs` type that the rest
/// of the kernel holds a single handle to (see `kernel-rs/src/fs/mod.rs`).
pub struct FileSystem {
    pub superblock: Superblock,
    pub bcache: Arc<BufferCache>,
    pub log: Arc<Log>,
    pub bitmap: BitmapAllocator,
    pub itable: InodeTable,
}

impl FileSystem {
    /// Mounts a filesystem image: reads the superblock from block 1, runs
    /// log recovery (idempotent if the previous shutdown was clean), then
    /// constructs the bitmap allocator and inode table over the recovered
    /// device. Mirrors `kernel-rs/src/fs/mod.rs`'s boot-time `init`.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut raw = [0u8; crate::param::BSIZE];
        device.read(1, &mut raw);
        let superblock = Superblock::decode(&raw)?;

        let bcache = Arc::new(BufferCache::new(device.clone()));
        let log = Arc::new(Log::new(&superblock, bcache.clone()));
        log.recover();

        let bitmap = BitmapAllocator::new(&superblock);
        let itable = InodeTable::new(superblock.clone());

        let fs = Self {
            superblock,
            bcache,
            log,
            bitmap,
            itable,
        };
        fs.check_root()?;
        Ok(fs)
    }

    /// spec.md §7: "root inode not a directory at mount" is a corruption /
    /// invariant violation, not a user-origin error, so it panics rather
    /// than returning `Err`.
    fn check_root(&self) -> Result<()> {
        let root = self.itable.get(&self.bcache, ROOTINO);
        let locked = self.itable.lock(&self.bcache, root);
        if locked.kind != DInodeType::Dir {
            crate::kernel_panic!("root inode {} is not a directory at mount", ROOTINO);
        }
        drop(locked);
        self.itable.put(&self.bcache, &self.log, &self.bitmap, root);
        Ok(())
    }

    pub fn root(&self) -> Inode {
        self.itable.get(&self.bcache, ROOTINO)
    }

    pub fn resolve(&self, cwd: &Inode, path: &[u8]) -> Result<Inode> {
        path::namei(self, cwd, path)
    }
}
