//! Bitmap allocator for data blocks (spec.md §4.5).
//!
//! Grounded on `kernel-rs/src/fs/mod.rs`'s `balloc`/`bfree`: the bitmap
//! covers every block on the device by absolute block number — `mkfs`
//! pre-marks the boot/superblock/log/inode/bitmap blocks themselves as used,
//! so a scan naturally skips them — and `alloc` scans the bitmap blocks for
//! a zero bit, sets it inside the current operation, zeroes the data block,
//! and returns its number; `bfree` just clears the bit. Protected by its own
//! spinlock, separate from the block cache's list lock, per the acquire
//! order in spec.md §5.

use super::bcache::BufferCache;
use super::log::Log;
use super::superblock::Superblock;
use crate::error::{KernelError, Result};
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, ROOTDEV};

pub struct BitmapAllocator {
    bitmap_start: u32,
    /// First block number a caller may ever receive from `alloc`: the
    /// bitmap itself, and everything before it, is permanently reserved.
    data_start: u32,
    num_blocks: u32,
    lock: Spinlock<()>,
}

impl BitmapAllocator {
    pub fn new(superblock: &Superblock) -> Self {
        let bits_per_block = (BSIZE * 8) as u32;
        let bitmap_blocks = (superblock.num_blocks + bits_per_block - 1) / bits_per_block;
        Self {
            bitmap_start: superblock.bitmap_start,
            data_start: superblock.bitmap_start + bitmap_blocks,
            num_blocks: superblock.num_blocks,
            lock: Spinlock::new_at("bitmap", LockLevel::Bitmap, ()),
        }
    }

    /// Scans the bitmap for a zero bit at or past [`Self::data_start`],
    /// claims it, zeroes the data block, and returns its block number. Must
    /// be called inside a `begin_op`/`end_op` bracket: both the bitmap edit
    /// and the zeroing are logged so a crash mid-allocation can't hand out
    /// a block that looks both free and in-use.
    pub fn alloc(&self, bcache: &BufferCache, log: &Log) -> Result<u32> {
        let _guard = self.lock.lock();
        let bits_per_block = (BSIZE * 8) as u32;
        for bno in self.data_start..self.num_blocks {
            let block = self.bitmap_start + bno / bits_per_block;
            let bit = (bno % bits_per_block) as usize;
            let handle = bcache.get(ROOTDEV, block)?;
            let is_free = bcache.with_buf(handle, |data| data[bit / 8] & (1 << (bit % 8)) == 0);
            if is_free {
                bcache.with_buf(handle, |data| data[bit / 8] |= 1 << (bit % 8));
                log.write(block);
                bcache.release(handle);

                let zero = bcache.get(ROOTDEV, bno)?;
                bcache.with_buf(zero, |data| data.fill(0));
                log.write(bno);
                bcache.release(zero);
                return Ok(bno);
            }
            bcache.release(handle);
        }
        Err(KernelError::OutOfResources)
    }

    /// Clears `bno`'s bit. Must be called inside an operation, same as
    /// [`Self::alloc`].
    pub fn free(&self, bcache: &BufferCache, log: &Log, bno: u32) {
        let _guard = self.lock.lock();
        let bits_per_block = (BSIZE * 8) as u32;
        let block = self.bitmap_start + bno / bits_per_block;
        let bit = (bno % bits_per_block) as usize;
        let handle = bcache.get(ROOTDEV, block).expect("bitmap block");
        bcache.with_buf(handle, |data| {
            assert!(data[bit / 8] & (1 << (bit % 8)) != 0, "freeing an already-free block");
            data[bit / 8] &= !(1 << (bit % 8));
        });
        log.write(block);
        bcache.release(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::superblock::FSMAGIC;
    use crate::hal::MemBlockDevice;
    use std::sync::Arc;

    fn fixture() -> (Arc<BufferCache>, Log, BitmapAllocator) {
        let device = Arc::new(MemBlockDevice::new(64));
        let bcache = Arc::new(BufferCache::new(device));
        let sb = Superblock {
            magic: FSMAGIC,
            num_blocks: 64,
            num_data_blocks: 20,
            num_inodes: 20,
            num_log_blocks: 31,
            log_start: 2,
            inode_start: 33,
            bitmap_start: 40,
        };
        let log = Log::new(&sb, bcache.clone());
        let bitmap = BitmapAllocator::new(&sb);
        (bcache, log, bitmap)
    }

    #[test]
    fn alloc_zeroes_the_block_and_free_allows_reuse() {
        let (bcache, log, bitmap) = fixture();
        log.begin_op(1).unwrap();
        let bno = bitmap.alloc(&bcache, &log).unwrap();
        assert!(bno >= bitmap.data_start);
        let h2 = bcache.get(ROOTDEV, bno).unwrap();
        bcache.with_buf(h2, |d| assert_eq!(d[0], 0));
        bcache.release(h2);

        bitmap.free(&bcache, &log, bno);
        log.end_op(1);

        log.begin_op(1).unwrap();
        let reused = bitmap.alloc(&bcache, &log).unwrap();
        assert_eq!(reused, bno);
        log.end_op(1);
    }

    #[test]
    fn exhausted_bitmap_returns_out_of_resources() {
        let (bcache, log, bitmap) = fixture();
        let available = (bitmap.num_blocks - bitmap.data_start) as usize;
        log.begin_op(1).unwrap();
        for _ in 0..available {
            bitmap.alloc(&bcache, &log).unwrap();
        }
        assert_eq!(bitmap.alloc(&bcache, &log), Err(KernelError::OutOfResources));
        log.end_op(1);
    }
}
