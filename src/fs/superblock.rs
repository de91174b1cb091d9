//! On-disk superblock (spec.md §6).
//!
//! Grounded on `kernel-rs/src/fs/superblock.rs`'s `Superblock` struct and
//! `FSMAGIC`/`IPB`/`BPB`/`iblock`/`bblock` helpers, re-expressed with
//! `zerocopy` for the disk round trip (per SPEC_FULL.md §3) instead of the
//! teacher's raw transmute.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{KernelError, Result};
use crate::param::{BSIZE, INODE_PER_BLOCK};

/// Magic number stamped by `mkfs`. `kernel-rs`'s own `FSMAGIC` value,
/// carried over verbatim since nothing in this spec requires changing it.
pub const FSMAGIC: u32 = 0x1020_3040;

/// On-disk superblock layout, read from block 1. Matches the field set
/// spec.md §6 names exactly (`num_blocks, num_data_blocks, num_inodes,
/// num_log_blocks, log_start, inode_start, bitmap_start`), plus the magic
/// the teacher's version leads with.
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct Superblock {
    pub magic: u32,
    pub num_blocks: u32,
    pub num_data_blocks: u32,
    pub num_inodes: u32,
    pub num_log_blocks: u32,
    pub log_start: u32,
    pub inode_start: u32,
    pub bitmap_start: u32,
}

impl Superblock {
    /// Decodes a superblock from a raw block buffer, rejecting anything
    /// that doesn't carry the mkfs magic. A bad magic is a corruption /
    /// invariant violation per spec.md §7, but since it's detected before
    /// the filesystem does anything else, `mount` gets the chance to
    /// report it as an ordinary error instead of panicking mid-boot.
    pub fn decode(block: &[u8; BSIZE]) -> Result<Self> {
        let sb = Superblock::read_from_prefix(&block[..]).ok_or(KernelError::InvalidArgument)?;
        if sb.magic != FSMAGIC {
            return Err(KernelError::InvalidArgument);
        }
        Ok(sb)
    }

    pub fn encode(&self, block: &mut [u8; BSIZE]) {
        block[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
    }

    /// Inodes per block, fixed by `sizeof(Dinode)` (spec.md §6:
    /// "`INODE_PER_BLOCK` is fixed by `sizeof(InodeEntry)`").
    pub fn inodes_per_block(&self) -> u32 {
        INODE_PER_BLOCK as u32
    }

    /// Bits per bitmap block.
    pub fn bits_per_block(&self) -> u32 {
        (BSIZE * 8) as u32
    }

    /// Block holding inode `inum`'s on-disk entry.
    pub fn iblock(&self, inum: u32) -> u32 {
        self.inode_start + inum / self.inodes_per_block()
    }

    /// Bitmap block covering data block `bno`.
    pub fn bblock(&self, bno: u32) -> u32 {
        self.bitmap_start + bno / self.bits_per_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            magic: FSMAGIC,
            num_blocks: 1000,
            num_data_blocks: 908,
            num_inodes: 200,
            num_log_blocks: 30,
            log_start: 2,
            inode_start: 32,
            bitmap_start: 57,
        }
    }

    #[test]
    fn round_trips_through_a_block_buffer() {
        let sb = sample();
        let mut block = [0u8; BSIZE];
        sb.encode(&mut block);
        let decoded = Superblock::decode(&block).unwrap();
        assert_eq!(decoded.num_inodes, 200);
        assert_eq!(decoded.num_data_blocks, 908);
    }

    #[test]
    fn rejects_bad_magic() {
        let block = [0u8; BSIZE];
        assert_eq!(Superblock::decode(&block), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn iblock_and_bblock_advance_by_block() {
        let sb = sample();
        let per_block = sb.inodes_per_block();
        assert_eq!(sb.iblock(0), sb.inode_start);
        assert_eq!(sb.iblock(per_block), sb.inode_start + 1);
        let bits = sb.bits_per_block();
        assert_eq!(sb.bblock(0), sb.bitmap_start);
        assert_eq!(sb.bblock(bits), sb.bitmap_start + 1);
    }
}
