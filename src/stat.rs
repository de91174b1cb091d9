//! `fstat`/`newfstatat` result type (spec.md §4.11, §6).
//!
//! Grounded on `kernel-rs/src/fs/stat.rs`'s `Stat`: a plain, `#[repr(C)]`
//! POD copied straight into the caller's buffer by the syscall layer via
//! `AddressSpace::copy_out`.

use zerocopy::AsBytes;

use crate::fs::inode::DInodeType;
use crate::param::ROOTDEV;

/// Mirrors `fs::inode::DInodeType` but as the stable, `#[repr(u16)]` wire
/// value `newfstatat` hands back to user space, so the on-disk enum stays
/// free to be renumbered without breaking the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    Invalid = 0,
    Dir = 1,
    File = 2,
    Device = 3,
}

impl From<DInodeType> for InodeType {
    fn from(kind: DInodeType) -> Self {
        match kind {
            DInodeType::Invalid => InodeType::Invalid,
            DInodeType::Dir => InodeType::Dir,
            DInodeType::File => InodeType::File,
            DInodeType::Device => InodeType::Device,
        }
    }
}

#[derive(Clone, Copy, AsBytes)]
#[repr(C)]
pub struct Stat {
    /// File system's device number. Always [`ROOTDEV`]: this kernel mounts
    /// exactly one device.
    pub dev: u32,
    pub ino: u32,
    pub typ: u16,
    pub nlink: u16,
    _pad: u32,
    pub size: u64,
}

impl Stat {
    pub fn new(ino: u32, kind: DInodeType, nlink: u16, size: u32) -> Self {
        Self {
            dev: ROOTDEV,
            ino,
            typ: InodeType::from(kind) as u16,
            nlink,
            _pad: 0,
            size: size as u64,
        }
    }
}
