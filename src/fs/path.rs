//! Path resolution (spec.md §4.6: `namex`/`skipelem`).
//!
//! Grounded on `kernel-rs/src/fs/ufs/inode.rs`'s `Itable::namex`: splits the
//! path into components one at a time, looks each up in the current
//! directory, and switches to the next inode, stopping one level early when
//! the caller wants the parent of the final component.

use super::dir;
use super::inode::{DInodeType, Inode};
use super::FileSystem;
use crate::error::{KernelError, Result};
use crate::param::DIRSIZ;

/// Splits the next `/`-separated component off the front of `path`.
/// Returns `(component, rest)`, skipping any leading/repeated slashes.
/// Mirrors `skipelem`.
fn skipelem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut p = path;
    while p.first() == Some(&b'/') {
        p = &p[1..];
    }
    if p.is_empty() {
        return None;
    }
    let end = p.iter().position(|&b| b == b'/').unwrap_or(p.len());
    let (elem, rest) = p.split_at(end);
    Some((&elem[..elem.len().min(DIRSIZ)], rest))
}

/// Resolves `path` to an inode, starting from `cwd` unless `path` is
/// `/`-anchored (spec.md §4.6).
pub fn namei(fs: &FileSystem, cwd: &Inode, path: &[u8]) -> Result<Inode> {
    namex(fs, cwd, path, false).map(|(ip, _)| ip)
}

/// Resolves all but the last component of `path`, returning the parent
/// directory inode and the final component's name.
pub fn nameiparent<'p>(fs: &FileSystem, cwd: &Inode, path: &'p [u8]) -> Result<(Inode, &'p [u8])> {
    let (ip, name) = namex(fs, cwd, path, true)?;
    Ok((ip, name.expect("wantparent always yields a final component")))
}

fn namex<'p>(fs: &FileSystem, cwd: &Inode, path: &'p [u8], wantparent: bool) -> Result<(Inode, Option<&'p [u8]>)> {
    let mut ip = if path.first() == Some(&b'/') {
        fs.root()
    } else {
        fs.itable.dup(*cwd)
    };

    let mut rest = path;
    loop {
        let Some((elem, next_rest)) = skipelem(rest) else {
            if wantparent {
                fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, ip);
                return Err(KernelError::InvalidArgument);
            }
            return Ok((ip, None));
        };

        {
            let guard = fs.itable.lock(&fs.bcache, ip);
            if guard.kind != DInodeType::Dir {
                drop(guard);
                fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, ip);
                return Err(KernelError::NotADirectory);
            }
        }

        if wantparent && skipelem(next_rest).is_none() {
            return Ok((ip, Some(elem)));
        }

        let found = dir::lookup(&fs.bcache, &fs.itable, ip, elem);
        fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, ip);
        let (inum, _) = found.ok_or(KernelError::NotFound)?;
        ip = fs.itable.get(&fs.bcache, inum);
        rest = next_rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::DInodeType;
    use crate::fs::superblock::{Superblock, FSMAGIC};
    use crate::hal::MemBlockDevice;
    use crate::param::ROOTINO;
    use std::sync::Arc;

    /// A freshly "mkfs'd" image has to have its root inode pre-formatted as
    /// a directory before `mount` will accept it (spec.md §7: an
    /// unformatted root is a panic, not a mountable state). Since this
    /// crate has no `mkfs` tool (out of scope), tests lay down that one
    /// on-disk inode entry by hand.
    fn fixture() -> FileSystem {
        let device: Arc<dyn crate::hal::BlockDevice> = Arc::new(MemBlockDevice::new(200));
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
        let mut sb_block = [0u8; crate::param::BSIZE];
        sb.encode(&mut sb_block);
        device.write(1, &sb_block);

        let mut root_inode_block = [0u8; crate::param::BSIZE];
        let offset = (ROOTINO as usize % sb.inodes_per_block() as usize) * crate::param::DINODE_SIZE;
        root_inode_block[offset] = DInodeType::Dir as u8; // kind: u16 little-endian, low byte
        root_inode_block[offset + 6] = 1; // nlink: u16 little-endian low byte
        device.write(sb.iblock(ROOTINO), &root_inode_block);

        FileSystem::mount(device).expect("pre-formatted root inode should mount cleanly")
    }

    #[test]
    fn skipelem_splits_and_skips_leading_slashes() {
        assert_eq!(skipelem(b"/a/bb"), Some((&b"a"[..], &b"/bb"[..])));
        assert_eq!(skipelem(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skipelem(b"/"), None);
        assert_eq!(skipelem(b""), None);
    }

    #[test]
    fn namei_resolves_nested_paths() {
        let fs = fixture();
        let root = fs.root();
        fs.log.begin_op(1).unwrap();
        let sub = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::Dir);
        {
            let mut g = fs.itable.lock(&fs.bcache, sub);
            g.nlink = 1;
            fs.itable.update(&fs.bcache, &fs.log, sub, &g);
        }
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, root, b"sub", sub.inum).unwrap();
        let file = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::File);
        {
            let mut g = fs.itable.lock(&fs.bcache, file);
            g.nlink = 1;
            fs.itable.update(&fs.bcache, &fs.log, file, &g);
        }
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, sub, b"leaf.txt", file.inum).unwrap();
        fs.log.end_op(1);

        let resolved = namei(&fs, &root, b"/sub/leaf.txt").unwrap();
        assert_eq!(resolved.inum, file.inum);

        let (parent, name) = nameiparent(&fs, &root, b"/sub/leaf.txt").unwrap();
        assert_eq!(parent.inum, sub.inum);
        assert_eq!(name, b"leaf.txt");
    }
}
