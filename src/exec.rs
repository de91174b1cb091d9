//! The `execve` contract with the memory subsystem (spec.md §4.10,
//! component C10): load an ELF image's loadable segments into a fresh
//! address space and lay out argv/envp on a new stack. Parsing minutiae and
//! a real userspace are explicitly out of scope (spec.md §1's "only the
//! `execve` contract with the memory subsystem is specified"), so this
//! module stops at handing back the image — the syscall layer installs it.
//!
//! Grounded on `kernel-rs/src/exec.rs`'s `ElfHdr`/`ProgHdr` (a simplified,
//! machine-width on-disk layout rather than a full ELF64 header — the
//! teacher's own comment notes this is deliberately not spec-complete ELF)
//! and its `scopeguard`-driven cleanup: `ip`/`mem` are wrapped so an early
//! `?` return always releases the inode and frees a partially built address
//! space, the same shape as `kernel-rs/src/fs/ufs/mod.rs`'s create/unlink
//! paths.

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{KernelError, Result};
use crate::fs::inode::{DInodeType, Inode, InodeFile};
use crate::fs::FileSystem;
use crate::mm::addrspace::PageSource;
use crate::mm::page::PageAllocator;
use crate::mm::pagetable::PteFlags;
use crate::mm::AddressSpace;
use crate::param::{MAXARG, PAGE, USERTOP, USTACK_PAGES};

const ELF_MAGIC: u32 = 0x464c_457f;
const ELF_PROG_LOAD: u32 = 1;

const PF_EXEC: u32 = 1;
const PF_WRITE: u32 = 2;
const PF_READ: u32 = 4;

/// On-disk ELF file header, trimmed to the fields this loader reads.
#[derive(Default, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct ElfHdr {
    magic: u32,
    elf: [u8; 12],
    typ: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

impl ElfHdr {
    fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
    }
}

/// On-disk ELF program header.
#[derive(Default, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct ProgHdr {
    typ: u32,
    flags: u32,
    off: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ProgHdr {
    fn is_prog_load(&self) -> bool {
        self.typ == ELF_PROG_LOAD
    }
}

/// What a successful `exec` hands back for the caller (the syscall layer) to
/// install on the process: a fully built address space plus the entry point
/// and stack pointer that would seed a trap frame, if this kernel modeled
/// one (spec.md §9's std-thread license means it doesn't — see `DESIGN.md`).
pub struct ExecImage {
    pub address_space: AddressSpace,
    pub entry: usize,
    pub sp: usize,
    pub argc: usize,
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Loads `path` as an ELF image into a fresh address space (spec.md §4.10:
/// "Build a fresh page directory; call the ELF loader to install text/data/
/// bss sections... Create a stack section... Copy argv/envp strings, then
/// pointer arrays and argc, onto the stack, 16-byte aligned"). Leaves the
/// caller's current address space untouched; the syscall layer swaps the
/// returned one in only once this returns `Ok`.
pub fn exec(
    fs: &FileSystem,
    alloc: &PageAllocator,
    cwd: &Inode,
    path: &[u8],
    argv: &[&[u8]],
    envp: &[&[u8]],
) -> Result<ExecImage> {
    if argv.len() + envp.len() > MAXARG {
        return Err(KernelError::InvalidArgument);
    }

    let ip = fs.resolve(cwd, path)?;
    let ip = scopeguard::guard(ip, |ip| fs.itable.put(&fs.bcache, &fs.log, &fs.bitmap, ip));

    let inode_guard = fs.itable.lock(&fs.bcache, *ip);
    if inode_guard.kind != DInodeType::File {
        return Err(KernelError::InvalidArgument);
    }

    let mut header_bytes = [0u8; std::mem::size_of::<ElfHdr>()];
    fs.itable.read(&fs.bcache, *ip, &mut header_bytes, 0)?;
    let header = ElfHdr::read_from(&header_bytes[..]).expect("fixed-size buffer matches ElfHdr layout");
    if !header.is_valid() {
        return Err(KernelError::InvalidArgument);
    }

    let source: Arc<dyn PageSource> = Arc::new(InodeFile::snapshot(fs.bcache.clone(), fs.log.clone(), &inode_guard));

    let space = AddressSpace::new(alloc).ok_or(KernelError::OutOfResources)?;
    let mut space = scopeguard::guard(space, |space| space.destroy(alloc));

    for i in 0..header.phnum as usize {
        let off = header.phoff as usize + i * std::mem::size_of::<ProgHdr>();
        let mut ph_bytes = [0u8; std::mem::size_of::<ProgHdr>()];
        fs.itable.read(&fs.bcache, *ip, &mut ph_bytes, off)?;
        let ph = ProgHdr::read_from(&ph_bytes[..]).expect("fixed-size buffer matches ProgHdr layout");
        if !ph.is_prog_load() {
            continue;
        }
        if ph.memsz < ph.filesz || ph.vaddr as usize % PAGE != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut prot = PteFlags::empty();
        if ph.flags & PF_READ != 0 {
            prot |= PteFlags::READ;
        }
        if ph.flags & PF_WRITE != 0 {
            prot |= PteFlags::WRITE;
        }
        if ph.flags & PF_EXEC != 0 {
            prot |= PteFlags::EXEC;
        }
        let len = round_up(ph.memsz as usize, PAGE);
        space.map_file(ph.vaddr as usize, len, prot, source.clone(), ph.off, false)?;
    }

    drop(inode_guard);

    // Stack section: fixed-size, anonymous, at the very top of user space
    // (spec.md §4.4: "stack section in execve 32 pages below USERTOP").
    let stack_len = USTACK_PAGES * PAGE;
    let stack_start = USERTOP - stack_len;
    space.map_anonymous(stack_start, stack_len, PteFlags::READ | PteFlags::WRITE)?;

    let mut sp = USERTOP;
    let push_string = |space: &mut AddressSpace, sp: &mut usize, s: &[u8]| -> Result<usize> {
        *sp -= s.len() + 1;
        *sp &= !0xf;
        if *sp < stack_start {
            return Err(KernelError::InvalidArgument);
        }
        let mut bytes = s.to_vec();
        bytes.push(0);
        space.copy_out(alloc, *sp, &bytes)?;
        Ok(*sp)
    };

    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        envp_ptrs.push(push_string(&mut space, &mut sp, s)?);
    }
    envp_ptrs.reverse();

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        argv_ptrs.push(push_string(&mut space, &mut sp, s)?);
    }
    argv_ptrs.reverse();

    let push_pointer_array = |space: &mut AddressSpace, sp: &mut usize, ptrs: &[usize]| -> Result<()> {
        *sp -= (ptrs.len() + 1) * 8;
        *sp &= !0xf;
        if *sp < stack_start {
            return Err(KernelError::InvalidArgument);
        }
        for (i, &p) in ptrs.iter().enumerate() {
            space.copy_out(alloc, *sp + i * 8, &(p as u64).to_le_bytes())?;
        }
        space.copy_out(alloc, *sp + ptrs.len() * 8, &0u64.to_le_bytes())?;
        Ok(())
    };

    push_pointer_array(&mut space, &mut sp, &envp_ptrs)?;
    push_pointer_array(&mut space, &mut sp, &argv_ptrs)?;

    let argc = argv.len();
    let entry = header.entry as usize;
    let space = scopeguard::ScopeGuard::into_inner(space);
    Ok(ExecImage { address_space: space, entry, sp, argc })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::dir;
    use crate::fs::inode::DInodeType;
    use crate::fs::superblock::{Superblock, FSMAGIC};
    use crate::hal::MemBlockDevice;
    use crate::mm::page::PageAllocator;
    use crate::param::ROOTINO;
    use std::sync::Arc as StdArc;

    fn fixture() -> (FileSystem, PageAllocator) {
        let device: StdArc<dyn crate::hal::BlockDevice> = StdArc::new(MemBlockDevice::new(400));
        let sb = Superblock {
            magic: FSMAGIC,
            num_blocks: 400,
            num_data_blocks: 300,
            num_inodes: 60,
            num_log_blocks: 31,
            log_start: 2,
            inode_start: 33,
            bitmap_start: 40,
        };
        let mut sb_block = [0u8; crate::param::BSIZE];
        sb.encode(&mut sb_block);
        device.write(1, &sb_block);

        let mut root_inode_block = [0u8; crate::param::BSIZE];
        let offset = (ROOTINO as usize % sb.inodes_per_block() as usize) * crate::param::DINODE_SIZE;
        root_inode_block[offset] = DInodeType::Dir as u8;
        root_inode_block[offset + 6] = 1;
        device.write(sb.iblock(ROOTINO), &root_inode_block);

        let fs = FileSystem::mount(device).expect("pre-formatted root inode should mount cleanly");
        (fs, PageAllocator::new(4096))
    }

    fn write_elf(fs: &FileSystem, entry: u64, segments: &[(u64, &[u8])]) -> Inode {
        fs.log.begin_op(1).unwrap();
        let ip = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::File);
        {
            let mut g = fs.itable.lock(&fs.bcache, ip);
            g.nlink = 1;
            fs.itable.update(&fs.bcache, &fs.log, ip, &g);
        }

        let phoff = std::mem::size_of::<ElfHdr>() as u64;
        let phentsize = std::mem::size_of::<ProgHdr>() as u64;
        let data_off = phoff + phentsize * segments.len() as u64;

        let header = ElfHdr {
            magic: ELF_MAGIC,
            entry,
            phoff,
            phnum: segments.len() as u16,
            ..Default::default()
        };
        fs.itable.write(&fs.bcache, &fs.log, &fs.bitmap, ip, header.as_bytes(), 0).unwrap();

        let mut cursor = data_off;
        for (i, (vaddr, data)) in segments.iter().enumerate() {
            let ph = ProgHdr {
                typ: ELF_PROG_LOAD,
                flags: PF_READ | PF_WRITE,
                off: cursor,
                vaddr: *vaddr,
                paddr: 0,
                filesz: data.len() as u64,
                memsz: data.len() as u64,
                align: PAGE as u64,
            };
            fs.itable
                .write(&fs.bcache, &fs.log, &fs.bitmap, ip, ph.as_bytes(), (phoff + i as u64 * phentsize) as usize)
                .unwrap();
            fs.itable.write(&fs.bcache, &fs.log, &fs.bitmap, ip, data, cursor as usize).unwrap();
            cursor += data.len() as u64;
        }
        fs.log.end_op(1);
        ip
    }

    #[test]
    fn loads_segments_and_builds_a_stack_with_argv_envp() {
        let (fs, alloc) = fixture();
        let root = fs.root();
        let segment_data = vec![0x90u8; PAGE];
        let ip = write_elf(&fs, 0x1000, &[(0x1000, &segment_data)]);
        fs.log.begin_op(1).unwrap();
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, root, b"prog", ip.inum).unwrap();
        fs.log.end_op(1);

        let image = exec(&fs, &alloc, &root, b"/prog", &[b"prog", b"arg1"], &[b"TEST=1"]).unwrap();
        assert_eq!(image.entry, 0x1000);
        assert_eq!(image.argc, 2);
        assert_eq!(image.sp % 16, 0);
        assert!(image.sp < USERTOP);
        assert!(image.sp >= USERTOP - USTACK_PAGES * PAGE);

        image.address_space.destroy(&alloc);
    }

    #[test]
    fn rejects_an_image_without_the_elf_magic() {
        let (fs, alloc) = fixture();
        let root = fs.root();
        fs.log.begin_op(1).unwrap();
        let ip = fs.itable.alloc(&fs.bcache, &fs.log, DInodeType::File);
        {
            let mut g = fs.itable.lock(&fs.bcache, ip);
            g.nlink = 1;
            fs.itable.update(&fs.bcache, &fs.log, ip, &g);
        }
        fs.itable.write(&fs.bcache, &fs.log, &fs.bitmap, ip, b"not an elf file padding....", 0).unwrap();
        fs.log.end_op(1);
        fs.log.begin_op(1).unwrap();
        dir::insert(&fs.bcache, &fs.log, &fs.bitmap, &fs.itable, root, b"junk", ip.inum).unwrap();
        fs.log.end_op(1);

        match exec(&fs, &alloc, &root, b"/junk", &[], &[]) {
            Err(KernelError::InvalidArgument) => {}
            other => panic!("expected InvalidArgument, got {}", other.is_ok()),
        }
    }

    #[test]
    fn too_many_arguments_is_rejected_before_touching_the_disk() {
        let (fs, alloc) = fixture();
        let root = fs.root();
        let many: Vec<&[u8]> = vec![b"x"; MAXARG + 1];
        match exec(&fs, &alloc, &root, b"/missing", &many, &[]) {
            Err(KernelError::InvalidArgument) => {}
            other => panic!("expected InvalidArgument, got {}", other.is_ok()),
        }
    }
}
