//! Compile-time kernel configuration.
//!
//! A kernel has no runtime configuration file; this module is its
//! configuration layer, exactly as in the teacher's own `param.rs`.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 4;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;

/// Maximum number of cached blocks.
pub const NBUF: usize = 64;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Page / block size in bytes (spec.md §3: "PAGE = 4096 bytes").
pub const PAGE: usize = 4096;
pub const BSIZE: usize = PAGE;

/// Max number of block writes any single atomic operation may perform.
pub const OP_MAX_BLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOG_MAX: usize = OP_MAX_BLOCKS * 3;

/// Maximum file path length.
pub const MAXPATH: usize = 128;

/// Maximum length of a process name.
pub const MAXPROCNAME: usize = 16;

/// Direct block pointers per inode (spec.md §6).
pub const NDIRECT: usize = 12;

/// Entries in the single indirect block (spec.md §6: "128 u32s").
pub const NINDIRECT: usize = BSIZE / 4;

/// Largest file size expressible by an inode, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Directory entry name length (spec.md §6).
pub const DIRSIZ: usize = 14;

/// Size in bytes of one on-disk inode entry (`fs::inode::Dinode`): 2-byte
/// type/major/minor/nlink, 4-byte size, 12 4-byte direct pointers, one
/// 4-byte indirect pointer, rounded up to a clean power of two.
pub const DINODE_SIZE: usize = 64;

/// Number of inode entries per on-disk inode block.
pub const INODE_PER_BLOCK: usize = BSIZE / DINODE_SIZE;

/// Number of virtual pages the default user stack section spans
/// (spec.md §4.4: "including a stack section in execve 32 pages below
/// USERTOP").
pub const USTACK_PAGES: usize = 32;

/// Top of user address space. Anything at or above this is kernel space and
/// is rejected by the page-fault handler (spec.md §4.4).
pub const USERTOP: usize = 0x0000_8000_0000_0000;

/// Minimum stack guard: faults below this (but still user-space) addresses
/// are rejected rather than grown (spec.md §4.4).
pub const STACK_GUARD: usize = PAGE;

/// Scheduler quantum, in simulated timer ticks (spec.md §4.9: "ELAPSE
/// ticks").
pub const ELAPSE: u64 = 10;

/// Root inode number (spec.md §3).
pub const ROOTINO: u32 = 1;
