//! Four-level AArch64-style page tables.
//!
//! Grounded on `kernel-rs/src/vm.rs`'s `PageTable<A>`/`RawPageTable`/
//! `PageTableEntry` (walk down `PXMASK`-masked indices, allocating
//! intermediate tables on demand) and `kernel-rs/src/arch/arm/vm.rs`'s
//! `PteFlags` (valid/table/AP/UXN/PXN bits). The teacher targets a live
//! MMU and keeps `RawPageTable` behind a raw pointer into physical memory
//! it owns outright; since the MMU itself is out of scope here (spec.md
//! §1), this module instead walks tables as pages inside
//! [`crate::mm::page::PageAllocator`], addressed by [`PageFrame`] and
//! mutated through `with_bytes`. The walk structure (index by 9-bit
//! chunks of the virtual address, allocate-on-demand, `free_walk`
//! recursion on drop) is unchanged from the teacher.

use bitflags::bitflags;

use crate::mm::page::{PageAllocator, PageFrame};
use crate::param::PAGE;

/// Entries per table level: a 4 KB page of 8-byte PTEs.
const PTES_PER_TABLE: usize = PAGE / 8;
/// Number of 9-bit index levels between the root and a leaf PTE.
const LEVELS: usize = 4;
const PX_BITS: usize = 9;
const PX_MASK: usize = (1 << PX_BITS) - 1;

bitflags! {
    /// Mirrors `kernel-rs/src/arch/arm/vm.rs`'s `PteFlags`, trimmed to the
    /// bits this crate's software walk actually interprets (no physical
    /// `NON_SECURE_PA`/`MEM_ATTR_IDX_*` bits; there is no real memory
    /// controller to program).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID  = 1 << 0;
        /// Set on table descriptors; clear on leaf (data) descriptors.
        const TABLE  = 1 << 1;
        const READ   = 1 << 2;
        const WRITE  = 1 << 3;
        const EXEC   = 1 << 4;
        const USER   = 1 << 5;
        /// Software bit: page is copy-on-write. A write fault on a page
        /// with this bit set triggers `AddressSpace`'s COW break
        /// (spec.md §4.4) instead of a segfault.
        const COW    = 1 << 6;
    }
}

fn px(va: usize, level: usize) -> usize {
    (va >> (12 + level * PX_BITS)) & PX_MASK
}

fn decode(raw: u64) -> (PteFlags, PageFrame) {
    let flags = PteFlags::from_bits_truncate(raw & 0x7f);
    let frame = PageFrame((raw >> 12) as usize);
    (flags, frame)
}

fn encode(flags: PteFlags, frame: PageFrame) -> u64 {
    ((frame.0 as u64) << 12) | flags.bits()
}

fn read_entry(alloc: &PageAllocator, table: PageFrame, index: usize) -> u64 {
    alloc.with_bytes(table, |bytes| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
        u64::from_le_bytes(raw)
    })
}

fn write_entry(alloc: &PageAllocator, table: PageFrame, index: usize, value: u64) {
    alloc.with_bytes(table, |bytes| {
        bytes[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    });
}

fn new_table(alloc: &PageAllocator) -> Option<PageFrame> {
    let frame = alloc.alloc_page()?;
    alloc.with_bytes(frame, |bytes| bytes.fill(0));
    Some(frame)
}

/// A process or kernel address space's page table. Root-owning: dropping a
/// `PageTable` recursively frees every table page it owns (leaf data pages
/// are the caller's responsibility, matching the teacher's split between
/// `PageTable::drop`'s `free_walk` and `UserMemory::dealloc`).
pub struct PageTable {
    root: PageFrame,
}

impl PageTable {
    /// Allocates an empty root table.
    pub fn new(alloc: &PageAllocator) -> Option<Self> {
        Some(Self {
            root: new_table(alloc)?,
        })
    }

    pub fn root(&self) -> PageFrame {
        self.root
    }

    /// Walks down to the leaf table containing `va`'s PTE, allocating
    /// intermediate table pages if `create` is set. Returns the leaf
    /// table's frame and the index of `va`'s entry within it.
    fn walk(&self, alloc: &PageAllocator, va: usize, create: bool) -> Option<(PageFrame, usize)> {
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let index = px(va, level);
            let raw = read_entry(alloc, table, index);
            let (flags, next) = decode(raw);
            table = if flags.contains(PteFlags::VALID) {
                assert!(flags.contains(PteFlags::TABLE), "walk: va maps to a leaf above level 0");
                next
            } else {
                if !create {
                    return None;
                }
                let child = new_table(alloc)?;
                write_entry(alloc, table, index, encode(PteFlags::VALID | PteFlags::TABLE, child));
                child
            };
        }
        Some((table, px(va, 0)))
    }

    /// Looks up `va`'s mapping without allocating.
    pub fn lookup(&self, alloc: &PageAllocator, va: usize) -> Option<(PteFlags, PageFrame)> {
        let (table, index) = self.walk(alloc, va, false)?;
        let raw = read_entry(alloc, table, index);
        let (flags, frame) = decode(raw);
        flags.contains(PteFlags::VALID).then_some((flags, frame))
    }

    /// Maps `va` to `frame` with `flags`, allocating intermediate tables as
    /// needed. `va` must not already be mapped (mirrors
    /// `PageTable::insert`'s `assert!(!pte.is_valid())`).
    pub fn map(&mut self, alloc: &PageAllocator, va: usize, frame: PageFrame, flags: PteFlags) -> Option<()> {
        let (table, index) = self.walk(alloc, va, true)?;
        let raw = read_entry(alloc, table, index);
        assert!(!decode(raw).0.contains(PteFlags::VALID), "map: va {va:#x} already mapped");
        write_entry(alloc, table, index, encode(flags | PteFlags::VALID, frame));
        Some(())
    }

    /// Overwrites an existing mapping's flags and/or target frame.
    pub fn remap(&mut self, alloc: &PageAllocator, va: usize, frame: PageFrame, flags: PteFlags) {
        let (table, index) = self.walk(alloc, va, false).expect("remap: va not mapped");
        write_entry(alloc, table, index, encode(flags | PteFlags::VALID, frame));
    }

    /// Removes `va`'s mapping and returns the physical frame it pointed at.
    pub fn unmap(&mut self, alloc: &PageAllocator, va: usize) -> Option<PageFrame> {
        let (table, index) = self.walk(alloc, va, false)?;
        let raw = read_entry(alloc, table, index);
        let (flags, frame) = decode(raw);
        if !flags.contains(PteFlags::VALID) {
            return None;
        }
        write_entry(alloc, table, index, 0);
        Some(frame)
    }

    /// Recursively frees every table page reachable from `table`, mirroring
    /// `RawPageTable::free_walk`. Leaf data pages are left untouched; the
    /// caller (`AddressSpace`) owns their refcounts.
    fn free_walk(alloc: &PageAllocator, table: PageFrame, level: usize) {
        if level > 0 {
            for index in 0..PTES_PER_TABLE {
                let raw = read_entry(alloc, table, index);
                let (flags, child) = decode(raw);
                if flags.contains(PteFlags::VALID) && flags.contains(PteFlags::TABLE) {
                    Self::free_walk(alloc, child, level - 1);
                }
            }
        }
        alloc.free_page(table);
    }
}

/// Frees a page table's own table pages. Must be called explicitly rather
/// than via `Drop` because it needs `&PageAllocator`, which a `PageTable`
/// does not own (mirrors `AddressSpace::drop` driving `PageTable::drop` in
/// the teacher, collapsed into one explicit call here).
pub fn free_page_table(alloc: &PageAllocator, pt: PageTable) {
    PageTable::free_walk(alloc, pt.root, LEVELS - 1);
}
