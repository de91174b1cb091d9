//! A process's virtual address space: a page table plus the sections that
//! describe what backs each mapped range, and the page-fault handler that
//! makes lazy/COW/swapped-out mappings actually work.
//!
//! Grounded on `kernel-rs/src/vm.rs`'s `UserMemory` (`clone` does the
//! per-page copy for fork, `alloc`/`dealloc`/`resize` grow and shrink,
//! `copy_in`/`copy_out`/`copy_in_str` cross the user/kernel boundary). The
//! teacher's `UserMemory` eagerly copies every page on fork and has no
//! notion of a "section" — its only growth axis is one contiguous
//! brk-style region. spec.md §4.4 calls for a real section list (stack,
//! heap, mmap'd file, anonymous mmap) each independently lazy/COW/evictable,
//! so `AddressSpace` replaces the single `size: usize` with
//! `sections: Vec<Section>` and replaces eager-copy fork with the COW
//! sharing `break_cow` undoes on the first write.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::mm::page::{PageAllocator, PageFrame};
use crate::mm::pagetable::{PageTable, PteFlags};
use crate::param::{PAGE, USERTOP};

/// Supplies page contents for a file-backed section, read lazily on first
/// fault. Implemented by `fs::inode::Inode` in the full kernel; a plain
/// in-memory buffer suffices for tests.
pub trait PageSource: Send + Sync {
    fn fill_page(&self, offset: u64, dst: &mut [u8; PAGE]) -> Result<()>;

    /// Writes a dirty page back to the backing store. Called only for
    /// `MAP_SHARED` sections opened writable (spec.md §6's `munmap`
    /// writeback). Sources with no backing store to write to (an
    /// executable's ELF segments during `execve`, an anonymous mapping)
    /// never have a writable `File` section built over them, so the
    /// default no-op is never exercised for those.
    fn writeback(&self, _offset: u64, _bytes: &[u8; PAGE]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum SectionKind {
    /// Zero-fill-on-demand memory with no backing store (heap, stack,
    /// anonymous `mmap`).
    Anonymous,
    /// Backed by a [`PageSource`] (a `mmap`ed file, or an executable's
    /// loadable ELF segment during `execve`).
    File(Arc<dyn PageSource>),
}

#[derive(Clone)]
pub struct Section {
    pub start: usize,
    pub end: usize,
    pub prot: PteFlags,
    pub kind: SectionKind,
    pub file_offset: u64,
    /// `MAP_SHARED` (spec.md §4.4, §6): physical pages are shared across
    /// `fork` rather than converted to COW, and dirty pages are written
    /// back through `source` on `munmap` instead of being silently
    /// discarded. Always `false` for [`SectionKind::Anonymous`] and for
    /// `execve`'s own loadable segments.
    pub shared: bool,
}

impl Section {
    fn contains(&self, va: usize) -> bool {
        va >= self.start && va < self.end
    }
}

/// A process address space: one page table plus the sections describing
/// what each range means. `swapped_out` holds pages evicted by
/// [`AddressSpace::evict`]; their physical frame has been freed and their
/// content lives in `swap` until the next fault brings them back.
pub struct AddressSpace {
    page_table: PageTable,
    sections: Vec<Section>,
    swap: Vec<Option<[u8; PAGE]>>,
    swapped_out: HashMap<usize, usize>,
}

impl AddressSpace {
    pub fn new(alloc: &PageAllocator) -> Option<Self> {
        Some(Self {
            page_table: PageTable::new(alloc)?,
            sections: Vec::new(),
            swap: Vec::new(),
            swapped_out: HashMap::new(),
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn section_containing(&self, va: usize) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(va))
    }

    fn overlaps_existing(&self, start: usize, end: usize) -> bool {
        self.sections.iter().any(|s| start < s.end && s.start < end)
    }

    /// Reserves `[start, start+len)` as zero-fill-on-demand memory. No
    /// pages are actually mapped until the first fault.
    pub fn map_anonymous(&mut self, start: usize, len: usize, prot: PteFlags) -> Result<()> {
        let end = start + len;
        if end > USERTOP || self.overlaps_existing(start, end) {
            return Err(KernelError::InvalidArgument);
        }
        self.sections.push(Section {
            start,
            end,
            prot,
            kind: SectionKind::Anonymous,
            file_offset: 0,
            shared: false,
        });
        Ok(())
    }

    /// Reserves `[start, start+len)` as lazily loaded from `source` starting
    /// at `file_offset`. Used both by `mmap(2)` and by `execve`'s segment
    /// loading (spec.md §4.4, §4.10). `shared` is `mmap`'s `MAP_SHARED` flag;
    /// `execve`'s own segments always pass `false`, since they are never
    /// written back.
    pub fn map_file(
        &mut self,
        start: usize,
        len: usize,
        prot: PteFlags,
        source: Arc<dyn PageSource>,
        file_offset: u64,
        shared: bool,
    ) -> Result<()> {
        let end = start + len;
        if end > USERTOP || self.overlaps_existing(start, end) {
            return Err(KernelError::InvalidArgument);
        }
        self.sections.push(Section {
            start,
            end,
            prot,
            kind: SectionKind::File(source),
            file_offset,
            shared,
        });
        Ok(())
    }

    /// Calls [`PageSource::writeback`] for every currently-mapped page in
    /// `[start, start+len)` that belongs to a writable `MAP_SHARED`
    /// file-backed section — `munmap`'s dirty-page writeback (spec.md §6:
    /// "for `MAP_SHARED` writes dirty pages back through the inode").
    /// `MAP_PRIVATE` sections must never be written back (spec.md line 272),
    /// so non-`shared` and anonymous pages are skipped; the syscall layer
    /// calls this before [`Self::unmap`] so the pages are still mapped.
    pub fn writeback_shared(&self, alloc: &PageAllocator, start: usize, len: usize) -> Result<()> {
        let end = start + len;
        let mut va = start;
        while va < end {
            if let Some(section) = self.section_containing(va) {
                if let SectionKind::File(source) = &section.kind {
                    if section.shared && section.prot.contains(PteFlags::WRITE) {
                        if let Some((_, frame)) = self.page_table.lookup(alloc, va) {
                            let file_off = section.file_offset + (va - section.start) as u64;
                            alloc.with_bytes(frame, |bytes| source.writeback(file_off, bytes))?;
                        }
                    }
                }
            }
            va += PAGE;
        }
        Ok(())
    }

    /// Unmaps `[start, start+len)`, freeing every page currently mapped in
    /// that range and dropping the covering section(s)' bounds to match.
    pub fn unmap(&mut self, alloc: &PageAllocator, start: usize, len: usize) -> Result<()> {
        let end = start + len;
        let mut va = start;
        while va < end {
            if let Some(frame) = self.page_table.unmap(alloc, va) {
                alloc.free_page(frame);
            }
            self.swapped_out.remove(&va);
            va += PAGE;
        }
        self.sections.retain_mut(|s| {
            if s.end <= start || s.start >= end {
                return true;
            }
            if s.start < start {
                s.end = start;
                true
            } else if s.end > end {
                s.start = end;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Moves the page at `va` out of physical memory into the in-process
    /// swap area, freeing its frame. Not part of any real spec'd syscall;
    /// exists so the fault handler's swap-in path (spec.md §4.4's "swap"
    /// case) is actually exercisable without a real memory-pressure daemon.
    pub fn evict(&mut self, alloc: &PageAllocator, va: usize) -> Result<()> {
        let va = va & !(PAGE - 1);
        let frame = self.page_table.unmap(alloc, va).ok_or(KernelError::NotFound)?;
        let mut bytes = [0u8; PAGE];
        alloc.read(frame, &mut bytes);
        alloc.free_page(frame);
        let slot = match self.swap.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.swap.push(None);
                self.swap.len() - 1
            }
        };
        self.swap[slot] = Some(bytes);
        self.swapped_out.insert(va, slot);
        Ok(())
    }

    /// Handles a page fault at `fault_addr`. Dispatches, in order: a
    /// swapped-out page (bring it back in), a COW write fault on an
    /// existing mapping (break the sharing), or a not-yet-mapped address
    /// inside a section (populate it lazily per its kind).
    pub fn handle_fault(&mut self, alloc: &PageAllocator, fault_addr: usize, is_write: bool) -> Result<()> {
        let va = fault_addr & !(PAGE - 1);
        if va >= USERTOP {
            return Err(KernelError::InvalidArgument);
        }

        if let Some(slot) = self.swapped_out.remove(&va) {
            let bytes = self.swap[slot].take().expect("swap slot double-freed");
            let frame = alloc.alloc_page().ok_or(KernelError::OutOfResources)?;
            alloc.write(frame, &bytes);
            let prot = self.section_containing(va).ok_or(KernelError::InvalidArgument)?.prot;
            self.page_table
                .map(alloc, va, frame, prot | PteFlags::USER)
                .ok_or(KernelError::OutOfResources)?;
            return Ok(());
        }

        if let Some((flags, frame)) = self.page_table.lookup(alloc, va) {
            if is_write && flags.contains(PteFlags::COW) {
                return self.break_cow(alloc, va, flags, frame);
            }
            if is_write && !flags.contains(PteFlags::WRITE) {
                return Err(KernelError::PermissionDenied);
            }
            return Ok(());
        }

        let section = self
            .section_containing(va)
            .ok_or(KernelError::InvalidArgument)?
            .clone();
        if is_write && !section.prot.contains(PteFlags::WRITE) {
            return Err(KernelError::PermissionDenied);
        }
        match &section.kind {
            SectionKind::Anonymous => {
                if is_write {
                    let frame = alloc.alloc_page().ok_or(KernelError::OutOfResources)?;
                    alloc.with_bytes(frame, |b| b.fill(0));
                    self.page_table
                        .map(alloc, va, frame, section.prot | PteFlags::USER)
                        .ok_or(KernelError::OutOfResources)?;
                } else {
                    let frame = alloc.zero_page();
                    let read_only = (section.prot - PteFlags::WRITE) | PteFlags::USER;
                    self.page_table
                        .map(alloc, va, frame, read_only)
                        .ok_or(KernelError::OutOfResources)?;
                }
            }
            SectionKind::File(source) => {
                let frame = alloc.alloc_page().ok_or(KernelError::OutOfResources)?;
                let file_off = section.file_offset + (va - section.start) as u64;
                alloc.with_bytes(frame, |buf| source.fill_page(file_off, buf))?;
                self.page_table
                    .map(alloc, va, frame, section.prot | PteFlags::USER)
                    .ok_or(KernelError::OutOfResources)?;
            }
        }
        Ok(())
    }

    fn break_cow(&mut self, alloc: &PageAllocator, va: usize, flags: PteFlags, frame: PageFrame) -> Result<()> {
        let settled = (flags - PteFlags::COW) | PteFlags::WRITE;
        if alloc.refcount(frame) == 1 {
            self.page_table.remap(alloc, va, frame, settled);
            return Ok(());
        }
        let mut bytes = [0u8; PAGE];
        alloc.read(frame, &mut bytes);
        let new_frame = alloc.alloc_page().ok_or(KernelError::OutOfResources)?;
        alloc.write(new_frame, &bytes);
        self.page_table.remap(alloc, va, new_frame, settled);
        alloc.decref(frame);
        Ok(())
    }

    /// Makes a child address space sharing every currently-mapped page with
    /// the parent (spec.md §4.4, §4.10's `fork` contract). Sections backed
    /// by a `MAP_SHARED` mapping keep their physical pages shared outright,
    /// with no COW conversion (spec.md line 91: "shared mmap sections share
    /// physical pages without COW") — writes through either parent or child
    /// are visible to both, same as a real shared mapping. Every other
    /// writable mapping becomes read-only + COW in both parent and child;
    /// the first write on either side breaks the sharing.
    pub fn fork(&mut self, alloc: &PageAllocator) -> Option<AddressSpace> {
        let mut child = AddressSpace::new(alloc)?;
        for section in &self.sections {
            let mut va = section.start;
            while va < section.end {
                if let Some((flags, frame)) = self.page_table.lookup(alloc, va) {
                    let child_flags = if !section.shared && flags.contains(PteFlags::WRITE) {
                        let cow = (flags - PteFlags::WRITE) | PteFlags::COW;
                        self.page_table.remap(alloc, va, frame, cow);
                        cow
                    } else {
                        flags
                    };
                    alloc.incref(frame);
                    child.page_table.map(alloc, va, frame, child_flags)?;
                } else if let Some(&slot) = self.swapped_out.get(&va) {
                    let bytes = self.swap[slot].expect("swap slot missing content");
                    let new_slot = child.swap.len();
                    child.swap.push(Some(bytes));
                    child.swapped_out.insert(va, new_slot);
                }
                va += PAGE;
            }
            child.sections.push(section.clone());
        }
        Some(child)
    }

    /// Copies `src` into user memory at `dst`, faulting in (zero-filled or
    /// file-backed) pages as needed. Mirrors `UserMemory::copy_out_bytes`.
    pub fn copy_out(&mut self, alloc: &PageAllocator, dst: usize, src: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < src.len() {
            let va = dst + off;
            let page_va = va & !(PAGE - 1);
            let page_off = va - page_va;
            if self.page_table.lookup(alloc, page_va).is_none() {
                self.handle_fault(alloc, page_va, true)?;
            }
            let (_, frame) = self.page_table.lookup(alloc, page_va).expect("just faulted in");
            let n = (PAGE - page_off).min(src.len() - off);
            alloc.with_bytes(frame, |bytes| bytes[page_off..page_off + n].copy_from_slice(&src[off..off + n]));
            off += n;
        }
        Ok(())
    }

    /// Copies from user memory at `src` into `dst`. Mirrors
    /// `UserMemory::copy_in_bytes`; unlike `copy_out`, a read from an
    /// unmapped address is a hard error rather than a fault-and-populate,
    /// since there is nothing meaningful to read back.
    pub fn copy_in(&self, alloc: &PageAllocator, dst: &mut [u8], src: usize) -> Result<()> {
        let mut off = 0;
        while off < dst.len() {
            let va = src + off;
            let page_va = va & !(PAGE - 1);
            let page_off = va - page_va;
            let (_, frame) = self.page_table.lookup(alloc, page_va).ok_or(KernelError::InvalidArgument)?;
            let n = (PAGE - page_off).min(dst.len() - off);
            alloc.with_bytes(frame, |bytes| dst[off..off + n].copy_from_slice(&bytes[page_off..page_off + n]));
            off += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user memory into `dst`, stopping
    /// at the first NUL or when `dst` fills. Mirrors
    /// `UserMemory::copy_in_str`.
    pub fn copy_in_str(&self, alloc: &PageAllocator, dst: &mut [u8], src: usize) -> Result<usize> {
        for (i, slot) in dst.iter_mut().enumerate() {
            let va = src + i;
            let page_va = va & !(PAGE - 1);
            let page_off = va - page_va;
            let (_, frame) = self.page_table.lookup(alloc, page_va).ok_or(KernelError::InvalidArgument)?;
            let byte = alloc.with_bytes(frame, |bytes| bytes[page_off]);
            *slot = byte;
            if byte == 0 {
                return Ok(i);
            }
        }
        Err(KernelError::InvalidArgument)
    }

    /// Frees every page this address space still maps and the page table
    /// itself. Explicit rather than `Drop` because it needs `&PageAllocator`.
    pub fn destroy(self, alloc: &PageAllocator) {
        for section in &self.sections {
            let mut va = section.start;
            while va < section.end {
                if let Some((_, frame)) = self.page_table.lookup(alloc, va) {
                    alloc.free_page(frame);
                }
                va += PAGE;
            }
        }
        crate::mm::pagetable::free_page_table(alloc, self.page_table);
    }
}
