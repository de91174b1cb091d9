//! Memory management: physical pages, the slab allocator, page tables, and
//! per-process address spaces (spec.md §3, §4).

pub mod addrspace;
pub mod page;
pub mod pagetable;
pub mod slab;

pub use addrspace::{AddressSpace, PageSource, Section, SectionKind};
pub use page::{PageAllocator, PageFrame};
pub use pagetable::{PageTable, PteFlags};
pub use slab::{SlabAllocator, SlabHandle};
