//! Hardware abstraction: the external collaborators spec.md §1 puts out of
//! scope (block device I/O, timer ticks, page faults) are modeled as traits
//! instead of bare-metal drivers. `kernel-rs/src/virtio_disk.rs` and
//! `kernel-rs/src/arch/arm/trap.rs` are the teacher's concrete
//! implementations of the same two roles; this crate only needs their
//! contract.

use crate::param::BSIZE;

/// A synchronous block device: `read`/`write` a single `BSIZE`-byte block.
/// Partition 2 of an MBR holds the filesystem and the superblock lives at
/// `lba_start_of_partition_2 + 1` (spec.md §6); this crate is handed a
/// device already positioned at the start of that partition, so block 0 is
/// the boot block.
pub trait BlockDevice: Send + Sync {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]);
    fn write(&self, block_no: u32, buf: &[u8; BSIZE]);
}

/// A timer tick delivered to a CPU, driving preemption (spec.md §4.9).
#[derive(Debug, Clone, Copy)]
pub struct TimerTick {
    pub cpu: usize,
}

/// A page fault delivered to a CPU, driving [`crate::mm::addrspace`]'s
/// fault handler (spec.md §4.4). `iss` is the fault syndrome register value
/// an AArch64 trap would carry; this crate only inspects whether the fault
/// was a write.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub pid: i32,
    pub fault_addr: usize,
    pub is_write: bool,
}

/// The trap layer: delivers timer ticks and page faults from outside the
/// crate. A real embedder wires this to GIC/trap-vector code; tests wire it
/// to a synthetic source.
pub trait TrapSource: Send + Sync {
    fn next_timer_tick(&self) -> Option<TimerTick>;
    fn next_page_fault(&self) -> Option<PageFault>;
}

/// An in-memory [`BlockDevice`] used by tests and by any embedder that
/// wants a RAM disk. Not part of the spec; exists purely to make the
/// filesystem testable without real hardware.
pub struct MemBlockDevice {
    blocks: std::sync::Mutex<Vec<[u8; BSIZE]>>,
}

impl MemBlockDevice {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: std::sync::Mutex::new(vec![[0u8; BSIZE]; num_blocks]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[block_no as usize]);
    }

    fn write(&self, block_no: u32, buf: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[block_no as usize].copy_from_slice(buf);
    }
}
