//! The top-level `Kernel`: the single struct that owns every subsystem and
//! is handed to the syscall layer (spec.md §3's component list, assembled).
//!
//! Grounded on `kernel-rs/src/kernel.rs`'s `KernelBuilder`/`Kernel` split —
//! one struct bundling the block cache, file table, device table, inode
//! table, and filesystem behind a single handle every other subsystem
//! reaches through. This crate drops the teacher's static
//! `MaybeUninit`/`Pin`-based zero-then-init dance (see `DESIGN.md`'s
//! headline deviation): there is no bare-metal boot stage to initialize
//! into in place, so `Kernel::new` just builds every field directly and
//! returns an owned value the embedder wraps in an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::console::{Console, RawTerminal};
use crate::error::Result;
use crate::file::{Devices, FileTable};
use crate::fs::FileSystem;
use crate::hal::BlockDevice;
use crate::mm::page::PageAllocator;
use crate::proc::scheduler::Scheduler;
use crate::proc::ProcessTable;

/// Major device number the console registers itself under in [`Devices`].
/// Mirrors the teacher's `CONSOLE` constant (`kernel-rs/src/file.rs`).
pub const CONSOLE_MAJOR: u16 = 1;

/// Poisoned once [`mark_panicked`] runs; spinlock acquire and the scheduler
/// loop are the natural places an embedder would check this, the same role
/// `KernelBuilder::panicked` plays for the teacher (spec.md §7: a corruption
/// / invariant violation "stops all CPUs").
static PANICKED: AtomicBool = AtomicBool::new(false);

/// Called only from [`crate::kernel_panic`]. Never call directly.
pub fn mark_panicked() {
    PANICKED.store(true, Ordering::SeqCst);
}

/// `true` once any CPU has hit a [`crate::kernel_panic`].
pub fn has_panicked() -> bool {
    PANICKED.load(Ordering::SeqCst)
}

/// Everything the syscall layer and the rest of the kernel share: physical
/// memory, the mounted filesystem, the process table, the scheduler, and
/// the open-file/device layer. One `Kernel` per booted instance.
pub struct Kernel {
    pub page_allocator: PageAllocator,
    pub fs: FileSystem,
    pub procs: ProcessTable,
    pub scheduler: Scheduler,
    pub files: FileTable,
    pub devices: Devices,
    pub console: Arc<Console>,
}

impl Kernel {
    /// Mounts `device`, wires up the console under [`CONSOLE_MAJOR`], and
    /// attaches it as the `log` facade's render target (spec.md §4.7,
    /// `src/logger.rs`). `num_pages` sizes the physical page allocator
    /// (spec.md §4.2); `ncpu` sizes the scheduler's concurrency (spec.md
    /// §4.9).
    pub fn new(device: Arc<dyn BlockDevice>, terminal: Box<dyn RawTerminal>, num_pages: usize, ncpu: usize) -> Result<Self> {
        let fs = FileSystem::mount(device)?;
        let devices = Devices::new();

        let console = Arc::new(Console::new(terminal));
        devices.register(CONSOLE_MAJOR, console.clone());

        // `attach_sink` needs a `&'static dyn LogSink`. A `Kernel` itself
        // isn't `'static` until its embedder leaks or pins it, so one strong
        // reference is intentionally never reclaimed here — the same
        // "console never goes away for the life of the machine" assumption
        // the teacher's static `KernelBuilder` bakes in by construction.
        let static_console: &'static Console = unsafe { &*Arc::into_raw(console.clone()) };
        crate::logger::init();
        crate::logger::attach_sink(static_console);

        Ok(Self {
            page_allocator: PageAllocator::new(num_pages),
            fs,
            procs: ProcessTable::new(),
            scheduler: Scheduler::new(ncpu),
            files: FileTable::new(),
            devices,
            console,
        })
    }
}
