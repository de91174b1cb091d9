//! Kernel core of a small multicore Unix-like operating system for AArch64.
//!
//! This crate implements the four subsystems that together realize
//! preemptive multitasking over a persistent filesystem: physical/virtual
//! memory management (`mm`), the process/thread model and scheduler
//! (`proc`), the buffered block layer with crash-safe logging (`fs`), and
//! the inode filesystem plus file descriptor / pipe / console layer
//! (`file`, `pipe`, `console`).
//!
//! The boot sequence, trap vectors, UART/GIC drivers, and virtio-blk access
//! are out of scope: this crate only requires an opaque [`hal::BlockDevice`]
//! and [`hal::TrapSource`] from its embedder. See `DESIGN.md` for why the
//! crate targets `std` instead of `#![no_std]`.

pub mod console;
pub mod error;
pub mod exec;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod lock;
pub mod logger;
pub mod mm;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod stat;
pub mod syscall;
pub mod util;

pub use error::{KernelError, Result};
pub use kernel::Kernel;
