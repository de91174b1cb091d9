//! Crate-wide error type.
//!
//! The teacher (`kernel-rs`) propagates failures as bare `Result<T, ()>` and
//! leans on `goto`-style cleanup at the call site (see `pipe.rs`, `file.rs`).
//! spec.md §7 names the conceptual error kinds explicitly; this module gives
//! them a real sum type so callers can match on *why* an operation failed
//! instead of just that it did, while keeping the same "negative result,
//! never panic on user-origin errors" propagation policy.

use core::fmt;

pub type Result<T> = core::result::Result<T, KernelError>;

/// Conceptual error kinds from spec.md §7.
///
/// Corruption / invariant violations (bad root inode, unknown process state,
/// unknown syscall id, failed block verification) are not represented here:
/// per spec.md §7 those are fatal and go through [`crate::kernel_panic`]
/// instead of being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Out of physical pages, slab memory, file table slots, inodes, or log
    /// space.
    OutOfResources,
    /// Malformed path, bad file descriptor, non-positive length, unsupported
    /// flag combination.
    InvalidArgument,
    /// Write attempted on a read-only file; unlink of a non-empty directory.
    PermissionDenied,
    /// Path component, file descriptor, or inode does not exist.
    NotFound,
    /// Name already exists where a unique name was required.
    AlreadyExists,
    /// Operation would need to block and the caller asked not to.
    WouldBlock,
    /// The calling process was killed while blocked (`kill`'s alert).
    Interrupted,
    /// A file was open with the wrong directionality, or a directory/file
    /// type mismatch (e.g. `open` on a directory with write access).
    NotADirectory,
    IsADirectory,
    /// End of file / pipe reached.
    EndOfFile,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfResources => "out of resources",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::PermissionDenied => "permission denied",
            KernelError::NotFound => "not found",
            KernelError::AlreadyExists => "already exists",
            KernelError::WouldBlock => "would block",
            KernelError::Interrupted => "interrupted",
            KernelError::NotADirectory => "not a directory",
            KernelError::IsADirectory => "is a directory",
            KernelError::EndOfFile => "end of file",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for KernelError {}

impl KernelError {
    /// POSIX-style negative return value, as spec.md §6 requires at the
    /// syscall ABI boundary ("Negative return values are error indicators").
    pub fn to_errno(self) -> i64 {
        -1
    }
}

/// Kernel panic: a corruption / invariant violation (spec.md §7). Stops all
/// CPUs by poisoning [`crate::kernel::PANICKED`], which every spinlock
/// acquire and scheduler loop checks.
#[macro_export]
macro_rules! kernel_panic {
    ($($arg:tt)*) => {{
        $crate::kernel::mark_panicked();
        ::log::error!($($arg)*);
        panic!($($arg)*)
    }};
}
