//! Pipes: single-page ring buffers with blocking read/write (spec.md §3,
//! §4.7, component C7 part 2).
//!
//! Grounded on `kernel-rs/src/pipe.rs`'s `Pipe`/`PipeInner` (`nread`/`nwrite`
//! wrapping counters rather than a separate "full" flag, `try_read`/
//! `try_write` probing once per wake) and `AllocatedPipe::close`'s "free once
//! both ends are closed" rule. The teacher sleeps on a `WaitChannel` per
//! direction; this crate uses a [`Semaphore`] per direction the same way
//! [`crate::fs::log::Log::begin_op`] does, releasing the pipe's own spinlock
//! around the blocking wait via [`crate::lock::Guard::reacquire_after`].

use std::sync::Arc;

use crate::error::Result;
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::param::PAGE;
use crate::proc::semaphore::Semaphore;
use crate::proc::Pid;

/// Single-page ring buffer (spec.md §3: "Single-page ring buffer
/// `{data[4096], ...}`").
pub const PIPESIZE: usize = PAGE;

struct PipeInner {
    data: [u8; PIPESIZE],
    nread: u32,
    nwrite: u32,
    readopen: bool,
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,
    /// Posted when a reader drains at least one byte, or when either end
    /// closes; wakes a blocked writer so it can recheck. Held behind an
    /// `Arc` (rather than inline) so a blocked caller's [`Proc::blocked_on`]
    /// can hold its own reference for [`crate::proc::ProcessTable::kill`]
    /// to reach — see [`Self::write_ready`].
    write_ready: Arc<Semaphore>,
    /// Posted when a writer adds at least one byte, or when either end
    /// closes; wakes a blocked reader so it can recheck.
    read_ready: Arc<Semaphore>,
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            inner: Spinlock::new_at(
                "pipe",
                LockLevel::Other,
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            write_ready: Arc::new(Semaphore::new(0)),
            read_ready: Arc::new(Semaphore::new(0)),
        }
    }

    /// The semaphore a blocked [`Self::read`] waits on. `syscall::file::read`
    /// registers this in the caller's [`crate::proc::Proc::blocked_on`]
    /// before blocking so `kill(2)` can find and interrupt it.
    pub fn read_ready(&self) -> Arc<Semaphore> {
        self.read_ready.clone()
    }

    /// The semaphore a blocked [`Self::write`] waits on; see [`Self::read_ready`].
    pub fn write_ready(&self) -> Arc<Semaphore> {
        self.write_ready.clone()
    }

    /// Blocks while the pipe is empty and the writer is still open; signals
    /// the writer after draining (spec.md §4.7). Returns `Ok(0)` once the
    /// pipe is drained and the writer has closed (EOF).
    pub fn read(&self, pid: Pid, dst: &mut [u8]) -> Result<usize> {
        let mut guard = self.inner.lock();
        loop {
            if guard.nread != guard.nwrite {
                let mut n = 0;
                while n < dst.len() && guard.nread != guard.nwrite {
                    dst[n] = guard.data[guard.nread as usize % PIPESIZE];
                    guard.nread = guard.nread.wrapping_add(1);
                    n += 1;
                }
                self.write_ready.post();
                return Ok(n);
            }
            if !guard.writeopen {
                return Ok(0);
            }
            guard.reacquire_after(|| self.read_ready.wait(pid))?;
        }
    }

    /// Blocks while the pipe is full and the reader is still open, signaling
    /// the reader as each group of bytes lands (spec.md §4.7). Returns
    /// `Err(NotFound)` — a broken pipe — if the reader has already closed.
    pub fn write(&self, pid: Pid, src: &[u8]) -> Result<usize> {
        let mut guard = self.inner.lock();
        let mut written = 0;
        loop {
            if !guard.readopen {
                return Err(crate::error::KernelError::NotFound);
            }
            while written < src.len() && guard.nwrite.wrapping_sub(guard.nread) < PIPESIZE as u32 {
                let idx = guard.nwrite as usize % PIPESIZE;
                guard.data[idx] = src[written];
                guard.nwrite = guard.nwrite.wrapping_add(1);
                written += 1;
            }
            self.read_ready.post();
            if written == src.len() {
                return Ok(written);
            }
            guard.reacquire_after(|| self.write_ready.wait(pid))?;
        }
    }

    /// Closes one end. Returns `true` once both ends are closed, telling the
    /// caller the pipe itself (and its last `Arc`) can be dropped.
    pub fn close(&self, writable: bool) -> bool {
        let mut guard = self.inner.lock();
        if writable {
            guard.writeopen = false;
            self.read_ready.post();
        } else {
            guard.readopen = false;
            self.write_ready.post();
        }
        !guard.readopen && !guard.writeopen
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn write_then_read_round_trips() {
        let pipe = Pipe::new();
        let n = pipe.write(1, b"hello").unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 5];
        assert_eq!(pipe.read(2, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_on_empty_closed_writer_is_eof() {
        let pipe = Pipe::new();
        pipe.close(true);
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(1, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_to_closed_reader_is_broken_pipe() {
        let pipe = Pipe::new();
        pipe.close(false);
        assert_eq!(pipe.write(1, b"x"), Err(crate::error::KernelError::NotFound));
    }

    #[test]
    fn full_write_blocks_until_a_read_drains_it() {
        let pipe = Arc::new(Pipe::new());
        let filler = vec![0x42u8; PIPESIZE];
        assert_eq!(pipe.write(1, &filler).unwrap(), PIPESIZE);

        let p2 = pipe.clone();
        let handle = thread::spawn(move || p2.write(1, b"more"));
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(2, &mut buf).unwrap(), 4);
        assert_eq!(handle.join().unwrap().unwrap(), 4);
    }

    #[test]
    fn kill_interrupts_a_blocked_reader() {
        let pipe = Arc::new(Pipe::new());
        let p2 = pipe.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            p2.read(42, &mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        pipe.read_ready.alert_proc(42);
        assert_eq!(handle.join().unwrap(), Err(crate::error::KernelError::Interrupted));
    }
}
