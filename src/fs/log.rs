//! Write-ahead log: group-commit atomic operations (spec.md §4.5, second
//! half of C5).
//!
//! Grounded on `kernel-rs/src/fs/ufs/log.rs`'s `Log`/`LogHeader` and
//! `SleepableLock<Log>::begin_op`/`end_op`. The teacher admits a caller into
//! an operation, or blocks it, via a `SleepableLock` guard's own
//! `sleep`/`wakeup`; this crate keeps the log's header and outstanding-count
//! behind its own [`Spinlock`] (consistent with the documented acquire
//! order in spec.md §5, where the log sits between the block cache and the
//! bitmap) and signals room becoming available through a
//! [`crate::proc::semaphore::Semaphore`], using [`crate::lock::Guard::reacquire_after`]
//! to release the spinlock for the actual block.

use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::bcache::BufferCache;
use super::superblock::Superblock;
use crate::error::Result;
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, LOG_MAX, OP_MAX_BLOCKS, ROOTDEV};
use crate::proc::semaphore::Semaphore;

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOG_MAX],
}

impl LogHeader {
    const fn empty() -> Self {
        Self { n: 0, block: [0; LOG_MAX] }
    }
}

struct LogInner {
    header: LogHeader,
    outstanding: usize,
    committing: bool,
}

/// The system-wide write-ahead log.
pub struct Log {
    state: Spinlock<LogInner>,
    /// Posted once per commit; `begin_op` waits on it when there isn't
    /// enough log budget for one more operation.
    room_available: Semaphore,
    bcache: Arc<BufferCache>,
    log_start: u32,
}

impl Log {
    pub fn new(superblock: &Superblock, bcache: Arc<BufferCache>) -> Self {
        Self {
            state: Spinlock::new_at(
                "log",
                LockLevel::Log,
                LogInner {
                    header: LogHeader::empty(),
                    outstanding: 0,
                    committing: false,
                },
            ),
            room_available: Semaphore::new(0),
            bcache,
            log_start: superblock.log_start,
        }
    }

    fn read_header(&self) -> LogHeader {
        let mut raw = [0u8; BSIZE];
        self.bcache.read_raw(self.log_start, &mut raw);
        LogHeader::read_from_prefix(&raw[..]).unwrap()
    }

    fn write_header(&self, header: &LogHeader) {
        let mut raw = [0u8; BSIZE];
        raw[..std::mem::size_of::<LogHeader>()].copy_from_slice(header.as_bytes());
        self.bcache.write_raw(self.log_start, &raw);
    }

    /// Replays a log left non-empty by a crash between commit (step 2) and
    /// the header being cleared (step 4). Idempotent: if the header is
    /// already empty this is a no-op, matching spec.md §4.5's "Recovery at
    /// mount" contract.
    pub fn recover(&self) {
        let header = self.read_header();
        for i in 0..header.n as usize {
            let mut data = [0u8; BSIZE];
            self.bcache.read_raw(self.log_start + 1 + i as u32, &mut data);
            self.bcache.write_raw(header.block[i], &data);
        }
        self.write_header(&LogHeader::empty());
        self.state.lock().header = LogHeader::empty();
    }

    /// Admits `pid` into a new atomic operation, blocking while the log
    /// can't accommodate one more operation's worst-case footprint or a
    /// commit is in flight (spec.md §4.5's admission inequality).
    pub fn begin_op(&self, pid: i32) -> Result<()> {
        let mut guard = self.state.lock();
        loop {
            let would_fit =
                guard.header.n as usize + (guard.outstanding + 1) * OP_MAX_BLOCKS <= LOG_MAX;
            if !guard.committing && would_fit {
                guard.outstanding += 1;
                return Ok(());
            }
            guard.reacquire_after(|| self.room_available.wait(pid))?;
        }
    }

    /// Appends `blockno` to the log header if not already present, charging
    /// one slot to the caller's operation (spec.md's `sync`). Idempotent
    /// within one operation.
    pub fn write(&self, blockno: u32) {
        let mut guard = self.state.lock();
        assert!(guard.outstanding > 0, "log write outside begin_op/end_op");
        let n = guard.header.n as usize;
        if !guard.header.block[..n].contains(&blockno) {
            assert!(n < LOG_MAX, "log overflow: more blocks than OP_MAX_BLOCKS budget");
            guard.header.block[n] = blockno;
            guard.header.n += 1;
        }
    }

    /// Closes one operation. The last outstanding operation to close
    /// triggers the five-step group commit described in spec.md §4.5 and
    /// wakes every process waiting on log space.
    pub fn end_op(&self, _pid: i32) {
        let do_commit = {
            let mut guard = self.state.lock();
            assert!(!guard.committing);
            guard.outstanding -= 1;
            if guard.outstanding == 0 {
                guard.committing = true;
                true
            } else {
                false
            }
        };
        if do_commit {
            self.commit();
            self.state.lock().committing = false;
            self.room_available.post();
        }
    }

    fn commit(&self) {
        let header = self.state.lock().header;
        if header.n == 0 {
            return;
        }
        // Step 1: copy each dirty block's current content to its log slot.
        for i in 0..header.n as usize {
            let bno = header.block[i];
            let handle = self.bcache.get(ROOTDEV, bno).expect("log block missing from cache");
            let mut data = [0u8; BSIZE];
            self.bcache.with_buf(handle, |d| data.copy_from_slice(d));
            self.bcache.release(handle);
            self.bcache.write_raw(self.log_start + 1 + i as u32, &data);
        }
        // Step 2: the commit point.
        self.write_header(&header);
        // Step 3: install each logged block at its home location.
        for i in 0..header.n as usize {
            let mut data = [0u8; BSIZE];
            self.bcache.read_raw(self.log_start + 1 + i as u32, &mut data);
            self.bcache.write_raw(header.block[i], &data);
        }
        // Step 4: the log is empty again.
        self.write_header(&LogHeader::empty());
        self.state.lock().header = LogHeader::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::superblock::FSMAGIC;
    use crate::hal::MemBlockDevice;

    fn fixture() -> (Arc<BufferCache>, Log, Superblock) {
        let device = Arc::new(MemBlockDevice::new(64));
        let bcache = Arc::new(BufferCache::new(device));
        let sb = Superblock {
            magic: FSMAGIC,
            num_blocks: 64,
            num_data_blocks: 20,
            num_inodes: 20,
            num_log_blocks: 31,
            log_start: 2,
            inode_start: 33,
            bitmap_start: 40,
        };
        let log = Log::new(&sb, bcache.clone());
        (bcache, log, sb)
    }

    #[test]
    fn committed_write_is_visible_at_home_location() {
        let (bcache, log, _sb) = fixture();
        log.begin_op(1).unwrap();
        let h = bcache.get(ROOTDEV, 10).unwrap();
        bcache.with_buf(h, |d| d[0] = 0xAB);
        log.write(10);
        bcache.release(h);
        log.end_op(1);

        let mut raw = [0u8; BSIZE];
        bcache.read_raw(10, &mut raw);
        assert_eq!(raw[0], 0xAB);
    }

    #[test]
    fn recover_replays_a_committed_but_uninstalled_log() {
        let (bcache, log, sb) = fixture();
        // Simulate a crash right after the commit point (step 2): the log
        // slot holds the new data and the header says so, but step 3/4
        // never ran.
        let header = LogHeader { n: 1, block: { let mut b = [0u32; LOG_MAX]; b[0] = 15; b } };
        let mut raw = [0u8; BSIZE];
        raw[0] = 0xCD;
        bcache.write_raw(sb.log_start + 1, &raw);
        let mut hdr_block = [0u8; BSIZE];
        hdr_block[..std::mem::size_of::<LogHeader>()].copy_from_slice(header.as_bytes());
        bcache.write_raw(sb.log_start, &hdr_block);

        log.recover();

        let mut home = [0u8; BSIZE];
        bcache.read_raw(15, &mut home);
        assert_eq!(home[0], 0xCD);
        // Header is cleared, so a second recovery is a no-op.
        log.recover();
    }

    #[test]
    fn begin_op_blocks_until_room_is_freed_by_a_commit() {
        use std::thread;
        use std::time::Duration;

        let (bcache, log, _sb) = fixture();
        let log = Arc::new(log);
        // Saturate the log so the next begin_op must wait.
        for pid in 0..(LOG_MAX / OP_MAX_BLOCKS) as i32 {
            log.begin_op(pid).unwrap();
        }
        let log2 = log.clone();
        let handle = thread::spawn(move || log2.begin_op(99));
        thread::sleep(Duration::from_millis(20));
        // Closing every outstanding operation commits (log empties) and
        // wakes the waiter.
        for pid in 0..(LOG_MAX / OP_MAX_BLOCKS) as i32 {
            log.end_op(pid);
        }
        handle.join().unwrap().unwrap();
        log.end_op(99);
        let _ = bcache;
    }
}
