//! The console character device: a cooked line discipline over a push-model
//! byte source (spec.md §4.7, §6, component C7 part 3).
//!
//! Grounded on `kernel-rs/src/console.rs`'s `Console`/`InputBuffer`: a
//! 128-byte input ring addressed by three cursors (`r`/`w`/`e` there,
//! `read_idx`/`write_idx`/`edit_idx` here) with the same erase/kill/EOF
//! handling and submit-on-newline-or-full rule. The teacher drives this from
//! a uart interrupt handler reading real hardware, which spec.md puts out of
//! scope; [`Console::input_byte`] is this crate's equivalent entry point, fed
//! by whatever stands in for a driver (a test, or a terminal emulator loop).
//! History browsing (arrow-up/down over the last 32 submitted lines) has no
//! teacher counterpart — the teacher's xv6 lineage has no line history — and
//! is grounded instead on ordinary shell readline behavior: browsing replaces
//! the in-progress line wholesale and is itself tracked as edit-buffer state,
//! reusing the same erase/echo primitives as backspace.

use std::collections::VecDeque;

use crate::error::{KernelError, Result};
use crate::file::CharDevice;
use crate::lock::spinlock::LockLevel;
use crate::lock::Spinlock;
use crate::logger::LogSink;
use crate::proc::semaphore::Semaphore;
use crate::proc::Pid;

/// Size of the console input ring (spec.md §4.7: "buffers input in a
/// 128-byte ring").
const INPUT_BUF: usize = 128;

/// Depth of the arrow-up/down line history (spec.md §6: "a ring of last 32
/// lines").
const HISTORY_LINES: usize = 32;

/// Something that can accept one raw output byte — the actual terminal/tty
/// sink. `hal.rs` puts real UART hardware out of scope, so tests and the
/// eventual boot wiring supply their own implementation (an in-memory buffer,
/// or a real stdout writer).
pub trait RawTerminal: Send + Sync {
    fn put_raw(&self, c: u8);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Esc,
    Bracket,
}

struct Browsing {
    /// Index into `history`, counting back from the most recent entry.
    cursor: usize,
    /// The partially-typed line that was in progress when browsing began, so
    /// arrowing back down past the newest history entry restores it.
    draft: Vec<u8>,
}

struct ConsoleState {
    buf: [u8; INPUT_BUF],
    /// Next byte a reader will consume.
    read_idx: usize,
    /// Boundary of bytes submitted to readers.
    write_idx: usize,
    /// Boundary of the line currently being edited.
    edit_idx: usize,
    history: VecDeque<Vec<u8>>,
    browsing: Option<Browsing>,
    escape: Escape,
}

impl ConsoleState {
    fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            read_idx: 0,
            write_idx: 0,
            edit_idx: 0,
            history: VecDeque::with_capacity(HISTORY_LINES),
            browsing: None,
            escape: Escape::None,
        }
    }
}

pub struct Console {
    state: Spinlock<ConsoleState>,
    /// Posted whenever a whole line (or EOF) becomes available to readers.
    input_ready: Semaphore,
    terminal: Box<dyn RawTerminal>,
}

const fn ctrl(c: u8) -> u8 {
    c - b'@'
}

impl Console {
    pub fn new(terminal: Box<dyn RawTerminal>) -> Self {
        Self {
            state: Spinlock::new_at("console", LockLevel::Other, ConsoleState::new()),
            input_ready: Semaphore::new(0),
            terminal,
        }
    }

    fn echo(&self, c: u8) {
        self.terminal.put_raw(c);
    }

    fn echo_backspace(&self) {
        self.echo(8);
        self.echo(b' ');
        self.echo(8);
    }

    /// Erases the in-progress (unsubmitted) line from both the buffer and
    /// the screen.
    fn erase_edit_line(&self, state: &mut ConsoleState) {
        while state.edit_idx != state.write_idx {
            state.edit_idx -= 1;
            self.echo_backspace();
        }
    }

    /// Writes `line` into the buffer as the in-progress line and echoes it.
    fn set_edit_line(&self, state: &mut ConsoleState, line: &[u8]) {
        for &c in line {
            let idx = state.edit_idx % INPUT_BUF;
            state.buf[idx] = c;
            state.edit_idx += 1;
            self.echo(c);
        }
    }

    fn history_up(&self, state: &mut ConsoleState) {
        if state.history.is_empty() {
            return;
        }
        let cursor = match &state.browsing {
            Some(b) => b.cursor.saturating_sub(1),
            None => {
                let draft: Vec<u8> = (state.write_idx..state.edit_idx).map(|i| state.buf[i % INPUT_BUF]).collect();
                state.browsing = Some(Browsing { cursor: 0, draft });
                0
            }
        };
        let line = state.history[state.history.len() - 1 - cursor].clone();
        self.erase_edit_line(state);
        self.set_edit_line(state, &line);
        state.browsing.as_mut().unwrap().cursor = cursor;
    }

    fn history_down(&self, state: &mut ConsoleState) {
        let cursor = match &state.browsing {
            Some(b) => b.cursor,
            None => return,
        };
        if cursor == 0 {
            let draft = state.browsing.take().unwrap().draft;
            self.erase_edit_line(state);
            self.set_edit_line(state, &draft);
            return;
        }
        let new_cursor = cursor - 1;
        let line = state.history[state.history.len() - 1 - new_cursor].clone();
        self.erase_edit_line(state);
        self.set_edit_line(state, &line);
        state.browsing.as_mut().unwrap().cursor = new_cursor;
    }

    fn kill_line(&self, state: &mut ConsoleState) {
        self.erase_edit_line(state);
        state.browsing = None;
    }

    fn backspace(&self, state: &mut ConsoleState) {
        if state.edit_idx != state.write_idx {
            state.edit_idx -= 1;
            self.echo_backspace();
        }
        state.browsing = None;
    }

    /// Submits the bytes between `write_idx` and `edit_idx` to readers,
    /// recording them in history and waking anyone blocked in
    /// [`Self::read`].
    fn submit(&self, state: &mut ConsoleState) {
        let line: Vec<u8> = (state.write_idx..state.edit_idx).map(|i| state.buf[i % INPUT_BUF]).collect();
        if !line.is_empty() {
            if state.history.len() == HISTORY_LINES {
                state.history.pop_front();
            }
            state.history.push_back(line);
        }
        state.write_idx = state.edit_idx;
        state.browsing = None;
        self.input_ready.post();
    }

    /// Feeds one raw input byte through the line discipline (spec.md §6:
    /// "Control-U kills line; Backspace/DEL erases; Control-D is EOF; `\r`→
    /// `\n`. Arrow-up/down cycles through a ring of last 32 lines."). This is
    /// this crate's equivalent of the teacher's uart interrupt handler.
    pub fn input_byte(&self, raw: u8) {
        let mut state = self.state.lock();

        match state.escape {
            Escape::None => {
                if raw == 0x1b {
                    state.escape = Escape::Esc;
                    return;
                }
            }
            Escape::Esc => {
                state.escape = if raw == b'[' { Escape::Bracket } else { Escape::None };
                return;
            }
            Escape::Bracket => {
                state.escape = Escape::None;
                match raw {
                    b'A' => self.history_up(&mut state),
                    b'B' => self.history_down(&mut state),
                    _ => {}
                }
                return;
            }
        }

        if raw == ctrl(b'U') {
            self.kill_line(&mut state);
            return;
        }
        if raw == ctrl(b'H') || raw == 0x7f {
            self.backspace(&mut state);
            return;
        }

        let c = if raw == b'\r' { b'\n' } else { raw };
        if state.edit_idx.wrapping_sub(state.read_idx) >= INPUT_BUF {
            return;
        }
        self.echo(c);
        let idx = state.edit_idx % INPUT_BUF;
        state.buf[idx] = c;
        state.edit_idx = state.edit_idx.wrapping_add(1);
        state.browsing = None;
        if c == b'\n' || c == ctrl(b'D') || state.edit_idx == state.read_idx.wrapping_add(INPUT_BUF) {
            self.submit(&mut state);
        }
    }
}

impl CharDevice for Console {
    /// Reads (up to) one cooked line. Blocks until a line is submitted;
    /// returns `0` once an EOF marker (Control-D) is reached (spec.md §4.7).
    fn read(&self, pid: Pid, dst: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let target = dst.len();
        let mut n = 0;
        while n < target {
            while state.read_idx == state.write_idx {
                state.reacquire_after(|| self.input_ready.wait(pid))?;
            }
            let c = state.buf[state.read_idx % INPUT_BUF];
            state.read_idx = state.read_idx.wrapping_add(1);
            if c == ctrl(b'D') {
                if n > 0 {
                    // Save the EOF marker for the next call so this one
                    // returns the data collected so far.
                    state.read_idx = state.read_idx.wrapping_sub(1);
                }
                break;
            }
            dst[n] = c;
            n += 1;
            if c == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    /// Echoes every byte of `src` straight to the terminal (spec.md §4.7:
    /// `write(2)` to the console device).
    fn write(&self, _pid: Pid, src: &[u8]) -> Result<usize> {
        for &c in src {
            self.echo(c);
        }
        Ok(src.len())
    }
}

impl LogSink for Console {
    fn write_line(&self, line: &str) {
        for &b in line.as_bytes() {
            self.echo(b);
        }
        self.echo(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    struct RecordingTerminal {
        out: Mutex<Vec<u8>>,
    }

    impl RecordingTerminal {
        fn new() -> Self {
            Self { out: Mutex::new(Vec::new()) }
        }

        fn contents(&self) -> Vec<u8> {
            self.out.lock().unwrap().clone()
        }
    }

    impl RawTerminal for RecordingTerminal {
        fn put_raw(&self, c: u8) {
            self.out.lock().unwrap().push(c);
        }
    }

    fn feed(console: &Console, bytes: &[u8]) {
        for &b in bytes {
            console.input_byte(b);
        }
    }

    #[test]
    fn a_submitted_line_is_readable() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        feed(&console, b"hello\n");
        let mut buf = [0u8; 16];
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn backspace_erases_the_last_unsubmitted_character() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        feed(&console, b"helly");
        console.input_byte(ctrl(b'H'));
        feed(&console, b"o\n");
        let mut buf = [0u8; 16];
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn control_u_kills_the_whole_unsubmitted_line() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        feed(&console, b"garbage");
        console.input_byte(ctrl(b'U'));
        feed(&console, b"ok\n");
        let mut buf = [0u8; 16];
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok\n");
    }

    #[test]
    fn control_d_on_an_empty_line_reads_as_eof() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        console.input_byte(ctrl(b'D'));
        let mut buf = [0u8; 16];
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn control_d_after_partial_input_returns_data_then_eof_next_call() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        feed(&console, b"abc");
        console.input_byte(ctrl(b'D'));
        let mut buf = [0u8; 16];
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        let n2 = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn carriage_return_is_translated_to_newline() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        feed(&console, b"hi\r");
        let mut buf = [0u8; 16];
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test]
    fn arrow_up_recalls_the_previous_line_and_arrow_down_restores_the_draft() {
        let console = Console::new(Box::new(RecordingTerminal::new()));
        feed(&console, b"first\n");
        let mut buf = [0u8; 16];
        CharDevice::read(&console, 1, &mut buf).unwrap();

        feed(&console, b"dra");
        feed(&console, b"\x1b[A"); // arrow up
        feed(&console, b"\n");
        let n = CharDevice::read(&console, 1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first\n");
    }

    #[test]
    fn write_echoes_bytes_to_the_terminal() {
        let terminal = Arc::new(RecordingTerminal::new());
        struct Forwarding(Arc<RecordingTerminal>);
        impl RawTerminal for Forwarding {
            fn put_raw(&self, c: u8) {
                self.0.put_raw(c);
            }
        }
        let console = Console::new(Box::new(Forwarding(terminal.clone())));
        CharDevice::write(&console, 1, b"hi").unwrap();
        assert_eq!(terminal.contents(), b"hi");
    }

    #[test]
    fn a_blocked_reader_is_interrupted_by_kill() {
        let console = Arc::new(Console::new(Box::new(RecordingTerminal::new())));
        let c2 = console.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            CharDevice::read(&*c2, 42, &mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        console.input_ready.alert_proc(42);
        assert_eq!(handle.join().unwrap(), Err(KernelError::Interrupted));
    }
}
