//! Kernel logging, via the `log` facade.
//!
//! Grounded on `ryanbreen-breenix/kernel/Cargo.toml`'s pairing of a bare
//! custom console with the `log` crate: subsystems call `log::info!`/
//! `log::warn!`/... and a single [`KernelLogger`] renders every record
//! through whatever currently serves as the kernel's console, the same
//! role the teacher's `Printer`/`console_write` (`kernel-rs/src/console.rs`)
//! plays for `println!`-style output. Before a console is attached (early
//! boot, and in unit tests that don't construct one), records fall back to
//! stderr so nothing is silently dropped.

use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Anything that can receive a single rendered log line. [`crate::console::Console`]
/// implements this so kernel logging and `write(2)` to `/dev/console` share
/// one sink.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

struct KernelLogger {
    sink: OnceLock<&'static dyn LogSink>,
}

static LOGGER: KernelLogger = KernelLogger {
    sink: OnceLock::new(),
};

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        match self.sink.get() {
            Some(sink) => sink.write_line(&line),
            None => eprintln!("{}", line),
        }
    }

    fn flush(&self) {}
}

/// Installs the `log` facade backend. Idempotent; call once at kernel boot.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);
}

/// Attaches a console (or any other [`LogSink`]) as the render target for
/// subsequent log records. Only the first call takes effect, matching
/// `OnceLock` semantics; a kernel only ever has one console.
pub fn attach_sink(sink: &'static dyn LogSink) {
    let _ = LOGGER.sink.set(sink);
}
