//! Kernel logger
//!
//! Implements `log::Log`. Every record goes into the lock-free ring; while
//! the early console is enabled it is also echoed to the console.
//!
//! The logger is installed before the platform services exist. Until
//! [`attach`] is called records carry a zero timestamp and only reach the
//! ring.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::logging::buffer::{self, LOG_BUFFER, LogEntry};
use crate::services::PlatformServices;

/// Stack buffer for formatting a record without allocating
pub(crate) struct MessageBuffer {
    data: [u8; buffer::LOG_ENTRY_CONTENT_SIZE],
    len: usize,
}

impl MessageBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            data: [0u8; buffer::LOG_ENTRY_CONTENT_SIZE],
            len: 0,
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.data[..self.len]) {
            Ok(s) => s,
            // Truncation may split a multi-byte char at the very end
            Err(e) => core::str::from_utf8(&self.data[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = buffer::LOG_ENTRY_CONTENT_SIZE - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => " WARN",
        Level::Info => " INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Write one console line: `[secs.millis] LEVEL target: message\n`
pub fn format_line(
    out: &mut dyn Write,
    timestamp_ns: u64,
    level: Level,
    target: &str,
    message: &str,
) -> fmt::Result {
    let ms = timestamp_ns / 1_000_000;
    writeln!(
        out,
        "[{:>8}.{:03}] {} {}: {}",
        ms / 1000,
        ms % 1000,
        level_label(level),
        target,
        message
    )
}

struct KernelLogger {
    services: Once<&'static PlatformServices>,
    early_console: AtomicBool,
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let services = self.services.get().copied();
        let timestamp_ns = services.map_or(0, |s| s.now_nanos());

        let mut msg_buf = MessageBuffer::new();
        let _ = write!(msg_buf, "{}", record.args());

        LOG_BUFFER.push(LogEntry::new(
            timestamp_ns,
            record.level(),
            record.target(),
            msg_buf.as_str(),
        ));

        if let Some(services) = services
            && self.early_console.load(Ordering::Acquire)
        {
            let _ = format_line(
                &mut services.console_writer(),
                timestamp_ns,
                record.level(),
                record.target(),
                msg_buf.as_str(),
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger {
    services: Once::new(),
    early_console: AtomicBool::new(true),
};

/// Install the kernel logger at `level`.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: LevelFilter) {
    LOG_BUFFER.enable();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Give the logger its clock and console.
pub fn attach(services: &'static PlatformServices) {
    LOGGER.services.call_once(|| services);
}

/// Stop echoing records to the console; they still reach the ring.
pub fn disable_early_console() {
    LOGGER.early_console.store(false, Ordering::Release);
}

/// Print to a console before (or without) the logger
#[macro_export]
macro_rules! early_print {
    ($console:expr, $($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::logging::ConsoleWriter::new($console), $($arg)*);
    }};
}

/// Print a line to a console before (or without) the logger
#[macro_export]
macro_rules! early_println {
    ($console:expr) => {
        $crate::logging::ConsoleDevice::write_bytes($console, b"\n")
    };
    ($console:expr, $($arg:tt)*) => {{
        use core::fmt::Write;
        let mut w = $crate::logging::ConsoleWriter::new($console);
        let _ = write!(w, $($arg)*);
        let _ = w.write_str("\n");
    }};
}
