//! Kernel Log Ring Buffer
//!
//! Stores formatted log records in a lock-free ring so they can be read
//! back for diagnostics after the early console has been turned off.
//!
//! # Design
//!
//! - Lock-free MPMC queue using thingbuf
//! - 256 fixed-size entry slots, no allocation on the logging path
//! - Interrupt-safe: safe to call from any context
//! - Overflow drops the new record (`push` returns false)

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thingbuf::StaticThingBuf;

/// Maximum size of a single log entry's content (target + message)
pub const LOG_ENTRY_CONTENT_SIZE: usize = 240;

/// Number of log entry slots in the kernel ring
pub const LOG_BUFFER_SLOTS: usize = 256;

/// A single log entry with fixed-size storage
#[derive(Clone)]
pub struct LogEntry {
    /// Nanoseconds since the counter started
    pub timestamp_ns: u64,
    /// Log level (0=Error, 1=Warn, 2=Info, 3=Debug, 4=Trace)
    pub level: u8,
    pub target_len: u8,
    pub message_len: u16,
    /// Layout: [target bytes][message bytes]
    pub content: [u8; LOG_ENTRY_CONTENT_SIZE],
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            level: 0,
            target_len: 0,
            message_len: 0,
            content: [0u8; LOG_ENTRY_CONTENT_SIZE],
        }
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl LogEntry {
    pub fn new(timestamp_ns: u64, level: log::Level, target: &str, message: &str) -> Self {
        let mut entry = Self {
            timestamp_ns,
            level: level_to_u8(level),
            ..Self::default()
        };

        let target = truncate_str(target, LOG_ENTRY_CONTENT_SIZE.min(usize::from(u8::MAX)));
        let target_len = target.len();
        entry.content[..target_len].copy_from_slice(target.as_bytes());
        entry.target_len = target_len as u8;

        let message = truncate_str(message, LOG_ENTRY_CONTENT_SIZE - target_len);
        let message_len = message.len();
        entry.content[target_len..target_len + message_len].copy_from_slice(message.as_bytes());
        entry.message_len = message_len as u16;

        entry
    }

    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        core::str::from_utf8(&self.content[..len]).unwrap_or("<invalid>")
    }

    pub fn message(&self) -> &str {
        let target_len = self.target_len as usize;
        let message_len = self.message_len as usize;
        core::str::from_utf8(&self.content[target_len..target_len + message_len])
            .unwrap_or("<invalid>")
    }

    pub fn level(&self) -> log::Level {
        u8_to_level(self.level)
    }
}

fn level_to_u8(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 0,
        log::Level::Warn => 1,
        log::Level::Info => 2,
        log::Level::Debug => 3,
        log::Level::Trace => 4,
    }
}

/// Convert u8 back to log level
pub fn u8_to_level(val: u8) -> log::Level {
    match val {
        0 => log::Level::Error,
        1 => log::Level::Warn,
        2 => log::Level::Info,
        3 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

/// A lock-free ring of log entries that can be switched on and off
pub struct LogRing<const N: usize> {
    entries: StaticThingBuf<LogEntry, N>,
    enabled: AtomicBool,
    dropped: AtomicU64,
}

impl<const N: usize> LogRing<N> {
    pub const fn new() -> Self {
        Self {
            entries: StaticThingBuf::new(),
            enabled: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Queue an entry. Returns false if disabled or full.
    pub fn push(&self, entry: LogEntry) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let queued = self.entries.push(entry).is_ok();
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    pub fn pop(&self) -> Option<LogEntry> {
        if !self.is_enabled() {
            return None;
        }
        self.entries.pop()
    }

    /// Entries waiting to be drained
    pub fn available(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Records lost because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain formatted entries (`[LEVEL] target: message\n`) into `out`.
    ///
    /// Returns the number of bytes written. An entry that does not fit is
    /// written truncated and the drain stops there.
    pub fn drain(&self, out: &mut [u8]) -> usize {
        let mut written = 0;

        while written < out.len() {
            let Some(entry) = self.pop() else {
                break;
            };
            let level_str = match entry.level() {
                log::Level::Error => "[ERROR] ",
                log::Level::Warn => "[WARN ] ",
                log::Level::Info => "[INFO ] ",
                log::Level::Debug => "[DEBUG] ",
                log::Level::Trace => "[TRACE] ",
            };
            let parts: [&[u8]; 5] = [
                level_str.as_bytes(),
                entry.target().as_bytes(),
                b": ",
                entry.message().as_bytes(),
                b"\n",
            ];
            for part in parts {
                let n = part.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&part[..n]);
                written += n;
            }
        }

        written
    }

    /// Discard everything queued
    pub fn clear(&self) {
        while self.entries.pop().is_some() {}
    }

    pub fn stats(&self) -> LogBufferStats {
        LogBufferStats {
            entries: self.entries.len(),
            capacity: self.entries.capacity(),
            dropped: self.dropped(),
        }
    }
}

impl<const N: usize> Default for LogRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about a log ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBufferStats {
    pub entries: usize,
    pub capacity: usize,
    pub dropped: u64,
}

/// The kernel's log ring
pub static LOG_BUFFER: LogRing<LOG_BUFFER_SLOTS> = LogRing::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let e = LogEntry::new(5, log::Level::Warn, "axon::smp", "cpu2 failed");
        assert_eq!(e.target(), "axon::smp");
        assert_eq!(e.message(), "cpu2 failed");
        assert_eq!(e.level(), log::Level::Warn);
    }

    #[test]
    fn test_entry_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let e = LogEntry::new(0, log::Level::Info, "t", &long);
        assert_eq!(e.message().len(), LOG_ENTRY_CONTENT_SIZE - 2);
        assert!(e.message().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_oversized_target_fills_entry() {
        let target = "m".repeat(300);
        let e = LogEntry::new(0, log::Level::Debug, &target, "lost");
        assert_eq!(e.target().len(), LOG_ENTRY_CONTENT_SIZE);
        assert!(target.starts_with(e.target()));
        assert_eq!(e.message(), "");

        let wide = "ü".repeat(130);
        let e = LogEntry::new(0, log::Level::Debug, &wide, "x");
        assert_eq!(e.target().len(), LOG_ENTRY_CONTENT_SIZE);
        assert_eq!(e.message(), "");
    }

    #[test]
    fn test_disabled_ring_drops() {
        static RING: LogRing<4> = LogRing::new();
        assert!(!RING.push(LogEntry::default()));
        assert_eq!(RING.available(), 0);
    }

    #[test]
    fn test_overflow_counts_drops() {
        static RING: LogRing<2> = LogRing::new();
        RING.enable();
        assert!(RING.push(LogEntry::new(0, log::Level::Info, "a", "1")));
        assert!(RING.push(LogEntry::new(0, log::Level::Info, "a", "2")));
        assert!(!RING.push(LogEntry::new(0, log::Level::Info, "a", "3")));
        assert_eq!(RING.stats().dropped, 1);
        assert_eq!(RING.pop().map(|e| e.message() == "1"), Some(true));
    }

    #[test]
    fn test_drain_formats_and_truncates() {
        static RING: LogRing<4> = LogRing::new();
        RING.enable();
        RING.push(LogEntry::new(0, log::Level::Error, "npu", "device lost"));
        RING.push(LogEntry::new(0, log::Level::Info, "smp", "cpu1 online"));

        let mut out = [0u8; 64];
        let n = RING.drain(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert_eq!(text, "[ERROR] npu: device lost\n[INFO ] smp: cpu1 online\n");

        RING.push(LogEntry::new(0, log::Level::Debug, "x", "0123456789"));
        let mut small = [0u8; 12];
        assert_eq!(RING.drain(&mut small), 12);
        assert_eq!(&small, b"[DEBUG] x: 0");
        assert_eq!(RING.available(), 0);
    }
}
