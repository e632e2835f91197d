//! Kernel Logging
//!
//! Logging through the `log` crate facade.
//!
//! Records are written to:
//! 1. a lock-free ring ([`buffer::LOG_BUFFER`]) that can be drained later
//! 2. the console, while the early console is enabled
//!
//! Fatal boot paths bypass both and print with [`early_println!`](crate::early_println).

pub mod buffer;
mod logger;

pub use axon_pal::console::{ConsoleDevice, ConsoleWriter};
pub use buffer::{LOG_BUFFER, LogBufferStats, LogEntry};
pub use logger::{attach, disable_early_console, format_line, init};
