//! Platform Abstraction Layer
//!
//! Everything the kernel needs to know about the board comes through here:
//! - [`descriptor`]: turns the boot-time hardware description blob (device
//!   tree or firmware table) into one normalised [`PlatformDescriptor`]
//! - [`console`]: byte-level console devices
//! - [`timer`]: the monotonic counter, its comparator, and fixed-point
//!   tick/nanosecond conversion
//! - [`psci`]: firmware calls for core power-on and system power-off
//!
//! Hardware access sits behind traits; the aarch64 implementations are only
//! compiled for that architecture so the rest of the crate is host-testable.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod console;
pub mod descriptor;
pub mod psci;
pub mod timer;

pub use console::ConsoleDevice;
pub use descriptor::{MalformedDescriptor, PlatformDescriptor, resolve};
pub use psci::{CpuFirmware, PowerControl, PsciConduit, PsciError};
pub use timer::{CounterHardware, Instant, TickConverter};
