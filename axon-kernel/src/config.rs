//! Kernel configuration
//!
//! Compile-time defaults plus the runtime [`KernelConfig`] resolved once at
//! boot from the descriptor's boot arguments. The resolved value is passed
//! explicitly to whatever needs it.
//!
//! Recognised `key=value` tokens:
//!
//! | Key                  | Field                  |
//! |----------------------|------------------------|
//! | `loglevel`           | `log_level`            |
//! | `smp.attempts`       | `smp_attempts`         |
//! | `smp.timeout_ms`     | `smp_timeout_ms`       |
//! | `npu.queue_depth`    | `npu_queue_depth`      |
//! | `npu.hang_timeout_ms`| `npu_hang_timeout_ms`  |
//! | `npu.reorder`        | `npu_reorder`          |

use core::fmt;
use core::str::FromStr;
use core::time::Duration;

use log::LevelFilter;

use crate::npu::AcceleratorConfig;
use crate::smp::BringupPolicy;

/// Accelerator queue depth (tasks submitted but not yet consumed)
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Upper bound accepted for `npu.queue_depth`
pub const MAX_QUEUE_DEPTH: usize = 1024;

/// `CPU_ON` attempts per secondary core
pub const DEFAULT_BRINGUP_ATTEMPTS: u32 = 3;

/// Wait per attempt for a secondary core to reach Running
pub const DEFAULT_BRINGUP_TIMEOUT_MS: u64 = 50;

/// Accelerator error log entries kept before the oldest are dropped
pub const ERROR_LOG_CAPACITY: usize = 64;

pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Debug;

/// Longest a task may execute before the device is declared lost
pub const DEFAULT_HANG_TIMEOUT_MS: u64 = 2_000;

/// Name of the reserved region backing accelerator DMA buffers
pub const ACCELERATOR_POOL_NAME: &str = "npu-pool";

/// Runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub log_level: LevelFilter,
    pub smp_attempts: u32,
    pub smp_timeout_ms: u64,
    pub npu_queue_depth: usize,
    pub npu_hang_timeout_ms: u64,
    /// Allow priority reordering when the device supports it
    pub npu_reorder: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL,
            smp_attempts: DEFAULT_BRINGUP_ATTEMPTS,
            smp_timeout_ms: DEFAULT_BRINGUP_TIMEOUT_MS,
            npu_queue_depth: DEFAULT_QUEUE_DEPTH,
            npu_hang_timeout_ms: DEFAULT_HANG_TIMEOUT_MS,
            npu_reorder: true,
        }
    }
}

/// A boot argument that could not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning<'a> {
    UnknownKey(&'a str),
    BadValue { key: &'a str, value: &'a str },
}

impl fmt::Display for ConfigWarning<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "unknown boot argument '{}'", key),
            Self::BadValue { key, value } => {
                write!(f, "invalid value '{}' for '{}', using default", value, key)
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "on" | "yes" | "true" => Some(true),
        "0" | "off" | "no" | "false" => Some(false),
        _ => None,
    }
}

fn parse_in_range<T: FromStr + PartialOrd>(value: &str, min: T, max: T) -> Option<T> {
    value.parse::<T>().ok().filter(|v| *v >= min && *v <= max)
}

impl KernelConfig {
    /// Resolve from a boot argument string, warning about anything ignored.
    #[must_use]
    pub fn from_bootargs(args: &str) -> Self {
        let mut config = Self::default();
        config.apply_all(args, |w| log::warn!("config: {}", w));
        config
    }

    /// Apply every token in `args`, reporting skipped ones to `warn`.
    pub fn apply_all<'a>(&mut self, args: &'a str, mut warn: impl FnMut(ConfigWarning<'a>)) {
        for token in args.split_ascii_whitespace() {
            // Bare flags (e.g. "quiet") belong to other consumers
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            if let Err(w) = self.apply(key, value) {
                warn(w);
            }
        }
    }

    /// Apply one `key=value` pair.
    pub fn apply<'a>(&mut self, key: &'a str, value: &'a str) -> Result<(), ConfigWarning<'a>> {
        let bad = ConfigWarning::BadValue { key, value };
        match key {
            "loglevel" => self.log_level = LevelFilter::from_str(value).map_err(|_| bad)?,
            "smp.attempts" => self.smp_attempts = parse_in_range(value, 1, 100).ok_or(bad)?,
            "smp.timeout_ms" => {
                self.smp_timeout_ms = parse_in_range(value, 1, 60_000).ok_or(bad)?;
            }
            "npu.queue_depth" => {
                self.npu_queue_depth = parse_in_range(value, 1, MAX_QUEUE_DEPTH).ok_or(bad)?;
            }
            "npu.hang_timeout_ms" => {
                self.npu_hang_timeout_ms = parse_in_range(value, 1, 600_000).ok_or(bad)?;
            }
            "npu.reorder" => self.npu_reorder = parse_bool(value).ok_or(bad)?,
            // Arguments for other subsystems (console=, root=, ...)
            _ if !key.starts_with("smp.") && !key.starts_with("npu.") => {}
            _ => return Err(ConfigWarning::UnknownKey(key)),
        }
        Ok(())
    }

    #[must_use]
    pub fn bringup_policy(&self) -> BringupPolicy {
        BringupPolicy {
            attempts: self.smp_attempts,
            attempt_timeout: Duration::from_millis(self.smp_timeout_ms),
        }
    }

    #[must_use]
    pub fn accelerator(&self) -> AcceleratorConfig {
        AcceleratorConfig {
            queue_depth: self.npu_queue_depth,
            hang_timeout: Duration::from_millis(self.npu_hang_timeout_ms),
            allow_reorder: self.npu_reorder,
            error_log_capacity: ERROR_LOG_CAPACITY,
            pool_name: ACCELERATOR_POOL_NAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_defaults() {
        let c = KernelConfig::default();
        assert_eq!(c.npu_queue_depth, 8);
        assert_eq!(c.smp_attempts, 3);
        assert_eq!(c.log_level, LevelFilter::Debug);
        assert!(c.npu_reorder);
    }

    #[test]
    fn test_reference_bootargs() {
        let c = KernelConfig::from_bootargs("loglevel=info npu.queue_depth=8");
        assert_eq!(c.log_level, LevelFilter::Info);
        assert_eq!(c.npu_queue_depth, 8);
    }

    #[test]
    fn test_all_keys() {
        let c = KernelConfig::from_bootargs(
            "console=ttyAMA0 quiet loglevel=WARN smp.attempts=5 smp.timeout_ms=10 \
             npu.queue_depth=32 npu.hang_timeout_ms=500 npu.reorder=off",
        );
        assert_eq!(c.log_level, LevelFilter::Warn);
        assert_eq!(c.smp_attempts, 5);
        assert_eq!(c.smp_timeout_ms, 10);
        assert_eq!(c.npu_queue_depth, 32);
        assert_eq!(c.npu_hang_timeout_ms, 500);
        assert!(!c.npu_reorder);
        assert_eq!(c.bringup_policy().attempt_timeout, Duration::from_millis(10));
        assert_eq!(c.accelerator().queue_depth, 32);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let mut c = KernelConfig::default();
        let mut warnings = Vec::new();
        c.apply_all(
            "npu.queue_depth=0 smp.attempts=lots loglevel=chatty npu.bogus=1",
            |w| warnings.push(w),
        );
        assert_eq!(c, KernelConfig::default());
        assert_eq!(warnings.len(), 4);
        assert_eq!(warnings[3], ConfigWarning::UnknownKey("npu.bogus"));
        assert_eq!(
            warnings[0],
            ConfigWarning::BadValue { key: "npu.queue_depth", value: "0" }
        );
    }
}
