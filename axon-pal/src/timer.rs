//! ARM Generic Timer Support
//!
//! The monotonic counter and its one-shot comparator, plus fixed-point
//! conversion between counter ticks and nanoseconds.
//!
//! Conversion uses a precomputed 32.32 multiplier so no division or
//! floating-point runs on the hot path. Intermediates are `u128`, which
//! keeps the result exact to within one nanosecond for any realistic
//! uptime.

use core::time::Duration;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Fractional bits in the conversion multipliers
const SHIFT: u32 = 32;

/// Counter and comparator hardware.
pub trait CounterHardware: Send + Sync {
    /// Counter frequency in Hz
    fn frequency(&self) -> u64;

    /// Current counter value (monotonic, never wraps in practice)
    fn counter(&self) -> u64;

    /// Program the comparator to fire when the counter reaches `ticks`.
    fn set_deadline(&self, ticks: u64);

    /// Disable the comparator and clear a pending interrupt.
    fn cancel_deadline(&self);
}

/// A point on the monotonic counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    #[must_use]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn saturating_add_ticks(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }

    /// Ticks elapsed since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub const fn ticks_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Fixed-point tick/nanosecond converter for one counter frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConverter {
    frequency: u64,
    /// nanoseconds per tick, 32.32 fixed point
    ns_per_tick: u64,
    /// ticks per nanosecond, 32.32 fixed point
    ticks_per_ns: u64,
}

impl TickConverter {
    /// Build a converter, `None` for a zero or absurd frequency.
    #[must_use]
    pub fn new(frequency: u64) -> Option<Self> {
        if frequency == 0 || frequency > u64::from(u32::MAX) {
            return None;
        }
        let f = u128::from(frequency);
        let ns = u128::from(NSEC_PER_SEC);
        let ns_per_tick = ((ns << SHIFT) + f / 2) / f;
        let ticks_per_ns = ((f << SHIFT) + ns / 2) / ns;
        Some(Self {
            frequency,
            ns_per_tick: u64::try_from(ns_per_tick).ok()?,
            ticks_per_ns: u64::try_from(ticks_per_ns).ok()?,
        })
    }

    #[must_use]
    pub const fn frequency(&self) -> u64 {
        self.frequency
    }

    #[must_use]
    pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        let ns = (u128::from(ticks) * u128::from(self.ns_per_tick)) >> SHIFT;
        u64::try_from(ns).unwrap_or(u64::MAX)
    }

    /// Nanoseconds to ticks, rounded down
    #[must_use]
    pub fn nanos_to_ticks(&self, nanos: u64) -> u64 {
        let ticks = (u128::from(nanos) * u128::from(self.ticks_per_ns)) >> SHIFT;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Nanoseconds to ticks, rounded up so deadlines never fire early
    #[must_use]
    pub fn nanos_to_ticks_ceil(&self, nanos: u64) -> u64 {
        let scaled = u128::from(nanos) * u128::from(self.ticks_per_ns);
        let mask = (1u128 << SHIFT) - 1;
        let ticks = (scaled >> SHIFT) + u128::from(scaled & mask != 0);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn duration_to_ticks(&self, duration: Duration) -> u64 {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.nanos_to_ticks_ceil(nanos)
    }

    #[must_use]
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        Duration::from_nanos(self.ticks_to_nanos(ticks))
    }
}

/// The EL1 virtual timer
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Default)]
pub struct ArchCounter;

#[cfg(target_arch = "aarch64")]
mod arch {
    use aarch64_cpu::registers::{CNTFRQ_EL0, CNTV_CTL_EL0, CNTV_CVAL_EL0, CNTVCT_EL0};
    use tock_registers::interfaces::{Readable, Writeable};

    use super::{ArchCounter, CounterHardware};

    /// Timer control register bits
    mod ctl {
        pub const ENABLE: u64 = 1 << 0;
        pub const IMASK: u64 = 1 << 1;
    }

    impl CounterHardware for ArchCounter {
        fn frequency(&self) -> u64 {
            CNTFRQ_EL0.get()
        }

        fn counter(&self) -> u64 {
            CNTVCT_EL0.get()
        }

        fn set_deadline(&self, ticks: u64) {
            CNTV_CVAL_EL0.set(ticks);
            CNTV_CTL_EL0.set(ctl::ENABLE);
        }

        fn cancel_deadline(&self) {
            CNTV_CTL_EL0.set(ctl::IMASK);
        }
    }
}
