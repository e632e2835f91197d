//! PSCI (Power State Coordination Interface)
//!
//! Firmware calls used for secondary core power-on and system power-off.
//! The conduit (SMC vs HVC) comes from the hardware descriptor.
//!
//! Callers go through the [`CpuFirmware`] and [`PowerControl`] traits; the
//! real implementation ([`Psci`]) only exists on aarch64.
//!
//! Reference: ARM DEN0022D - Power State Coordination Interface

use core::fmt;

use axon_common::PhysAddr;

// -- PSCI Function IDs (SMC64 convention for 64-bit calls)

/// Get PSCI version
pub const PSCI_VERSION: u32 = 0x8400_0000;

/// CPU_ON - Start a CPU at a given entry point
pub const CPU_ON_64: u32 = 0xC400_0003;

/// AFFINITY_INFO - Query power state of a CPU
pub const AFFINITY_INFO_64: u32 = 0xC400_0004;

/// SYSTEM_OFF - Power off the system
pub const SYSTEM_OFF: u32 = 0x8400_0008;

/// SYSTEM_RESET - Reset the system
pub const SYSTEM_RESET: u32 = 0x8400_0009;

/// How PSCI calls reach firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciConduit {
    /// Secure Monitor Call, handled at EL3 (e.g. TF-A)
    Smc,
    /// Hypervisor Call, handled at EL2 (e.g. QEMU, KVM)
    Hvc,
}

/// PSCI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PsciError {
    /// Operation not supported
    NotSupported = -1,
    /// Invalid parameters
    InvalidParameters = -2,
    /// Operation denied
    Denied = -3,
    /// CPU already on
    AlreadyOn = -4,
    /// CPU on pending
    OnPending = -5,
    /// Internal failure
    InternalFailure = -6,
    /// CPU not present
    NotPresent = -7,
    /// CPU disabled
    Disabled = -8,
    /// Invalid address
    InvalidAddress = -9,
}

impl PsciError {
    /// Decode a non-zero firmware return value.
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value as i32 {
            -1 => Self::NotSupported,
            -2 => Self::InvalidParameters,
            -3 => Self::Denied,
            -4 => Self::AlreadyOn,
            -5 => Self::OnPending,
            -7 => Self::NotPresent,
            -8 => Self::Disabled,
            -9 => Self::InvalidAddress,
            _ => Self::InternalFailure,
        }
    }

    /// Errors after which another `CPU_ON` attempt is pointless
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::NotSupported | Self::InvalidParameters | Self::NotPresent | Self::Disabled
                | Self::InvalidAddress
        )
    }
}

impl fmt::Display for PsciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotSupported => "not supported",
            Self::InvalidParameters => "invalid parameters",
            Self::Denied => "denied",
            Self::AlreadyOn => "already on",
            Self::OnPending => "on pending",
            Self::InternalFailure => "internal failure",
            Self::NotPresent => "not present",
            Self::Disabled => "disabled",
            Self::InvalidAddress => "invalid address",
        };
        write!(f, "psci: {}", msg)
    }
}

/// Affinity level states returned by AFFINITY_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AffinityState {
    On = 0,
    Off = 1,
    OnPending = 2,
}

/// Firmware services used to start cores.
pub trait CpuFirmware: Send + Sync {
    /// Power on `mpidr` at physical `entry`, passing `context` in x0.
    fn cpu_on(&self, mpidr: u64, entry: PhysAddr, context: u64) -> Result<(), PsciError>;

    /// Query the power state of `mpidr`.
    fn affinity_info(&self, mpidr: u64) -> Result<AffinityState, PsciError>;
}

/// Firmware services for whole-system power state.
pub trait PowerControl: Send + Sync {
    /// Power the system off. Does not return on success.
    fn system_off(&self) -> Result<(), PsciError>;

    /// Reset the system. Does not return on success.
    fn system_reset(&self) -> Result<(), PsciError>;
}

#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
fn decode_status(result: i64) -> Result<(), PsciError> {
    if result == 0 {
        Ok(())
    } else {
        Err(PsciError::from_i64(result))
    }
}

#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
fn decode_affinity(result: i64) -> Result<AffinityState, PsciError> {
    match result {
        0 => Ok(AffinityState::On),
        1 => Ok(AffinityState::Off),
        2 => Ok(AffinityState::OnPending),
        _ => Err(PsciError::from_i64(result)),
    }
}

/// PSCI firmware reached through the configured conduit
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy)]
pub struct Psci {
    conduit: PsciConduit,
}

#[cfg(target_arch = "aarch64")]
impl Psci {
    #[must_use]
    pub const fn new(conduit: PsciConduit) -> Self {
        Self { conduit }
    }

    /// Issue a PSCI call.
    ///
    /// # Safety
    /// The caller must ensure the function ID and arguments are valid.
    #[inline]
    unsafe fn call(&self, func: u32, arg0: u64, arg1: u64, arg2: u64) -> i64 {
        let result: i64;
        match self.conduit {
            // SAFETY: caller upholds the PSCI calling contract.
            PsciConduit::Smc => unsafe {
                core::arch::asm!(
                    "smc #0",
                    inout("x0") func as u64 => result,
                    inout("x1") arg0 => _,
                    inout("x2") arg1 => _,
                    inout("x3") arg2 => _,
                    options(nomem, nostack)
                );
            },
            // SAFETY: caller upholds the PSCI calling contract.
            PsciConduit::Hvc => unsafe {
                core::arch::asm!(
                    "hvc #0",
                    inout("x0") func as u64 => result,
                    inout("x1") arg0 => _,
                    inout("x2") arg1 => _,
                    inout("x3") arg2 => _,
                    options(nomem, nostack)
                );
            },
        }
        result
    }

    /// Get the PSCI version supported by firmware as (major, minor).
    pub fn version(&self) -> (u16, u16) {
        // SAFETY: PSCI_VERSION takes no arguments and has no side effects
        let v = unsafe { self.call(PSCI_VERSION, 0, 0, 0) };
        (((v >> 16) & 0xFFFF) as u16, (v & 0xFFFF) as u16)
    }
}

#[cfg(target_arch = "aarch64")]
impl CpuFirmware for Psci {
    fn cpu_on(&self, mpidr: u64, entry: PhysAddr, context: u64) -> Result<(), PsciError> {
        // SAFETY: entry is the kernel's secondary entry stub, prepared to run
        // with the MMU off on a freshly powered core.
        decode_status(unsafe { self.call(CPU_ON_64, mpidr, entry.as_u64(), context) })
    }

    fn affinity_info(&self, mpidr: u64) -> Result<AffinityState, PsciError> {
        // SAFETY: AFFINITY_INFO only reads firmware state
        decode_affinity(unsafe { self.call(AFFINITY_INFO_64, mpidr, 0, 0) })
    }
}

#[cfg(target_arch = "aarch64")]
impl PowerControl for Psci {
    fn system_off(&self) -> Result<(), PsciError> {
        // SAFETY: SYSTEM_OFF does not return on success
        decode_status(unsafe { self.call(SYSTEM_OFF, 0, 0, 0) })
    }

    fn system_reset(&self) -> Result<(), PsciError> {
        // SAFETY: SYSTEM_RESET does not return on success
        decode_status(unsafe { self.call(SYSTEM_RESET, 0, 0, 0) })
    }
}
