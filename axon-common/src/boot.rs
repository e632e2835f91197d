//! Boot-time Facts
//!
//! Types describing what the kernel knows about itself and the processor
//! set at the moment control arrives from firmware.

use core::fmt;

use crate::addr::{PhysAddr, VirtAddr};

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 8;

/// Size of each per-core kernel stack
pub const KERNEL_STACK_SIZE: u64 = 64 * 1024;

/// Logical core identifier (dense, `0..MAX_CPUS`)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CoreId(pub u32);

impl CoreId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Where the kernel image was loaded and where it was linked.
///
/// The kernel-image mapping keeps link-time virtual addresses valid by
/// using `link_base - load_base` as its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    /// Physical address the image was loaded at
    pub load_base: PhysAddr,
    /// Virtual address the image was linked at
    pub link_base: VirtAddr,
    /// Image size in bytes (text, data and bss)
    pub size: u64,
}

impl KernelImage {
    #[must_use]
    pub const fn new(load_base: PhysAddr, link_base: VirtAddr, size: u64) -> Self {
        Self {
            load_base,
            link_base,
            size,
        }
    }

    /// Exclusive physical end
    #[must_use]
    pub const fn load_end(&self) -> u64 {
        self.load_base.as_u64().saturating_add(self.size)
    }
}

/// Initial stack handed to a core at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialStack {
    /// Physical address of the stack base (low address)
    pub phys_base: PhysAddr,
    /// Virtual address of the stack top (where SP starts)
    pub virt_top: VirtAddr,
}

impl InitialStack {
    #[must_use]
    pub const fn new(phys_base: PhysAddr, virt_top: VirtAddr) -> Self {
        Self {
            phys_base,
            virt_top,
        }
    }

    /// Check if this stack info is valid (non-zero addresses).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        !self.phys_base.is_null() && !self.virt_top.is_null()
    }
}
