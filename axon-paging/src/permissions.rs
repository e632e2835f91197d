//! Memory types and access rights

use core::fmt;

/// Memory type for a mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MemoryType {
    /// Normal memory (write-back cacheable, speculative access allowed)
    #[default]
    Normal,
    /// Device memory (nGnRE, no speculation, ordered access)
    Device,
}

/// Kernel access rights. Every mapping is readable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl Access {
    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadWriteExecute)
    }

    #[inline]
    #[must_use]
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::ReadExecute | Self::ReadWriteExecute)
    }

    #[must_use]
    pub const fn from_bits(writable: bool, executable: bool) -> Self {
        match (writable, executable) {
            (false, false) => Self::ReadOnly,
            (true, false) => Self::ReadWrite,
            (false, true) => Self::ReadExecute,
            (true, true) => Self::ReadWriteExecute,
        }
    }
}

/// Attributes applied to every page of a mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapAttributes {
    pub mem_type: MemoryType,
    pub access: Access,
}

impl MapAttributes {
    /// Kernel image: text and data share one writable, executable block at boot
    pub const KERNEL_IMAGE: Self = Self {
        mem_type: MemoryType::Normal,
        access: Access::ReadWriteExecute,
    };

    /// Linear map of RAM: data only
    pub const LINEAR: Self = Self {
        mem_type: MemoryType::Normal,
        access: Access::ReadWrite,
    };

    /// Device registers
    pub const DEVICE: Self = Self {
        mem_type: MemoryType::Device,
        access: Access::ReadWrite,
    };
}

impl fmt::Display for MapAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = match self.mem_type {
            MemoryType::Normal => "normal",
            MemoryType::Device => "device",
        };
        write!(
            f,
            "{} r{}{}",
            ty,
            if self.access.is_writable() { "w" } else { "-" },
            if self.access.is_executable() { "x" } else { "-" }
        )
    }
}
