//! Memory Regions
//!
//! A [`MemoryRegion`] is one physical range discovered from the hardware
//! descriptor. The set of regions is resolved once per boot and never
//! mutated afterwards.

use core::fmt;

use crate::addr::PhysAddr;

/// Classification of a physical range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RegionClass {
    /// Conventional RAM, usable by the kernel and DMA-capable
    Ram = 0,
    /// RAM that must not be handed out (firmware, carve-outs, boot blobs)
    Reserved = 1,
    /// Memory-mapped device registers
    Mmio = 2,
}

impl RegionClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ram => "ram",
            Self::Reserved => "reserved",
            Self::Mmio => "mmio",
        }
    }
}

/// Region flags carried through from the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RegionFlags(u8);

impl RegionFlags {
    /// No flags set
    pub const NONE: Self = Self(0);
    /// Reserved range must not be mapped at all (device-tree `no-map`)
    pub const NO_MAP: Self = Self(1 << 0);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// A physical range `[base, base + length)` with its class
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    /// Physical start address
    pub base: PhysAddr,
    /// Length in bytes (never zero)
    pub length: u64,
    /// Region class
    pub class: RegionClass,
    /// Descriptor flags
    pub flags: RegionFlags,
}

impl MemoryRegion {
    /// Create a region, rejecting empty ranges and ranges that wrap past
    /// the top of the physical address space.
    #[must_use]
    pub const fn try_new(base: PhysAddr, length: u64, class: RegionClass) -> Option<Self> {
        if length == 0 || base.as_u64().checked_add(length).is_none() {
            return None;
        }
        Some(Self {
            base,
            length,
            class,
            flags: RegionFlags::NONE,
        })
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: RegionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Exclusive end address
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.length)
    }

    #[must_use]
    pub const fn contains(&self, addr: PhysAddr) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end()
    }

    /// Check if `[base, base+len)` lies entirely within this region
    #[must_use]
    pub const fn contains_range(&self, base: PhysAddr, len: u64) -> bool {
        match base.as_u64().checked_add(len) {
            Some(end) => base.as_u64() >= self.base.as_u64() && end <= self.end(),
            None => false,
        }
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base.as_u64() < other.end() && other.base.as_u64() < self.end()
    }

    /// Base and length both multiples of `granule` (a power of two)
    #[must_use]
    pub const fn is_granule_aligned(&self, granule: u64) -> bool {
        self.base.is_aligned(granule) && self.length & (granule - 1) == 0
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion({} [{:#x}..{:#x}))",
            self.class.as_str(),
            self.base.as_u64(),
            self.end()
        )
    }
}

/// Page size constants
pub mod page {
    /// 4KB page size, the minimum mapping granule
    pub const SIZE_4K: u64 = 4096;
    /// 2MB block size
    pub const SIZE_2M: u64 = 2 * 1024 * 1024;
    /// 1GB block size
    pub const SIZE_1G: u64 = 1024 * 1024 * 1024;

    /// 4KB page shift
    pub const SHIFT_4K: u32 = 12;

    const _: () = assert!(SIZE_4K.is_power_of_two(), "SIZE_4K must be a power of two");
    const _: () = assert!(1 << SHIFT_4K == SIZE_4K, "SHIFT_4K must match SIZE_4K");
    const _: () = assert!(SIZE_2M % SIZE_4K == 0, "2MB block must be page-aligned");

    #[must_use]
    pub const fn align_up_4k(addr: u64) -> u64 {
        (addr + (SIZE_4K - 1)) & !(SIZE_4K - 1)
    }

    #[must_use]
    pub const fn is_aligned_4k(addr: u64) -> bool {
        addr & (SIZE_4K - 1) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, len: u64, class: RegionClass) -> MemoryRegion {
        MemoryRegion::try_new(PhysAddr::new(base), len, class).unwrap()
    }

    #[test]
    fn test_try_new_rejects_empty_and_wrapping() {
        assert!(MemoryRegion::try_new(PhysAddr::new(0x1000), 0, RegionClass::Ram).is_none());
        assert!(MemoryRegion::try_new(PhysAddr::new(u64::MAX), 2, RegionClass::Ram).is_none());
    }

    #[test]
    fn test_adjacent_regions_do_not_overlap() {
        let ram = region(0, 0x4000_0000, RegionClass::Ram);
        let mmio = region(0x4000_0000, 0x10_0000, RegionClass::Mmio);
        assert!(!ram.overlaps(&mmio));
        assert!(!mmio.overlaps(&ram));
    }

    #[test]
    fn test_overlap_and_containment() {
        let a = region(0x1000, 0x3000, RegionClass::Ram);
        let b = region(0x3000, 0x2000, RegionClass::Ram);
        assert!(a.overlaps(&b));
        assert!(a.contains(PhysAddr::new(0x3FFF)));
        assert!(!a.contains(PhysAddr::new(0x4000)));
        assert!(a.contains_range(PhysAddr::new(0x2000), 0x2000));
        assert!(!a.contains_range(PhysAddr::new(0x2000), 0x2001));
    }

    #[test]
    fn test_granule_alignment() {
        assert!(region(0x2000, 0x1000, RegionClass::Mmio).is_granule_aligned(page::SIZE_4K));
        assert!(!region(0x2000, 0x100, RegionClass::Mmio).is_granule_aligned(page::SIZE_4K));
        assert!(!region(0x2800, 0x1000, RegionClass::Mmio).is_granule_aligned(page::SIZE_4K));
    }

    #[test]
    fn test_flags() {
        let r = region(0x1000, 0x1000, RegionClass::Reserved).with_flags(RegionFlags::NO_MAP);
        assert!(r.flags.contains(RegionFlags::NO_MAP));
        assert!(!RegionFlags::NONE.contains(RegionFlags::NO_MAP));
    }
}
