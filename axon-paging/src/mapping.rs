//! Address mappings and translation
//!
//! A [`MappingTable`] is the complete, immutable result of partitioning.
//! Translation in both directions is a pure lookup over it and never
//! clamps or wraps: anything outside a mapping is
//! [`TranslateError::AddressNotMapped`].

use alloc::vec::Vec;
use core::fmt;

use axon_common::{MemoryRegion, PhysAddr, VirtAddr};

use crate::partition::PartitionError;
use crate::permissions::MapAttributes;

/// Offset class of a mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MappingClass {
    /// Kernel text and data at their link-time addresses
    KernelImage,
    /// Linear map of RAM, also the DMA-capable class
    Linear,
    /// MMIO device registers
    Device,
}

impl MappingClass {
    pub const ALL: [Self; 3] = [Self::KernelImage, Self::Linear, Self::Device];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KernelImage => "kernel-image",
            Self::Linear => "linear",
            Self::Device => "device",
        }
    }

    /// Lookup priority for physical-to-virtual translation
    const fn preference(self) -> u8 {
        match self {
            Self::Linear => 0,
            Self::Device => 1,
            Self::KernelImage => 2,
        }
    }
}

impl fmt::Display for MappingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Translation failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "translation errors must be handled"]
pub enum TranslateError {
    /// The address lies outside every mapping
    AddressNotMapped(u64),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressNotMapped(addr) => write!(f, "address {:#x} is not mapped", addr),
        }
    }
}

/// One physical region placed in the virtual address space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressMapping {
    pub region: MemoryRegion,
    pub class: MappingClass,
    pub virt_base: VirtAddr,
    pub attributes: MapAttributes,
}

impl AddressMapping {
    #[must_use]
    pub const fn new(
        region: MemoryRegion,
        class: MappingClass,
        virt_base: VirtAddr,
        attributes: MapAttributes,
    ) -> Self {
        Self { region, class, virt_base, attributes }
    }

    /// Virtual minus physical, modulo 2^64
    #[must_use]
    pub const fn virtual_offset(&self) -> u64 {
        self.virt_base.as_u64().wrapping_sub(self.region.base.as_u64())
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.region.length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.region.length == 0
    }

    /// Exclusive virtual end. Saturates for a mapping that ends at the top of
    /// the address space.
    #[must_use]
    pub const fn virt_end(&self) -> u64 {
        self.virt_base.as_u64().saturating_add(self.region.length)
    }

    #[must_use]
    pub const fn contains_phys(&self, pa: PhysAddr) -> bool {
        self.region.contains(pa)
    }

    #[must_use]
    pub const fn contains_virt(&self, va: VirtAddr) -> bool {
        match va.checked_offset_from(self.virt_base) {
            Some(off) => off < self.region.length,
            None => false,
        }
    }

    #[must_use]
    pub fn phys_to_virt(&self, pa: PhysAddr) -> Option<VirtAddr> {
        let off = pa.checked_offset_from(self.region.base)?;
        if off >= self.region.length {
            return None;
        }
        self.virt_base.checked_add(off)
    }

    #[must_use]
    pub fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        let off = va.checked_offset_from(self.virt_base)?;
        if off >= self.region.length {
            return None;
        }
        self.region.base.checked_add(off)
    }

    /// Virtual ranges of `self` and `other` intersect
    #[must_use]
    pub const fn virt_overlaps(&self, other: &Self) -> bool {
        self.virt_base.as_u64() < other.virt_end() && other.virt_base.as_u64() < self.virt_end()
    }
}

impl fmt::Display for AddressMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:#014x}..{:#014x} -> {:#018x} ({})",
            self.class.as_str(),
            self.region.base.as_u64(),
            self.region.end(),
            self.virt_base.as_u64(),
            self.attributes
        )
    }
}

/// A non-essential region left out of the layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OmittedRegion {
    pub region: MemoryRegion,
    pub error: PartitionError,
}

/// Complete result of partitioning, sorted by class then physical base
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingTable {
    mappings: Vec<AddressMapping>,
    omitted: Vec<OmittedRegion>,
}

impl MappingTable {
    pub(crate) fn from_parts(
        mut mappings: Vec<AddressMapping>,
        omitted: Vec<OmittedRegion>,
    ) -> Self {
        mappings.sort_by_key(|m| (m.class, m.region.base));
        Self { mappings, omitted }
    }

    #[must_use]
    pub fn mappings(&self) -> &[AddressMapping] {
        &self.mappings
    }

    pub fn iter_class(&self, class: MappingClass) -> impl Iterator<Item = &AddressMapping> + '_ {
        self.mappings.iter().filter(move |m| m.class == class)
    }

    /// Regions that could not be mapped and were left out
    #[must_use]
    pub fn omitted(&self) -> &[OmittedRegion] {
        &self.omitted
    }

    #[must_use]
    pub fn mapping_for_phys(&self, pa: PhysAddr) -> Option<&AddressMapping> {
        self.mappings
            .iter()
            .filter(|m| m.contains_phys(pa))
            .min_by_key(|m| m.class.preference())
    }

    #[must_use]
    pub fn mapping_for_virt(&self, va: VirtAddr) -> Option<&AddressMapping> {
        // Virtual ranges are disjoint so at most one matches
        self.mappings.iter().find(|m| m.contains_virt(va))
    }

    /// Translate a physical address, preferring the linear map, then the
    /// device window, then the kernel image.
    pub fn phys_to_virt(&self, pa: PhysAddr) -> Result<VirtAddr, TranslateError> {
        self.mapping_for_phys(pa)
            .and_then(|m| m.phys_to_virt(pa))
            .ok_or(TranslateError::AddressNotMapped(pa.as_u64()))
    }

    /// Translate a physical address through one class only.
    pub fn phys_to_virt_in(
        &self,
        class: MappingClass,
        pa: PhysAddr,
    ) -> Result<VirtAddr, TranslateError> {
        self.iter_class(class)
            .find_map(|m| m.phys_to_virt(pa))
            .ok_or(TranslateError::AddressNotMapped(pa.as_u64()))
    }

    pub fn virt_to_phys(&self, va: VirtAddr) -> Result<PhysAddr, TranslateError> {
        self.mapping_for_virt(va)
            .and_then(|m| m.virt_to_phys(va))
            .ok_or(TranslateError::AddressNotMapped(va.as_u64()))
    }

    /// Physical range `[pa, pa + len)` lies inside a single mapping
    #[must_use]
    pub fn is_range_mapped(&self, pa: PhysAddr, len: u64) -> bool {
        len != 0 && self.mappings.iter().any(|m| m.region.contains_range(pa, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use axon_common::RegionClass;

    fn region(base: u64, len: u64, class: RegionClass) -> MemoryRegion {
        MemoryRegion::try_new(PhysAddr::new(base), len, class).unwrap()
    }

    fn table() -> MappingTable {
        MappingTable::from_parts(
            vec![
                AddressMapping::new(
                    region(0x4000_0000, 0x1000, RegionClass::Mmio),
                    MappingClass::Device,
                    VirtAddr::new(0xFFFF_FFFE_0000_0000),
                    MapAttributes::DEVICE,
                ),
                AddressMapping::new(
                    region(0x0, 0x4000_0000, RegionClass::Ram),
                    MappingClass::Linear,
                    VirtAddr::new(0xFFFF_8000_0000_0000),
                    MapAttributes::LINEAR,
                ),
                AddressMapping::new(
                    region(0x8_0000, 0x20_0000, RegionClass::Ram),
                    MappingClass::KernelImage,
                    VirtAddr::new(0xFFFF_FFFF_8008_0000),
                    MapAttributes::KERNEL_IMAGE,
                ),
            ],
            vec![],
        )
    }

    #[test]
    fn test_sorted_by_class() {
        let t = table();
        let classes: Vec<_> = t.mappings().iter().map(|m| m.class).collect();
        assert_eq!(
            classes,
            vec![MappingClass::KernelImage, MappingClass::Linear, MappingClass::Device]
        );
    }

    #[test]
    fn test_linear_preferred_over_image() {
        let t = table();
        let va = t.phys_to_virt(PhysAddr::new(0x9_0000)).unwrap();
        assert_eq!(va.as_u64(), 0xFFFF_8000_0009_0000);
        let img = t.phys_to_virt_in(MappingClass::KernelImage, PhysAddr::new(0x9_0000)).unwrap();
        assert_eq!(img.as_u64(), 0xFFFF_FFFF_8009_0000);
        assert_eq!(t.virt_to_phys(img).unwrap(), PhysAddr::new(0x9_0000));
    }

    #[test]
    fn test_unmapped_addresses() {
        let t = table();
        assert_eq!(
            t.phys_to_virt(PhysAddr::new(0x4000_1000)),
            Err(TranslateError::AddressNotMapped(0x4000_1000))
        );
        assert_eq!(
            t.virt_to_phys(VirtAddr::new(0xFFFF_FFFE_0000_1000)),
            Err(TranslateError::AddressNotMapped(0xFFFF_FFFE_0000_1000))
        );
        assert!(t.virt_to_phys(VirtAddr::new(0x1000)).is_err());
        assert!(
            t.phys_to_virt_in(MappingClass::Device, PhysAddr::new(0x1000)).is_err()
        );
    }

    #[test]
    fn test_offsets_and_ranges() {
        let t = table();
        let dev = t.iter_class(MappingClass::Device).next().unwrap();
        assert_eq!(dev.virtual_offset(), 0xFFFF_FFFE_0000_0000u64.wrapping_sub(0x4000_0000));
        assert!(t.is_range_mapped(PhysAddr::new(0x3FFF_F000), 0x1000));
        assert!(!t.is_range_mapped(PhysAddr::new(0x3FFF_F000), 0x2000));
        assert!(!t.is_range_mapped(PhysAddr::new(0x0), 0));
    }
}
