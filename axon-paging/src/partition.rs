//! Address space partitioning
//!
//! [`compute_mappings`] places every region into one of three offset
//! classes:
//!
//! | Class         | Source regions                 | Virtual placement                         |
//! |---------------|--------------------------------|-------------------------------------------|
//! | `KernelImage` | the loaded kernel image        | its link address                          |
//! | `Linear`      | RAM, Reserved without `no-map` | `linear_base + pa`                        |
//! | `Device`      | MMIO                           | `device_base + cluster start + (pa - anchor)` |
//!
//! Linear mappings never cover an MMIO window, so every physical address has
//! at most one attribute set outside the kernel image. MMIO is grouped into
//! clusters: the first is anchored at the lowest MMIO base, and a window too
//! far from its cluster's anchor to fit opens a new cluster placed after the
//! previous one.
//!
//! Regions must be 4KB aligned in base and length. The kernel image and the
//! RAM containing it are essential and fail the whole layout; anything else
//! that cannot be mapped is left out and reported through
//! [`MappingTable::omitted`].

use alloc::vec::Vec;
use core::fmt;

use axon_common::memory::RegionFlags;
use axon_common::{KernelImage, MemoryRegion, PhysAddr, RegionClass, VirtAddr};

use crate::PAGE_SIZE;
use crate::mapping::{AddressMapping, MappingClass, MappingTable, OmittedRegion};
use crate::permissions::MapAttributes;

/// Base of the linear map of RAM
pub const LINEAR_WINDOW_BASE: u64 = 0xFFFF_8000_0000_0000;
/// Size of the linear map window (64TB)
pub const LINEAR_WINDOW_SIZE: u64 = 1 << 46;

/// Base of the device register window
pub const DEVICE_WINDOW_BASE: u64 = 0xFFFF_FFFE_0000_0000;
/// Size of the device register window (4GB)
pub const DEVICE_WINDOW_SIZE: u64 = 1 << 32;

/// Base of the kernel image window (top 2GB)
pub const KERNEL_WINDOW_BASE: u64 = 0xFFFF_FFFF_8000_0000;
/// Size of the kernel image window
pub const KERNEL_WINDOW_SIZE: u64 = 1 << 31;

/// Why a region could not be mapped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmappableReason {
    /// Base or length is not a multiple of the granule
    Misaligned,
    /// The region does not fit its class's virtual window
    WindowOverflow,
    /// The kernel image is not inside RAM
    ImageOutsideRam,
    /// Two mappings would share virtual addresses
    VirtualOverlap,
}

impl UnmappableReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Misaligned => "not granule aligned",
            Self::WindowOverflow => "does not fit its virtual window",
            Self::ImageOutsideRam => "kernel image outside RAM",
            Self::VirtualOverlap => "virtual range collides with another mapping",
        }
    }
}

/// Partitioning failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "partition errors must be handled"]
pub enum PartitionError {
    UnmappableRegion {
        region: MemoryRegion,
        reason: UnmappableReason,
    },
}

impl PartitionError {
    const fn unmappable(region: MemoryRegion, reason: UnmappableReason) -> Self {
        Self::UnmappableRegion { region, reason }
    }
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmappableRegion { region, reason } => write!(
                f,
                "unmappable {} region {:#x}..{:#x}: {}",
                region.class.as_str(),
                region.base.as_u64(),
                region.end(),
                reason.as_str()
            ),
        }
    }
}

/// Virtual placement of each class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutPolicy {
    pub linear_base: u64,
    pub linear_size: u64,
    pub device_base: u64,
    /// Total virtual space for MMIO. Clusters are packed into it in
    /// physical order; a window that fits in no remaining space is omitted.
    pub device_size: u64,
    pub kernel_base: u64,
    pub kernel_size: u64,
    /// Minimum mapping granule (power of two)
    pub granule: u64,
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        Self {
            linear_base: LINEAR_WINDOW_BASE,
            linear_size: LINEAR_WINDOW_SIZE,
            device_base: DEVICE_WINDOW_BASE,
            device_size: DEVICE_WINDOW_SIZE,
            kernel_base: KERNEL_WINDOW_BASE,
            kernel_size: KERNEL_WINDOW_SIZE,
            granule: PAGE_SIZE,
        }
    }
}

/// `[offset, offset + len)` fits a window of `size` bytes
const fn fits(offset: u64, len: u64, size: u64) -> bool {
    offset <= size && len <= size - offset
}

/// Compute the virtual layout for `regions`.
///
/// The result depends only on the inputs: regions are sorted before
/// placement, so any permutation of the same set gives the same table.
pub fn compute_mappings(
    regions: &[MemoryRegion],
    image: &KernelImage,
    policy: &LayoutPolicy,
) -> Result<MappingTable, PartitionError> {
    let mut sorted: Vec<MemoryRegion> = regions.to_vec();
    sorted.sort_by_key(|r| (r.base, r.class, r.length));

    let mut mappings = Vec::new();
    let mut omitted = Vec::new();
    let granule = policy.granule;

    // Kernel image
    let image_len = image.size.div_ceil(granule).saturating_mul(granule);
    let image_region = MemoryRegion::try_new(image.load_base, image_len.max(granule), RegionClass::Ram)
        .ok_or_else(|| {
            let stub = MemoryRegion {
                base: image.load_base,
                length: granule,
                class: RegionClass::Ram,
                flags: RegionFlags::NONE,
            };
            PartitionError::unmappable(stub, UnmappableReason::WindowOverflow)
        })?;

    if !image.load_base.is_aligned(granule) || !image.link_base.is_aligned(granule) {
        return Err(PartitionError::unmappable(image_region, UnmappableReason::Misaligned));
    }
    let in_window = image
        .link_base
        .as_u64()
        .checked_sub(policy.kernel_base)
        .is_some_and(|off| fits(off, image_region.length, policy.kernel_size));
    if !in_window {
        return Err(PartitionError::unmappable(image_region, UnmappableReason::WindowOverflow));
    }
    let host = sorted
        .iter()
        .find(|r| r.class != RegionClass::Mmio && r.contains_range(image_region.base, image_region.length))
        .copied();
    let Some(host) = host else {
        return Err(PartitionError::unmappable(image_region, UnmappableReason::ImageOutsideRam));
    };
    mappings.push(AddressMapping::new(
        image_region,
        MappingClass::KernelImage,
        image.link_base,
        MapAttributes::KERNEL_IMAGE,
    ));

    let mmio: Vec<MemoryRegion> =
        sorted.iter().filter(|r| r.class == RegionClass::Mmio).copied().collect();

    // Linear map, never covering an MMIO window
    for region in sorted.iter().filter(|r| r.class != RegionClass::Mmio) {
        if region.class == RegionClass::Reserved && region.flags.contains(RegionFlags::NO_MAP) {
            continue;
        }
        let essential = *region == host;
        for piece in without_mmio(region, &mmio) {
            let reason = if !piece.is_granule_aligned(granule) {
                Some(UnmappableReason::Misaligned)
            } else if !fits(piece.base.as_u64(), piece.length, policy.linear_size) {
                Some(UnmappableReason::WindowOverflow)
            } else {
                None
            };
            if let Some(reason) = reason {
                let err = PartitionError::unmappable(piece, reason);
                if essential {
                    return Err(err);
                }
                log::warn!("paging: omitting {}", err);
                omitted.push(OmittedRegion { region: piece, error: err });
                continue;
            }
            mappings.push(AddressMapping::new(
                piece,
                MappingClass::Linear,
                VirtAddr::new(policy.linear_base + piece.base.as_u64()),
                MapAttributes::LINEAR,
            ));
        }
    }

    // Device window, one cluster per run of MMIO that fits from its anchor
    let mut cluster: Option<(PhysAddr, u64)> = None;
    let mut cursor = 0u64;
    for region in &mmio {
        if !region.is_granule_aligned(granule) {
            let err = PartitionError::unmappable(*region, UnmappableReason::Misaligned);
            log::warn!("paging: omitting {}", err);
            omitted.push(OmittedRegion { region: *region, error: err });
            continue;
        }
        let in_cluster = cluster
            .and_then(|(origin, start)| start.checked_add(region.base.as_u64() - origin.as_u64()))
            .filter(|&offset| fits(offset, region.length, policy.device_size));
        let offset = match in_cluster {
            Some(offset) => offset,
            None if fits(cursor, region.length, policy.device_size) => {
                if cluster.is_some() {
                    log::debug!("paging: new device cluster at {:#x}", region.base.as_u64());
                }
                cluster = Some((region.base, cursor));
                cursor
            }
            None => {
                let err = PartitionError::unmappable(*region, UnmappableReason::WindowOverflow);
                log::warn!("paging: omitting {}", err);
                omitted.push(OmittedRegion { region: *region, error: err });
                continue;
            }
        };
        cursor = cursor.max((offset + region.length).div_ceil(granule) * granule);
        mappings.push(AddressMapping::new(
            *region,
            MappingClass::Device,
            VirtAddr::new(policy.device_base + offset),
            MapAttributes::DEVICE,
        ));
    }

    check_disjoint(&mut mappings)?;

    let table = MappingTable::from_parts(mappings, omitted);
    for m in table.mappings() {
        log::debug!("paging: {}", m);
    }
    Ok(table)
}

/// The parts of `region` outside every MMIO window (`mmio` sorted by base)
fn without_mmio(region: &MemoryRegion, mmio: &[MemoryRegion]) -> Vec<MemoryRegion> {
    if !mmio.iter().any(|w| w.overlaps(region)) {
        return alloc::vec![*region];
    }
    log::debug!(
        "paging: {:#x}..{:#x} shares addresses with MMIO, trimming linear map",
        region.base.as_u64(),
        region.end()
    );
    let mut pieces = Vec::new();
    let mut cursor = region.base.as_u64();
    for window in mmio.iter().filter(|w| w.overlaps(region)) {
        if window.base.as_u64() > cursor {
            let end = window.base.as_u64().min(region.end());
            pieces.extend(
                MemoryRegion::try_new(PhysAddr::new(cursor), end - cursor, region.class)
                    .map(|p| p.with_flags(region.flags)),
            );
        }
        cursor = cursor.max(window.end());
    }
    if cursor < region.end() {
        pieces.extend(
            MemoryRegion::try_new(PhysAddr::new(cursor), region.end() - cursor, region.class)
                .map(|p| p.with_flags(region.flags)),
        );
    }
    pieces
}

fn check_disjoint(mappings: &mut [AddressMapping]) -> Result<(), PartitionError> {
    mappings.sort_by_key(|m| m.virt_base);
    for pair in mappings.windows(2) {
        if pair[0].virt_overlaps(&pair[1]) {
            return Err(PartitionError::unmappable(pair[1].region, UnmappableReason::VirtualOverlap));
        }
    }
    Ok(())
}
