//! Hardware Descriptor Resolution
//!
//! Parses the boot-time hardware description blob into a normalised,
//! immutable [`PlatformDescriptor`]. Two encodings are understood:
//!
//! - a flattened device tree (magic `0xd00dfeed`), see [`fdt`](self::fdt)
//! - the axon firmware table (signature `AXFW`), see [`fwtable`]
//!
//! Both parsers only collect raw facts into a [`RawDescriptor`]; the
//! consistency rules (overlaps, carve-outs, core limits) are applied once, in
//! [`normalise`], so callers never branch on the source format.
//!
//! The snapshot owns all of its data. Nothing in it borrows from the blob,
//! which may live in memory that is reclaimed after boot.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use axon_common::memory::RegionFlags;
use axon_common::{CoreId, MAX_CPUS, MemoryRegion, PhysAddr, RegionClass};

use crate::psci::PsciConduit;

pub mod fdt;
pub mod fwtable;

#[cfg(any(test, feature = "blob-builder"))]
pub mod builder;

/// Upper bound accepted for a descriptor blob (4MB)
pub const DESCRIPTOR_MAX_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced while resolving a descriptor.
///
/// Every variant means the blob cannot be trusted as a description of the
/// machine. Boot treats all of them as fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "descriptor errors must be handled"]
pub enum MalformedDescriptor {
    /// Neither a device tree nor a firmware table
    UnknownFormat,
    /// The header is inconsistent or rejected by the parser
    BadHeader,
    /// The blob ends before a structure it declares
    Truncated,
    /// Firmware table bytes do not sum to zero
    ChecksumMismatch,
    /// Firmware table revision this kernel does not understand
    UnsupportedRevision(u16),
    /// A required node or table section is absent
    MissingNode(&'static str),
    /// A required property is absent
    MissingProperty {
        node: &'static str,
        property: &'static str,
    },
    /// A property or entry could not be decoded
    InvalidData(&'static str),
    /// A range is empty or wraps past the end of the address space
    InvalidRange { base: u64, length: u64 },
    /// Two regions of the same class claim overlapping memory
    OverlappingRegions {
        first: MemoryRegion,
        second: MemoryRegion,
    },
    /// A device window overlaps RAM that was not reserved first
    MmioOverlapsRam { window: MemoryRegion },
    /// More enabled cores than the kernel supports
    TooManyCores(usize),
    /// Two cores share the same hardware affinity
    DuplicateCore(u64),
}

impl fmt::Display for MalformedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFormat => write!(f, "unrecognised descriptor format"),
            Self::BadHeader => write!(f, "descriptor header is invalid"),
            Self::Truncated => write!(f, "descriptor is truncated"),
            Self::ChecksumMismatch => write!(f, "firmware table checksum mismatch"),
            Self::UnsupportedRevision(rev) => {
                write!(f, "unsupported firmware table revision {}", rev)
            }
            Self::MissingNode(node) => write!(f, "required node '{}' is missing", node),
            Self::MissingProperty { node, property } => {
                write!(f, "node '{}' is missing property '{}'", node, property)
            }
            Self::InvalidData(what) => write!(f, "invalid {}", what),
            Self::InvalidRange { base, length } => {
                write!(f, "invalid range base={:#x} length={:#x}", base, length)
            }
            Self::OverlappingRegions { first, second } => {
                write!(f, "overlapping regions {:?} and {:?}", first, second)
            }
            Self::MmioOverlapsRam { window } => {
                write!(f, "device window {:?} overlaps unreserved RAM", window)
            }
            Self::TooManyCores(n) => {
                write!(f, "{} cores described, at most {} supported", n, MAX_CPUS)
            }
            Self::DuplicateCore(mpidr) => write!(f, "duplicate core affinity {:#x}", mpidr),
        }
    }
}

/// Which encoding the descriptor arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    DeviceTree,
    FirmwareTable,
}

/// How a secondary core is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableMethod {
    /// PSCI `CPU_ON`
    Psci,
    /// Spin-table: write the entry point to `release_addr` and send an event
    SpinTable { release_addr: PhysAddr },
}

/// Per-core boot metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreInfo {
    /// Dense logical id assigned in descriptor order
    pub core_id: CoreId,
    /// MPIDR affinity value used by firmware
    pub mpidr: u64,
    pub enable_method: EnableMethod,
}

/// Interrupt trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

/// One entry of the interrupt routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRoute {
    /// Name of the device raising the interrupt
    pub source: String,
    /// GIC interrupt id
    pub irq: u32,
    pub trigger: Trigger,
}

/// What a device window is used for by the platform layer itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceKind {
    Generic = 0,
    Console = 1,
    InterruptController = 2,
    Timer = 3,
    Accelerator = 4,
}

impl DeviceKind {
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Console,
            2 => Self::InterruptController,
            3 => Self::Timer,
            4 => Self::Accelerator,
            _ => Self::Generic,
        }
    }
}

/// An MMIO window belonging to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceWindow {
    /// Node name, e.g. `uart@40000000`
    pub name: String,
    /// First compatible string, empty if none
    pub compatible: String,
    pub base: PhysAddr,
    pub length: u64,
    /// Interrupt ids raised by the device, in descriptor order
    pub irqs: Vec<u32>,
    pub kind: DeviceKind,
}

impl DeviceWindow {
    #[must_use]
    pub fn region(&self) -> Option<MemoryRegion> {
        MemoryRegion::try_new(self.base, self.length, RegionClass::Mmio)
    }
}

/// A named reserved range (e.g. an accelerator buffer pool)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedArea {
    pub name: String,
    pub region: MemoryRegion,
}

/// Facts collected by a format parser before normalisation
#[derive(Debug, Default)]
pub struct RawDescriptor {
    pub model: String,
    pub bootargs: String,
    pub ram: Vec<(u64, u64)>,
    pub reserved: Vec<(String, u64, u64, RegionFlags)>,
    pub has_reserved_section: bool,
    pub windows: Vec<DeviceWindow>,
    pub cores: Vec<(u64, EnableMethod)>,
    pub routes: Vec<InterruptRoute>,
    pub timer_irq: Option<u32>,
    pub timer_frequency: Option<u32>,
    pub psci: Option<PsciConduit>,
}

/// Normalised, immutable description of the machine
#[derive(Debug, Clone)]
pub struct PlatformDescriptor {
    format: DescriptorFormat,
    model: String,
    bootargs: String,
    regions: Vec<MemoryRegion>,
    reserved_areas: Vec<ReservedArea>,
    windows: Vec<DeviceWindow>,
    routes: Vec<InterruptRoute>,
    cores: Vec<CoreInfo>,
    timer_irq: u32,
    timer_frequency: Option<u32>,
    psci: PsciConduit,
}

/// Default virtual timer PPI when the descriptor does not name one
pub const DEFAULT_TIMER_IRQ: u32 = 27;

impl PlatformDescriptor {
    #[must_use]
    pub fn format(&self) -> DescriptorFormat {
        self.format
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Kernel command line (`key=value` tokens), empty if none
    #[must_use]
    pub fn bootargs(&self) -> &str {
        &self.bootargs
    }

    /// All regions, sorted by base address
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn regions_of(&self, class: RegionClass) -> impl Iterator<Item = &MemoryRegion> + '_ {
        self.regions.iter().filter(move |r| r.class == class)
    }

    #[must_use]
    pub fn reserved_areas(&self) -> &[ReservedArea] {
        &self.reserved_areas
    }

    #[must_use]
    pub fn find_reserved(&self, name: &str) -> Option<&ReservedArea> {
        self.reserved_areas
            .iter()
            .find(|a| a.name == name || a.name.split('@').next() == Some(name))
    }

    #[must_use]
    pub fn windows(&self) -> &[DeviceWindow] {
        &self.windows
    }

    #[must_use]
    pub fn find_window(&self, compatible: &str) -> Option<&DeviceWindow> {
        self.windows.iter().find(|w| w.compatible == compatible)
    }

    #[must_use]
    pub fn console(&self) -> Option<&DeviceWindow> {
        self.windows.iter().find(|w| w.kind == DeviceKind::Console)
    }

    #[must_use]
    pub fn accelerator(&self) -> Option<&DeviceWindow> {
        self.windows.iter().find(|w| w.kind == DeviceKind::Accelerator)
    }

    #[must_use]
    pub fn interrupts(&self) -> &[InterruptRoute] {
        &self.routes
    }

    #[must_use]
    pub fn cores(&self) -> &[CoreInfo] {
        &self.cores
    }

    #[must_use]
    pub fn core_by_mpidr(&self, mpidr: u64) -> Option<&CoreInfo> {
        self.cores.iter().find(|c| c.mpidr == mpidr)
    }

    #[must_use]
    pub fn timer_irq(&self) -> u32 {
        self.timer_irq
    }

    /// Counter frequency override, `None` to trust the hardware register
    #[must_use]
    pub fn timer_frequency(&self) -> Option<u32> {
        self.timer_frequency
    }

    #[must_use]
    pub fn psci_conduit(&self) -> PsciConduit {
        self.psci
    }
}

/// Resolve a descriptor blob of either format.
pub fn resolve(blob: &[u8]) -> Result<PlatformDescriptor, MalformedDescriptor> {
    if blob.len() < 4 {
        return Err(MalformedDescriptor::Truncated);
    }

    let (raw, format) = if blob[..4] == fdt::FDT_MAGIC.to_be_bytes() {
        (fdt::parse(blob)?, DescriptorFormat::DeviceTree)
    } else if blob[..4] == fwtable::SIGNATURE {
        (fwtable::parse(blob)?, DescriptorFormat::FirmwareTable)
    } else {
        return Err(MalformedDescriptor::UnknownFormat);
    };

    let descriptor = normalise(raw, format)?;
    log::debug!(
        "descriptor: {:?} '{}' with {} regions, {} windows, {} cores",
        descriptor.format,
        descriptor.model,
        descriptor.regions.len(),
        descriptor.windows.len(),
        descriptor.cores.len()
    );
    Ok(descriptor)
}

/// Resolve a descriptor given only its address.
///
/// The blob's own header supplies its size, bounded by `max_len`.
///
/// # Safety
///
/// `ptr` must be readable for `max_len` bytes for the duration of the call.
pub unsafe fn resolve_raw(
    ptr: *const u8,
    max_len: usize,
) -> Result<PlatformDescriptor, MalformedDescriptor> {
    if ptr.is_null() {
        return Err(MalformedDescriptor::BadHeader);
    }
    let max_len = max_len.min(DESCRIPTOR_MAX_SIZE);
    if max_len < 8 {
        return Err(MalformedDescriptor::Truncated);
    }

    // SAFETY: caller guarantees `max_len` readable bytes at `ptr`.
    let head = unsafe { core::slice::from_raw_parts(ptr, 8) };
    let declared = if head[..4] == fdt::FDT_MAGIC.to_be_bytes() {
        u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize
    } else if head[..4] == fwtable::SIGNATURE {
        u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize
    } else {
        return Err(MalformedDescriptor::UnknownFormat);
    };
    if declared > max_len {
        return Err(MalformedDescriptor::Truncated);
    }

    // SAFETY: `declared <= max_len`, covered by the caller's guarantee.
    let blob = unsafe { core::slice::from_raw_parts(ptr, declared) };
    resolve(blob)
}

fn checked_region(
    base: u64,
    length: u64,
    class: RegionClass,
) -> Result<MemoryRegion, MalformedDescriptor> {
    MemoryRegion::try_new(PhysAddr::new(base), length, class)
        .ok_or(MalformedDescriptor::InvalidRange { base, length })
}

/// Reject any overlap inside a base-sorted list.
fn check_disjoint(sorted: &[MemoryRegion]) -> Result<(), MalformedDescriptor> {
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(MalformedDescriptor::OverlappingRegions {
                first: pair[0],
                second: pair[1],
            });
        }
    }
    Ok(())
}

/// Subtract every reserved range from `ram`, returning the remaining pieces.
fn carve(ram: &MemoryRegion, reserved: &[MemoryRegion], out: &mut Vec<MemoryRegion>) {
    let mut cursor = ram.base.as_u64();
    for res in reserved.iter().filter(|r| r.overlaps(ram)) {
        if res.base.as_u64() > cursor {
            let end = res.base.as_u64().min(ram.end());
            if let Some(piece) =
                MemoryRegion::try_new(PhysAddr::new(cursor), end - cursor, RegionClass::Ram)
            {
                out.push(piece);
            }
        }
        cursor = cursor.max(res.end());
        if cursor >= ram.end() {
            return;
        }
    }
    if cursor < ram.end()
        && let Some(piece) =
            MemoryRegion::try_new(PhysAddr::new(cursor), ram.end() - cursor, RegionClass::Ram)
    {
        out.push(piece);
    }
}

/// Check that `[start, end)` is fully covered by the (sorted, disjoint)
/// reserved ranges.
fn covered_by(start: u64, end: u64, reserved: &[MemoryRegion]) -> bool {
    let mut cursor = start;
    for res in reserved {
        if res.end() <= cursor {
            continue;
        }
        if res.base.as_u64() > cursor {
            return false;
        }
        cursor = res.end();
        if cursor >= end {
            return true;
        }
    }
    cursor >= end
}

/// Merge overlapping MMIO ranges so each physical page appears once.
fn merge_mmio(mut windows: Vec<MemoryRegion>) -> Vec<MemoryRegion> {
    windows.sort_by_key(|r| r.base);
    let mut merged: Vec<MemoryRegion> = Vec::with_capacity(windows.len());
    for w in windows {
        match merged.last_mut() {
            Some(last) if last.overlaps(&w) => {
                let end = last.end().max(w.end());
                last.length = end - last.base.as_u64();
            }
            _ => merged.push(w),
        }
    }
    merged
}

/// Apply the consistency rules shared by both formats.
pub fn normalise(
    raw: RawDescriptor,
    format: DescriptorFormat,
) -> Result<PlatformDescriptor, MalformedDescriptor> {
    if raw.ram.is_empty() {
        return Err(MalformedDescriptor::MissingNode("memory"));
    }
    if format == DescriptorFormat::DeviceTree && !raw.has_reserved_section {
        return Err(MalformedDescriptor::MissingNode("reserved-memory"));
    }
    if raw.cores.is_empty() {
        return Err(MalformedDescriptor::MissingNode("cpus"));
    }

    let mut ram = raw
        .ram
        .iter()
        .map(|&(base, len)| checked_region(base, len, RegionClass::Ram))
        .collect::<Result<Vec<_>, _>>()?;
    ram.sort_by_key(|r| r.base);
    check_disjoint(&ram)?;

    let mut reserved_areas = Vec::with_capacity(raw.reserved.len());
    for (name, base, len, flags) in raw.reserved {
        let region = checked_region(base, len, RegionClass::Reserved)?.with_flags(flags);
        reserved_areas.push(ReservedArea { name, region });
    }
    reserved_areas.sort_by_key(|a| a.region.base);
    let reserved: Vec<MemoryRegion> = reserved_areas.iter().map(|a| a.region).collect();
    check_disjoint(&reserved)?;

    let mut mmio = Vec::with_capacity(raw.windows.len());
    for window in &raw.windows {
        let region = checked_region(window.base.as_u64(), window.length, RegionClass::Mmio)?;
        for r in ram.iter().filter(|r| r.overlaps(&region)) {
            let start = r.base.as_u64().max(region.base.as_u64());
            let end = r.end().min(region.end());
            if !covered_by(start, end, &reserved) {
                return Err(MalformedDescriptor::MmioOverlapsRam { window: region });
            }
        }
        mmio.push(region);
    }

    let mut regions = Vec::with_capacity(ram.len() + reserved.len() + mmio.len());
    for r in &ram {
        carve(r, &reserved, &mut regions);
    }
    regions.extend_from_slice(&reserved);
    regions.extend(merge_mmio(mmio));
    regions.sort_by_key(|r| (r.base, r.class));

    if raw.cores.len() > MAX_CPUS {
        return Err(MalformedDescriptor::TooManyCores(raw.cores.len()));
    }
    let mut cores: Vec<CoreInfo> = Vec::with_capacity(raw.cores.len());
    for (index, &(mpidr, enable_method)) in raw.cores.iter().enumerate() {
        if cores.iter().any(|c| c.mpidr == mpidr) {
            return Err(MalformedDescriptor::DuplicateCore(mpidr));
        }
        cores.push(CoreInfo {
            core_id: CoreId::new(index as u32),
            mpidr,
            enable_method,
        });
    }

    let mut routes = raw.routes;
    routes.sort_by(|a, b| a.irq.cmp(&b.irq).then_with(|| a.source.cmp(&b.source)));

    let mut windows = raw.windows;
    windows.sort_by_key(|w| w.base);

    Ok(PlatformDescriptor {
        format,
        model: raw.model,
        bootargs: raw.bootargs,
        regions,
        reserved_areas,
        windows,
        routes,
        cores,
        timer_irq: raw.timer_irq.unwrap_or(DEFAULT_TIMER_IRQ),
        timer_frequency: raw.timer_frequency,
        psci: raw.psci.unwrap_or(PsciConduit::Smc),
    })
}
