//! Device Tree Blob parsing
//!
//! Walks the flattened device tree with the `fdt` crate and collects the
//! facts the kernel needs into a [`RawDescriptor`]. Cell sizes are tracked
//! per parent while walking, so `reg` and `interrupts` are decoded with the
//! sizes that actually apply to each node.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use axon_common::PhysAddr;
use axon_common::memory::RegionFlags;
use fdt::Fdt;
use fdt::node::FdtNode;

use super::{DeviceKind, DeviceWindow, EnableMethod, InterruptRoute, MalformedDescriptor,
    RawDescriptor, Trigger};
use crate::psci::PsciConduit;

/// FDT header magic (big-endian on the wire)
pub const FDT_MAGIC: u32 = 0xd00d_feed;

/// Deepest nesting the walker will follow
const MAX_DEPTH: usize = 16;

/// Compatible strings recognised as the console UART
const CONSOLE_COMPATIBLE: &[&str] = &["arm,pl011", "snps,dw-apb-uart", "ns16550a"];

/// `#address-cells` / `#size-cells` in effect for a node's children
#[derive(Debug, Clone, Copy)]
struct Cells {
    address: usize,
    size: usize,
}

impl Cells {
    /// Defaults from the devicetree specification
    const DEFAULT: Self = Self { address: 2, size: 1 };

    fn for_children_of(node: &FdtNode<'_, '_>, inherited: Self) -> Self {
        Self {
            address: prop_u32(node, "#address-cells").map_or(inherited.address, |v| v as usize),
            size: prop_u32(node, "#size-cells").map_or(inherited.size, |v| v as usize),
        }
    }
}

fn prop_u32(node: &FdtNode<'_, '_>, name: &str) -> Option<u32> {
    let value = node.property(name)?.value;
    let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A 32- or 64-bit big-endian integer property
fn prop_u64(node: &FdtNode<'_, '_>, name: &str) -> Option<u64> {
    let value = node.property(name)?.value;
    read_cells(value, value.len() / 4)
}

fn prop_str<'a>(node: &FdtNode<'_, 'a>, name: &str) -> Option<&'a str> {
    let value = node.property(name)?.value;
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    core::str::from_utf8(&value[..end]).ok()
}

fn has_prop(node: &FdtNode<'_, '_>, name: &str) -> bool {
    node.property(name).is_some()
}

/// Decode `cells` big-endian u32 cells (at most two) into one integer.
fn read_cells(bytes: &[u8], cells: usize) -> Option<u64> {
    if cells == 0 || cells > 2 || bytes.len() < cells * 4 {
        return None;
    }
    let mut value = 0u64;
    for chunk in bytes[..cells * 4].chunks_exact(4) {
        value = (value << 32) | u64::from(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(value)
}

/// Decode a `reg` property into `(address, size)` pairs.
fn reg_pairs(node: &FdtNode<'_, '_>, cells: Cells) -> Result<Vec<(u64, u64)>, MalformedDescriptor> {
    let Some(prop) = node.property("reg") else {
        return Ok(Vec::new());
    };
    let stride = (cells.address + cells.size) * 4;
    if cells.address == 0 || cells.address > 2 || cells.size > 2 || stride == 0 {
        return Err(MalformedDescriptor::InvalidData("cell sizes"));
    }
    if prop.value.len() % stride != 0 {
        return Err(MalformedDescriptor::InvalidData("reg property"));
    }

    let mut pairs = Vec::with_capacity(prop.value.len() / stride);
    for entry in prop.value.chunks_exact(stride) {
        let addr = read_cells(entry, cells.address)
            .ok_or(MalformedDescriptor::InvalidData("reg address"))?;
        let size = if cells.size == 0 {
            0
        } else {
            read_cells(&entry[cells.address * 4..], cells.size)
                .ok_or(MalformedDescriptor::InvalidData("reg size"))?
        };
        pairs.push((addr, size));
    }
    Ok(pairs)
}

fn first_compatible<'a>(node: &FdtNode<'_, 'a>) -> Option<&'a str> {
    node.compatible().and_then(|c| c.all().next())
}

fn is_compatible(node: &FdtNode<'_, '_>, pred: impl Fn(&str) -> bool) -> bool {
    node.compatible().is_some_and(|c| c.all().any(pred))
}

fn is_disabled(node: &FdtNode<'_, '_>) -> bool {
    matches!(prop_str(node, "status"), Some(s) if s != "okay" && s != "ok")
}

/// Interrupt controller facts gathered in the first pass
#[derive(Debug, Default)]
struct InterruptDomains {
    /// phandle -> `#interrupt-cells`
    cells: BTreeMap<u32, usize>,
}

impl InterruptDomains {
    fn collect(node: FdtNode<'_, '_>, depth: usize, out: &mut Self) {
        if depth > MAX_DEPTH {
            return;
        }
        if let (Some(phandle), Some(cells)) =
            (prop_u32(&node, "phandle"), prop_u32(&node, "#interrupt-cells"))
        {
            out.cells.insert(phandle, cells as usize);
        }
        for child in node.children() {
            Self::collect(child, depth + 1, out);
        }
    }

    /// Decode the `interrupts` property using the parent's cell count.
    ///
    /// GIC-style three-cell specifiers `<type number flags>` become
    /// interrupt ids (SPI + 32, PPI + 16); one- and two-cell specifiers
    /// carry the id directly.
    fn decode(&self, node: &FdtNode<'_, '_>, parent: Option<u32>) -> Vec<(u32, Trigger)> {
        let mut out = Vec::new();
        let Some(prop) = node.property("interrupts") else {
            return out;
        };
        let parent = prop_u32(node, "interrupt-parent").or(parent);
        let Some(cells) = parent.and_then(|p| self.cells.get(&p).copied()) else {
            log::debug!("fdt: {} has interrupts but no known interrupt parent", node.name);
            return out;
        };
        if cells == 0 || cells > 4 {
            return out;
        }

        for spec in prop.value.chunks_exact(cells * 4) {
            let cell = |i: usize| {
                u32::from_be_bytes([spec[i * 4], spec[i * 4 + 1], spec[i * 4 + 2], spec[i * 4 + 3]])
            };
            let (irq, flags) = match cells {
                1 => (cell(0), 0),
                2 => (cell(0), cell(1)),
                _ => {
                    let base = if cell(0) == 1 { 16 } else { 32 };
                    (cell(1) + base, cell(2))
                }
            };
            // Flags 1/2 are edge triggered, 4/8 level triggered
            let trigger = if flags & 0x3 != 0 { Trigger::Edge } else { Trigger::Level };
            out.push((irq, trigger));
        }
        out
    }
}

struct Walker<'d> {
    raw: RawDescriptor,
    domains: &'d InterruptDomains,
    stdout: Option<String>,
}

impl Walker<'_> {
    fn record_routes(&mut self, name: &str, irqs: &[(u32, Trigger)]) {
        for &(irq, trigger) in irqs {
            self.raw.routes.push(InterruptRoute {
                source: name.to_string(),
                irq,
                trigger,
            });
        }
    }

    fn visit_memory(&mut self, node: &FdtNode<'_, '_>, cells: Cells) -> Result<(), MalformedDescriptor> {
        let pairs = reg_pairs(node, cells)?;
        if pairs.is_empty() {
            return Err(MalformedDescriptor::MissingProperty {
                node: "memory",
                property: "reg",
            });
        }
        self.raw.ram.extend(pairs);
        Ok(())
    }

    fn visit_reserved(&mut self, node: &FdtNode<'_, '_>, cells: Cells) -> Result<(), MalformedDescriptor> {
        self.raw.has_reserved_section = true;
        let cells = Cells::for_children_of(node, cells);
        for child in node.children() {
            if is_disabled(&child) {
                continue;
            }
            let flags = if has_prop(&child, "no-map") {
                RegionFlags::NO_MAP
            } else {
                RegionFlags::NONE
            };
            // Dynamically placed pools (size without reg) are not supported
            for (base, size) in reg_pairs(&child, cells)? {
                self.raw.reserved.push((child.name.to_string(), base, size, flags));
            }
        }
        Ok(())
    }

    fn visit_cpus(&mut self, node: &FdtNode<'_, '_>, cells: Cells) -> Result<(), MalformedDescriptor> {
        let cells = Cells::for_children_of(node, cells);
        for child in node.children() {
            let is_cpu = match prop_str(&child, "device_type") {
                Some(t) => t == "cpu",
                None => child.name == "cpu" || child.name.starts_with("cpu@"),
            };
            if !is_cpu {
                continue;
            }
            if is_disabled(&child) {
                log::debug!("fdt: skipping disabled {}", child.name);
                continue;
            }

            let mpidr = reg_pairs(&child, Cells { address: cells.address, size: 0 })?
                .first()
                .map(|&(addr, _)| addr)
                .ok_or(MalformedDescriptor::MissingProperty {
                    node: "cpu",
                    property: "reg",
                })?;

            let method = match prop_str(&child, "enable-method") {
                Some("spin-table") => {
                    let release = prop_u64(&child, "cpu-release-addr").ok_or(
                        MalformedDescriptor::MissingProperty {
                            node: "cpu",
                            property: "cpu-release-addr",
                        },
                    )?;
                    EnableMethod::SpinTable {
                        release_addr: PhysAddr::new(release),
                    }
                }
                _ => EnableMethod::Psci,
            };
            self.raw.cores.push((mpidr, method));
        }
        Ok(())
    }

    fn visit_device(
        &mut self,
        node: &FdtNode<'_, '_>,
        cells: Cells,
        irq_parent: Option<u32>,
    ) -> Result<(), MalformedDescriptor> {
        let irqs = self.domains.decode(node, irq_parent);
        self.record_routes(node.name, &irqs);

        if is_compatible(node, |c| c == "arm,armv8-timer") {
            // <secure-phys phys virt hyp>: the kernel runs on the virtual timer
            self.raw.timer_irq = irqs.get(2).or(irqs.first()).map(|&(irq, _)| irq);
            self.raw.timer_frequency = prop_u32(node, "clock-frequency");
            return Ok(());
        }

        let pairs = reg_pairs(node, cells)?;
        let Some(&(base, length)) = pairs.first() else {
            return Ok(());
        };

        let kind = if has_prop(node, "interrupt-controller") {
            DeviceKind::InterruptController
        } else if is_compatible(node, |c| CONSOLE_COMPATIBLE.contains(&c)) {
            DeviceKind::Console
        } else if is_compatible(node, |c| c.contains("rknpu") || c.ends_with(",npu")) {
            DeviceKind::Accelerator
        } else {
            DeviceKind::Generic
        };

        self.raw.windows.push(DeviceWindow {
            name: node.name.to_string(),
            compatible: first_compatible(node).unwrap_or("").to_string(),
            base: PhysAddr::new(base),
            length,
            irqs: irqs.iter().map(|&(irq, _)| irq).collect(),
            kind,
        });
        Ok(())
    }

    /// Walk a bus node (the root or a `simple-bus`) and its children.
    fn visit_bus(
        &mut self,
        bus: &FdtNode<'_, '_>,
        cells: Cells,
        irq_parent: Option<u32>,
        depth: usize,
    ) -> Result<(), MalformedDescriptor> {
        if depth > MAX_DEPTH {
            return Err(MalformedDescriptor::InvalidData("device tree nesting"));
        }
        let child_cells = Cells::for_children_of(bus, cells);
        let irq_parent = prop_u32(bus, "interrupt-parent").or(irq_parent);

        for child in bus.children() {
            if is_disabled(&child) {
                continue;
            }
            let base_name = child.name.split('@').next().unwrap_or(child.name);
            let is_memory = prop_str(&child, "device_type") == Some("memory");

            if depth == 0 && (is_memory || base_name == "memory") {
                self.visit_memory(&child, child_cells)?;
            } else if depth == 0 && base_name == "reserved-memory" {
                self.visit_reserved(&child, child_cells)?;
            } else if depth == 0 && base_name == "cpus" {
                self.visit_cpus(&child, child_cells)?;
            } else if depth == 0 && base_name == "chosen" {
                if let Some(args) = prop_str(&child, "bootargs") {
                    self.raw.bootargs = args.to_string();
                }
                self.stdout = prop_str(&child, "stdout-path").map(ToString::to_string);
            } else if is_compatible(&child, |c| c.starts_with("arm,psci")) {
                self.raw.psci = match prop_str(&child, "method") {
                    Some("hvc") => Some(PsciConduit::Hvc),
                    Some("smc") => Some(PsciConduit::Smc),
                    _ => return Err(MalformedDescriptor::InvalidData("psci method")),
                };
            } else if is_compatible(&child, |c| c == "simple-bus") {
                self.visit_bus(&child, child_cells, irq_parent, depth + 1)?;
            } else if base_name != "aliases" {
                self.visit_device(&child, child_cells, irq_parent)?;
            }
        }
        Ok(())
    }

    /// When several consoles exist, keep only the one `stdout-path` names.
    fn settle_console(&mut self) {
        let Some(path) = self.stdout.as_deref() else {
            return;
        };
        let path = path.split(':').next().unwrap_or(path);
        let leaf = path.rsplit('/').next().unwrap_or(path);
        let has_match = self
            .raw
            .windows
            .iter()
            .any(|w| w.kind == DeviceKind::Console && w.name == leaf);
        if !has_match {
            return;
        }
        for w in self.raw.windows.iter_mut() {
            if w.kind == DeviceKind::Console && w.name != leaf {
                w.kind = DeviceKind::Generic;
            }
        }
    }
}

/// Parse a device tree blob into raw facts.
pub fn parse(blob: &[u8]) -> Result<RawDescriptor, MalformedDescriptor> {
    let fdt = Fdt::new(blob).map_err(|_| MalformedDescriptor::BadHeader)?;
    let root = fdt.find_node("/").ok_or(MalformedDescriptor::MissingNode("/"))?;

    let mut domains = InterruptDomains::default();
    InterruptDomains::collect(root, 0, &mut domains);

    let mut walker = Walker {
        raw: RawDescriptor::default(),
        domains: &domains,
        stdout: None,
    };
    walker.raw.model = prop_str(&root, "model")
        .or_else(|| first_compatible(&root))
        .unwrap_or("unknown")
        .to_string();

    walker.visit_bus(&root, Cells::DEFAULT, None, 0)?;
    walker.settle_console();

    for reservation in fdt.memory_reservations() {
        let base = reservation.address() as u64;
        let size = reservation.size() as u64;
        if size != 0 {
            walker.raw.has_reserved_section = true;
            walker
                .raw
                .reserved
                .push(("memreserve".to_string(), base, size, RegionFlags::NO_MAP));
        }
    }

    Ok(walker.raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::builder::{FdtBuilder, reference_device_tree};
    use crate::descriptor::{DescriptorFormat, resolve};
    use axon_common::RegionClass;

    #[test]
    fn test_reference_tree_resolves() {
        let blob = reference_device_tree();
        let desc = resolve(&blob).unwrap();

        assert_eq!(desc.format(), DescriptorFormat::DeviceTree);
        assert_eq!(desc.model(), "axon,reference-board");
        assert_eq!(desc.cores().len(), 4);
        assert_eq!(desc.cores()[1].mpidr, 1);
        assert_eq!(desc.psci_conduit(), PsciConduit::Smc);
        assert_eq!(desc.timer_irq(), 27);
        assert!(desc.bootargs().contains("npu.queue_depth=8"));

        let console = desc.console().unwrap();
        assert_eq!(console.base, PhysAddr::new(0x4000_0000));
        assert_eq!(console.irqs, [33]);

        let npu = desc.accelerator().unwrap();
        assert_eq!(npu.compatible, "rockchip,rk3588-rknpu");
        assert_eq!(npu.irqs, [142]);

        assert!(desc.find_reserved("npu-pool").is_some());
        assert!(desc.regions_of(RegionClass::Ram).count() >= 1);
    }

    #[test]
    fn test_overlapping_memory_nodes_rejected() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.prop_u32("#address-cells", 2);
        b.prop_u32("#size-cells", 2);
        b.begin_node("memory@0");
        b.prop_str("device_type", "memory");
        b.prop_reg(&[(0x0, 0x4000_0000)], 2, 2);
        b.end_node();
        b.begin_node("memory@20000000");
        b.prop_str("device_type", "memory");
        b.prop_reg(&[(0x2000_0000, 0x3000_0000)], 2, 2);
        b.end_node();
        b.begin_node("reserved-memory");
        b.end_node();
        b.begin_node("cpus");
        b.prop_u32("#address-cells", 1);
        b.prop_u32("#size-cells", 0);
        b.begin_node("cpu@0");
        b.prop_str("device_type", "cpu");
        b.prop_u32("reg", 0);
        b.end_node();
        b.end_node();
        b.end_node();

        let err = resolve(&b.finish()).unwrap_err();
        assert!(matches!(err, MalformedDescriptor::OverlappingRegions { .. }));
    }

    #[test]
    fn test_missing_cpus_rejected() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("memory@0");
        b.prop_str("device_type", "memory");
        b.prop_reg(&[(0x0, 0x1000_0000)], 2, 1);
        b.end_node();
        b.begin_node("reserved-memory");
        b.end_node();
        b.end_node();

        assert_eq!(
            resolve(&b.finish()).unwrap_err(),
            MalformedDescriptor::MissingNode("cpus")
        );
    }

    #[test]
    fn test_spin_table_core() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.prop_u32("#address-cells", 1);
        b.prop_u32("#size-cells", 1);
        b.begin_node("memory@80000000");
        b.prop_str("device_type", "memory");
        b.prop_reg(&[(0x8000_0000, 0x1000_0000)], 1, 1);
        b.end_node();
        b.begin_node("reserved-memory");
        b.end_node();
        b.begin_node("cpus");
        b.prop_u32("#address-cells", 1);
        b.prop_u32("#size-cells", 0);
        for (i, release) in [(0u32, 0u64), (1, 0x8000_00f8)] {
            b.begin_node(if i == 0 { "cpu@0" } else { "cpu@1" });
            b.prop_str("device_type", "cpu");
            b.prop_u32("reg", i);
            b.prop_str("enable-method", "spin-table");
            b.prop_u64("cpu-release-addr", release);
            b.end_node();
        }
        b.end_node();
        b.end_node();

        let desc = resolve(&b.finish()).unwrap();
        assert_eq!(
            desc.cores()[1].enable_method,
            EnableMethod::SpinTable {
                release_addr: PhysAddr::new(0x8000_00f8)
            }
        );
    }

    #[test]
    fn test_memreserve_becomes_reserved_region() {
        let mut b = FdtBuilder::new();
        b.add_reservation(0x0800_0000, 0x1_0000);
        b.begin_node("");
        b.begin_node("memory@0");
        b.prop_str("device_type", "memory");
        b.prop_reg(&[(0x0, 0x1000_0000)], 2, 1);
        b.end_node();
        b.begin_node("cpus");
        b.prop_u32("#address-cells", 1);
        b.prop_u32("#size-cells", 0);
        b.begin_node("cpu@0");
        b.prop_u32("reg", 0);
        b.end_node();
        b.end_node();
        b.end_node();

        let desc = resolve(&b.finish()).unwrap();
        let reserved: Vec<_> = desc.regions_of(RegionClass::Reserved).collect();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].base, PhysAddr::new(0x0800_0000));
        assert_eq!(desc.regions_of(RegionClass::Ram).count(), 2);
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let mut blob = reference_device_tree();
        // Declared total size larger than the buffer
        let declared = blob.len() as u32 + 64;
        blob[4..8].copy_from_slice(&declared.to_be_bytes());
        assert_eq!(resolve(&blob).unwrap_err(), MalformedDescriptor::BadHeader);
    }

    #[test]
    fn test_read_cells() {
        assert_eq!(read_cells(&[0, 0, 0, 1, 0, 0, 0, 2], 2), Some(0x1_0000_0002));
        assert_eq!(read_cells(&[0, 0, 1, 0], 1), Some(0x100));
        assert_eq!(read_cells(&[0, 0, 1], 1), None);
        assert_eq!(read_cells(&[0; 12], 3), None);
    }
}
