//! Descriptor blob builders
//!
//! Produce real device-tree (FDT v17) and firmware-table encodings so the
//! resolver and the boot path can be tested against the same bytes firmware
//! would hand over. Only built for tests or with the `blob-builder` feature.

use alloc::string::String;
use alloc::vec::Vec;

use super::fdt::FDT_MAGIC;
use super::fwtable::{self, EntryKind};

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const FDT_HEADER_SIZE: usize = 40;

/// Incremental flattened device tree writer
#[derive(Debug, Default)]
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
    reservations: Vec<(u64, u64)>,
    boot_cpuid: u32,
}

impl FdtBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push_u32(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        // Reuse an existing entry when the exact string is already present
        let needle = name.as_bytes();
        let mut start = 0;
        while start < self.strings.len() {
            let end = self.strings[start..]
                .iter()
                .position(|&b| b == 0)
                .map_or(self.strings.len(), |p| start + p);
            if &self.strings[start..end] == needle {
                return start as u32;
            }
            start = end + 1;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(needle);
        self.strings.push(0);
        offset
    }

    /// Add a `/memreserve/` entry
    pub fn add_reservation(&mut self, address: u64, size: u64) {
        self.reservations.push((address, size));
    }

    pub fn set_boot_cpuid(&mut self, id: u32) {
        self.boot_cpuid = id;
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) {
        let nameoff = self.string_offset(name);
        self.push_u32(FDT_PROP);
        self.push_u32(value.len() as u32);
        self.push_u32(nameoff);
        self.structure.extend_from_slice(value);
        self.pad();
    }

    pub fn prop_empty(&mut self, name: &str) {
        self.prop(name, &[]);
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) {
        self.prop(name, &value.to_be_bytes());
    }

    pub fn prop_u64(&mut self, name: &str, value: u64) {
        self.prop(name, &value.to_be_bytes());
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &bytes);
    }

    pub fn prop_str(&mut self, name: &str, value: &str) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.prop(name, &bytes);
    }

    /// A string-list property such as `compatible`
    pub fn prop_strs(&mut self, name: &str, values: &[&str]) {
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(v.as_bytes());
            bytes.push(0);
        }
        self.prop(name, &bytes);
    }

    /// Encode `reg` with the given cell sizes
    pub fn prop_reg(&mut self, ranges: &[(u64, u64)], address_cells: usize, size_cells: usize) {
        let mut bytes = Vec::new();
        for &(addr, size) in ranges {
            push_cells(&mut bytes, addr, address_cells);
            push_cells(&mut bytes, size, size_cells);
        }
        self.prop("reg", &bytes);
    }

    /// Assemble header, reservation map, structure and strings blocks.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        let rsvmap_size = (self.reservations.len() + 1) * 16;
        let off_mem_rsvmap = FDT_HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + rsvmap_size;
        let off_dt_strings = off_dt_struct + self.structure.len();
        let total = off_dt_strings + self.strings.len();

        let mut blob = Vec::with_capacity(total);
        for word in [
            FDT_MAGIC,
            total as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            17,
            16,
            self.boot_cpuid,
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        for &(addr, size) in &self.reservations {
            blob.extend_from_slice(&addr.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; 16]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

fn push_cells(out: &mut Vec<u8>, value: u64, cells: usize) {
    match cells {
        0 => {}
        1 => out.extend_from_slice(&(value as u32).to_be_bytes()),
        _ => out.extend_from_slice(&value.to_be_bytes()),
    }
}

/// Reference board used across the test suites.
///
/// - RAM `[0, 1GB)` with a 16MB reusable `npu-pool` reservation at `0x3f00_0000`
/// - four PSCI cores (SMC conduit)
/// - PL011 console at `0x4000_0000` (SPI 1), GICv3 at `0x4010_0000`,
///   NPU at `0x4020_0000` (SPI 110), architected timer
/// - boot arguments `loglevel=info npu.queue_depth=8`
#[must_use]
pub fn reference_device_tree() -> Vec<u8> {
    const GIC_PHANDLE: u32 = 1;
    let mut b = FdtBuilder::new();

    b.begin_node("");
    b.prop_u32("#address-cells", 2);
    b.prop_u32("#size-cells", 2);
    b.prop_str("model", "axon,reference-board");
    b.prop_strs("compatible", &["axon,reference-board"]);
    b.prop_u32("interrupt-parent", GIC_PHANDLE);

    b.begin_node("chosen");
    b.prop_str("bootargs", "loglevel=info npu.queue_depth=8");
    b.prop_str("stdout-path", "/soc/uart@40000000:115200n8");
    b.end_node();

    b.begin_node("memory@0");
    b.prop_str("device_type", "memory");
    b.prop_reg(&[(0x0, 0x4000_0000)], 2, 2);
    b.end_node();

    b.begin_node("reserved-memory");
    b.prop_u32("#address-cells", 2);
    b.prop_u32("#size-cells", 2);
    b.prop_empty("ranges");
    b.begin_node("npu-pool@3f000000");
    b.prop_strs("compatible", &["shared-dma-pool"]);
    b.prop_empty("reusable");
    b.prop_reg(&[(0x3F00_0000, 0x100_0000)], 2, 2);
    b.end_node();
    b.end_node();

    b.begin_node("cpus");
    b.prop_u32("#address-cells", 1);
    b.prop_u32("#size-cells", 0);
    for (i, name) in ["cpu@0", "cpu@1", "cpu@2", "cpu@3"].iter().enumerate() {
        b.begin_node(name);
        b.prop_str("device_type", "cpu");
        b.prop_strs("compatible", &["arm,cortex-a76"]);
        b.prop_u32("reg", i as u32);
        b.prop_str("enable-method", "psci");
        b.end_node();
    }
    b.end_node();

    b.begin_node("psci");
    b.prop_strs("compatible", &["arm,psci-1.0", "arm,psci-0.2"]);
    b.prop_str("method", "smc");
    b.end_node();

    b.begin_node("timer");
    b.prop_strs("compatible", &["arm,armv8-timer"]);
    b.prop_cells(
        "interrupts",
        &[1, 13, 0xf08, 1, 14, 0xf08, 1, 11, 0xf08, 1, 10, 0xf08],
    );
    b.end_node();

    b.begin_node("soc");
    b.prop_strs("compatible", &["simple-bus"]);
    b.prop_u32("#address-cells", 2);
    b.prop_u32("#size-cells", 2);
    b.prop_empty("ranges");

    b.begin_node("uart@40000000");
    b.prop_strs("compatible", &["arm,pl011", "arm,primecell"]);
    b.prop_reg(&[(0x4000_0000, 0x1000)], 2, 2);
    b.prop_cells("interrupts", &[0, 1, 4]);
    b.end_node();

    b.begin_node("interrupt-controller@40100000");
    b.prop_strs("compatible", &["arm,gic-v3"]);
    b.prop_reg(&[(0x4010_0000, 0x1_0000), (0x4014_0000, 0x10_0000)], 2, 2);
    b.prop_empty("interrupt-controller");
    b.prop_u32("#interrupt-cells", 3);
    b.prop_u32("phandle", GIC_PHANDLE);
    b.end_node();

    b.begin_node("npu@40200000");
    b.prop_strs("compatible", &["rockchip,rk3588-rknpu"]);
    b.prop_reg(&[(0x4020_0000, 0x1_0000)], 2, 2);
    b.prop_cells("interrupts", &[0, 110, 4]);
    b.end_node();

    b.end_node(); // soc
    b.end_node(); // root

    b.finish()
}

/// Incremental firmware table writer
#[derive(Debug)]
pub struct FwTableBuilder {
    model: String,
    flags: u8,
    entries: Vec<u8>,
    count: u32,
}

impl FwTableBuilder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: String::from(model),
            flags: 0,
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn psci_smc(&mut self, smc: bool) {
        self.flags = if smc { fwtable::FLAG_PSCI_SMC } else { 0 };
    }

    fn entry(&mut self, kind: EntryKind, payload: &[u8]) {
        let len = (4 + payload.len()) as u16;
        self.entries.extend_from_slice(&(kind as u16).to_le_bytes());
        self.entries.extend_from_slice(&len.to_le_bytes());
        self.entries.extend_from_slice(payload);
        self.count += 1;
    }

    pub fn memory(&mut self, base: u64, length: u64) {
        let mut p = Vec::new();
        p.extend_from_slice(&base.to_le_bytes());
        p.extend_from_slice(&length.to_le_bytes());
        self.entry(EntryKind::Memory, &p);
    }

    pub fn reserved(&mut self, name: &str, base: u64, length: u64, no_map: bool) {
        let mut p = Vec::new();
        p.extend_from_slice(&base.to_le_bytes());
        p.extend_from_slice(&length.to_le_bytes());
        p.extend_from_slice(&u32::from(no_map).to_le_bytes());
        p.extend_from_slice(&fixed::<{ fwtable::NAME_LEN }>(name));
        self.entry(EntryKind::Reserved, &p);
    }

    pub fn mmio(&mut self, name: &str, compatible: &str, base: u64, length: u64, irq: u32, kind: u8) {
        let mut p = Vec::new();
        p.extend_from_slice(&base.to_le_bytes());
        p.extend_from_slice(&length.to_le_bytes());
        p.extend_from_slice(&irq.to_le_bytes());
        p.extend_from_slice(&[kind, 0, 0, 0]);
        p.extend_from_slice(&fixed::<{ fwtable::NAME_LEN }>(name));
        p.extend_from_slice(&fixed::<{ fwtable::COMPATIBLE_LEN }>(compatible));
        self.entry(EntryKind::Mmio, &p);
    }

    pub fn cpu(&mut self, mpidr: u64, release_addr: u64, enabled: bool) {
        let mut p = Vec::new();
        p.extend_from_slice(&mpidr.to_le_bytes());
        p.extend_from_slice(&release_addr.to_le_bytes());
        p.extend_from_slice(&u32::from(enabled).to_le_bytes());
        self.entry(EntryKind::Cpu, &p);
    }

    pub fn interrupt(&mut self, source: &str, irq: u32, edge: bool) {
        let mut p = Vec::new();
        p.extend_from_slice(&irq.to_le_bytes());
        p.extend_from_slice(&[u8::from(edge), 0, 0, 0]);
        p.extend_from_slice(&fixed::<{ fwtable::NAME_LEN }>(source));
        self.entry(EntryKind::Interrupt, &p);
    }

    pub fn timer(&mut self, irq: u32, frequency: u32) {
        let mut p = Vec::new();
        p.extend_from_slice(&irq.to_le_bytes());
        p.extend_from_slice(&frequency.to_le_bytes());
        self.entry(EntryKind::Timer, &p);
    }

    pub fn command_line(&mut self, args: &str) {
        let mut p = Vec::from(args.as_bytes());
        while p.len() % 4 != 0 {
            p.push(0);
        }
        self.entry(EntryKind::CommandLine, &p);
    }

    /// Emit the table with a valid length and checksum.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let total = fwtable::HEADER_SIZE + self.entries.len();
        let mut blob = Vec::with_capacity(total);
        blob.extend_from_slice(&fwtable::SIGNATURE);
        blob.extend_from_slice(&(total as u32).to_le_bytes());
        blob.extend_from_slice(&fwtable::REVISION.to_le_bytes());
        blob.push(0); // checksum, patched below
        blob.push(self.flags);
        blob.extend_from_slice(&self.count.to_le_bytes());
        blob.extend_from_slice(&fixed::<{ fwtable::MODEL_LEN }>(&self.model));
        blob.extend_from_slice(&self.entries);

        let sum = blob.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        blob[fwtable::CHECKSUM_OFFSET] = 0u8.wrapping_sub(sum);
        blob
    }
}

/// NUL-padded fixed-width string field
fn fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = s.len().min(N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

/// The reference board of [`reference_device_tree`] as a firmware table.
#[must_use]
pub fn reference_firmware_table() -> Vec<u8> {
    use crate::descriptor::DeviceKind;

    let mut t = FwTableBuilder::new("axon,reference-board");
    t.psci_smc(true);
    t.memory(0x0, 0x4000_0000);
    t.reserved("npu-pool", 0x3F00_0000, 0x100_0000, false);
    for mpidr in 0..4 {
        t.cpu(mpidr, 0, true);
    }
    t.mmio("uart@40000000", "arm,pl011", 0x4000_0000, 0x1000, 33, DeviceKind::Console as u8);
    t.mmio(
        "interrupt-controller@40100000",
        "arm,gic-v3",
        0x4010_0000,
        0x1_0000,
        0,
        DeviceKind::InterruptController as u8,
    );
    t.mmio(
        "npu@40200000",
        "rockchip,rk3588-rknpu",
        0x4020_0000,
        0x1_0000,
        142,
        DeviceKind::Accelerator as u8,
    );
    t.timer(27, 0);
    t.command_line("loglevel=info npu.queue_depth=8");
    t.finish()
}
