//! Firmware Table parsing
//!
//! The firmware table is a flat, little-endian alternative to the device
//! tree for boards whose firmware does not produce one. Layout:
//!
//! ```text
//! offset  size  field
//! 0       4     signature "AXFW"
//! 4       4     total length in bytes
//! 8       2     revision (1)
//! 10      1     checksum (all bytes sum to zero)
//! 11      1     flags (bit 0: PSCI conduit is SMC)
//! 12      4     entry count
//! 16      20    model, NUL padded
//! 36      ...   entries: kind u16, length u16 (including this header), payload
//! ```
//!
//! Unknown entry kinds are skipped so newer firmware stays bootable.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use axon_common::PhysAddr;
use axon_common::memory::RegionFlags;

use super::{DeviceKind, DeviceWindow, EnableMethod, InterruptRoute, MalformedDescriptor,
    RawDescriptor, Trigger};
use crate::psci::PsciConduit;

pub const SIGNATURE: [u8; 4] = *b"AXFW";
pub const REVISION: u16 = 1;
pub const HEADER_SIZE: usize = 36;
pub const CHECKSUM_OFFSET: usize = 10;
pub const MODEL_LEN: usize = 20;
pub const NAME_LEN: usize = 16;
pub const COMPATIBLE_LEN: usize = 32;

/// Header flag: PSCI calls go through SMC rather than HVC
pub const FLAG_PSCI_SMC: u8 = 1 << 0;

/// Entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EntryKind {
    Memory = 1,
    Reserved = 2,
    Mmio = 3,
    Cpu = 4,
    Interrupt = 5,
    Timer = 6,
    CommandLine = 7,
}

impl EntryKind {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Memory),
            2 => Some(Self::Reserved),
            3 => Some(Self::Mmio),
            4 => Some(Self::Cpu),
            5 => Some(Self::Interrupt),
            6 => Some(Self::Timer),
            7 => Some(Self::CommandLine),
            _ => None,
        }
    }

    /// Smallest valid payload for this kind
    const fn min_payload(self) -> usize {
        match self {
            Self::Memory => 16,
            Self::Reserved => 20 + NAME_LEN,
            Self::Mmio => 24 + NAME_LEN + COMPATIBLE_LEN,
            Self::Cpu => 20,
            Self::Interrupt => 8 + NAME_LEN,
            Self::Timer => 8,
            Self::CommandLine => 0,
        }
    }
}

/// Little-endian cursor over one entry payload
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MalformedDescriptor> {
        let end = self.pos.checked_add(n).ok_or(MalformedDescriptor::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(MalformedDescriptor::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MalformedDescriptor> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MalformedDescriptor> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MalformedDescriptor> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, MalformedDescriptor> {
        let lo = u64::from(self.u32()?);
        let hi = u64::from(self.u32()?);
        Ok(lo | (hi << 32))
    }

    /// Fixed-width NUL-padded string
    fn text(&mut self, n: usize) -> Result<String, MalformedDescriptor> {
        let raw = self.take(n)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..end])
            .map(ToString::to_string)
            .map_err(|_| MalformedDescriptor::InvalidData("firmware table string"))
    }
}

fn parse_entry(
    kind: EntryKind,
    payload: &[u8],
    raw: &mut RawDescriptor,
) -> Result<(), MalformedDescriptor> {
    let mut r = Reader::new(payload);
    match kind {
        EntryKind::Memory => {
            let base = r.u64()?;
            let length = r.u64()?;
            raw.ram.push((base, length));
        }
        EntryKind::Reserved => {
            let base = r.u64()?;
            let length = r.u64()?;
            let flags = if r.u32()? & 1 != 0 {
                RegionFlags::NO_MAP
            } else {
                RegionFlags::NONE
            };
            let name = r.text(NAME_LEN)?;
            raw.has_reserved_section = true;
            raw.reserved.push((name, base, length, flags));
        }
        EntryKind::Mmio => {
            let base = r.u64()?;
            let length = r.u64()?;
            let irq = r.u32()?;
            let kind = DeviceKind::from_u8(r.u8()?);
            r.take(3)?;
            let name = r.text(NAME_LEN)?;
            let compatible = r.text(COMPATIBLE_LEN)?;
            let irqs = if irq != 0 {
                raw.routes.push(InterruptRoute {
                    source: name.clone(),
                    irq,
                    trigger: Trigger::Level,
                });
                alloc::vec![irq]
            } else {
                Vec::new()
            };
            raw.windows.push(DeviceWindow {
                name,
                compatible,
                base: PhysAddr::new(base),
                length,
                irqs,
                kind,
            });
        }
        EntryKind::Cpu => {
            let mpidr = r.u64()?;
            let release = r.u64()?;
            let enabled = r.u32()? & 1 != 0;
            if !enabled {
                log::debug!("fwtable: skipping disabled core {:#x}", mpidr);
                return Ok(());
            }
            let method = if release == 0 {
                EnableMethod::Psci
            } else {
                EnableMethod::SpinTable {
                    release_addr: PhysAddr::new(release),
                }
            };
            raw.cores.push((mpidr, method));
        }
        EntryKind::Interrupt => {
            let irq = r.u32()?;
            let trigger = if r.u8()? != 0 { Trigger::Edge } else { Trigger::Level };
            r.take(3)?;
            let source = r.text(NAME_LEN)?;
            raw.routes.push(InterruptRoute {
                source,
                irq,
                trigger,
            });
        }
        EntryKind::Timer => {
            raw.timer_irq = Some(r.u32()?);
            raw.timer_frequency = Some(r.u32()?).filter(|&f| f != 0);
        }
        EntryKind::CommandLine => {
            raw.bootargs = r.text(payload.len())?;
        }
    }
    Ok(())
}

/// Parse a firmware table into raw facts.
pub fn parse(blob: &[u8]) -> Result<RawDescriptor, MalformedDescriptor> {
    if blob.len() < HEADER_SIZE {
        return Err(MalformedDescriptor::Truncated);
    }

    let mut header = Reader::new(&blob[..HEADER_SIZE]);
    if header.take(4)? != SIGNATURE {
        return Err(MalformedDescriptor::UnknownFormat);
    }
    let length = header.u32()? as usize;
    let revision = header.u16()?;
    let _checksum = header.u8()?;
    let flags = header.u8()?;
    let count = header.u32()?;
    let model = header.text(MODEL_LEN)?;

    if length < HEADER_SIZE {
        return Err(MalformedDescriptor::BadHeader);
    }
    let table = blob.get(..length).ok_or(MalformedDescriptor::Truncated)?;
    if table.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
        return Err(MalformedDescriptor::ChecksumMismatch);
    }
    if revision != REVISION {
        return Err(MalformedDescriptor::UnsupportedRevision(revision));
    }

    let mut raw = RawDescriptor {
        model,
        psci: Some(if flags & FLAG_PSCI_SMC != 0 {
            PsciConduit::Smc
        } else {
            PsciConduit::Hvc
        }),
        ..RawDescriptor::default()
    };

    let mut offset = HEADER_SIZE;
    for _ in 0..count {
        let mut head = Reader::new(table.get(offset..).ok_or(MalformedDescriptor::Truncated)?);
        let kind = head.u16()?;
        let entry_len = head.u16()? as usize;
        if entry_len < 4 {
            return Err(MalformedDescriptor::InvalidData("firmware table entry length"));
        }
        let end = offset + entry_len;
        let payload = table.get(offset + 4..end).ok_or(MalformedDescriptor::Truncated)?;

        match EntryKind::from_u16(kind) {
            Some(kind) if payload.len() < kind.min_payload() => {
                return Err(MalformedDescriptor::InvalidData("firmware table entry"));
            }
            Some(kind) => parse_entry(kind, payload, &mut raw)?,
            None => log::debug!("fwtable: skipping unknown entry kind {}", kind),
        }
        offset = end;
    }

    Ok(raw)
}
