//! ARM64 descriptor encoding
//!
//! Descriptor format (ARMv8-A, stage 1, 4KB granule):
//! ```text
//! +-----+-----+---+------------------------+---+----+----+----+----+------+----+----+
//! | UXN | PXN | R | Output address [47:12] | nG| AF | SH | AP | NS | INDX | TB | VB |
//! +-----+-----+---+------------------------+---+----+----+----+----+------+----+----+
//!  54    53    52  47                    12 11  10   9  8 7  6 5    4    2 1    0
//! ```

use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};

use axon_common::PhysAddr;

use crate::permissions::{Access, MapAttributes, MemoryType};

/// Output address bits [47:12]
const OUTPUT_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// MAIR_EL1: index 0 Normal write-back, index 1 Device-nGnRE
pub const MAIR_EL1_VALUE: u64 = 0xFF | (0x04 << 8);

register_bitfields![u64,
    /// Fields shared by block, page and table descriptors
    pub ENTRY [
        VALID OFFSET(0) NUMBITS(1) [],

        /// 0 = block (L1/L2), 1 = table (L0-L2) or page (L3)
        TYPE OFFSET(1) NUMBITS(1) [
            Block = 0,
            TableOrPage = 1
        ],

        /// Index into MAIR_EL1
        ATTR_INDEX OFFSET(2) NUMBITS(3) [
            Normal = 0,
            Device = 1
        ],

        AP OFFSET(6) NUMBITS(2) [
            RW_EL1 = 0b00,
            RO_EL1 = 0b10
        ],

        SH OFFSET(8) NUMBITS(2) [
            NonShareable = 0b00,
            OuterShareable = 0b10,
            InnerShareable = 0b11
        ],

        AF OFFSET(10) NUMBITS(1) [],

        PXN OFFSET(53) NUMBITS(1) [],

        UXN OFFSET(54) NUMBITS(1) []
    ]
];

/// Translation table level
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L0,
    L1,
    L2,
    L3,
}

impl Level {
    /// Bit position of this level's index in a virtual address
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L0 => 39,
            Self::L1 => 30,
            Self::L2 => 21,
            Self::L3 => 12,
        }
    }

    /// Bytes covered by one entry
    #[must_use]
    pub const fn entry_size(self) -> u64 {
        1 << self.shift()
    }

    #[must_use]
    pub const fn index(self, va: u64) -> usize {
        ((va >> self.shift()) & 0x1FF) as usize
    }

    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L0 => Some(Self::L1),
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }

    /// Levels that may hold a block or page
    #[must_use]
    pub const fn can_map_leaf(self) -> bool {
        !matches!(self, Self::L0)
    }
}

/// A raw descriptor at a known level
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & 1 != 0
    }

    /// A pointer to the next-level table
    #[must_use]
    pub const fn is_table(self, level: Level) -> bool {
        !matches!(level, Level::L3) && self.0 & 0b11 == 0b11
    }

    /// A block (L1/L2) or page (L3) mapping
    #[must_use]
    pub const fn is_leaf(self, level: Level) -> bool {
        match level {
            Level::L0 => false,
            Level::L3 => self.0 & 0b11 == 0b11,
            Level::L1 | Level::L2 => self.0 & 0b11 == 0b01,
        }
    }

    #[must_use]
    pub const fn new_table(table: PhysAddr) -> Self {
        Self((table.as_u64() & OUTPUT_MASK) | 0b11)
    }

    /// Block or page descriptor for `pa` with `attrs`
    #[must_use]
    pub fn new_leaf(level: Level, pa: PhysAddr, attrs: MapAttributes) -> Self {
        let reg: InMemoryRegister<u64, ENTRY::Register> = InMemoryRegister::new(0);
        let kind = if level == Level::L3 {
            ENTRY::TYPE::TableOrPage
        } else {
            ENTRY::TYPE::Block
        };
        let memory = match attrs.mem_type {
            MemoryType::Normal => ENTRY::ATTR_INDEX::Normal + ENTRY::SH::InnerShareable,
            MemoryType::Device => ENTRY::ATTR_INDEX::Device + ENTRY::SH::OuterShareable,
        };
        let ap = if attrs.access.is_writable() {
            ENTRY::AP::RW_EL1
        } else {
            ENTRY::AP::RO_EL1
        };
        let pxn = if attrs.access.is_executable() {
            ENTRY::PXN::CLEAR
        } else {
            ENTRY::PXN::SET
        };
        reg.write(ENTRY::VALID::SET + kind + memory + ap + ENTRY::AF::SET + pxn + ENTRY::UXN::SET);
        Self(reg.get() | (pa.as_u64() & OUTPUT_MASK))
    }

    /// Output address: the next table for a table descriptor, the mapped
    /// base for a leaf
    #[must_use]
    pub const fn output_address(self) -> PhysAddr {
        PhysAddr::new(self.0 & OUTPUT_MASK)
    }

    /// Attributes of a leaf descriptor
    #[must_use]
    pub fn attributes(self) -> MapAttributes {
        let reg: InMemoryRegister<u64, ENTRY::Register> = InMemoryRegister::new(self.0);
        let mem_type = if reg.read(ENTRY::ATTR_INDEX) == 1 {
            MemoryType::Device
        } else {
            MemoryType::Normal
        };
        let writable = reg.read(ENTRY::AP) & 0b10 == 0;
        let executable = !reg.is_set(ENTRY::PXN);
        MapAttributes {
            mem_type,
            access: Access::from_bits(writable, executable),
        }
    }
}
