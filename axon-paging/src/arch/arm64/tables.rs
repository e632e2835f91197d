//! Translation table construction
//!
//! [`TranslationTables`] installs a [`MappingTable`] into a fresh set of
//! ARM64 tables using the largest block each step allows (1GB at L1, 2MB
//! at L2, falling back to 4KB pages at L3). Intermediate tables come from a
//! [`TableAllocator`].

use alloc::boxed::Box;
use core::fmt;

use axon_common::{PhysAddr, VirtAddr};

use super::descriptors::{Descriptor, Level};
use crate::mapping::{AddressMapping, MappingTable};
use crate::permissions::MapAttributes;
use crate::{ENTRIES_PER_TABLE, PAGE_SIZE};

/// One translation table
pub type RawTable = [u64; ENTRIES_PER_TABLE];

/// Source of translation table memory
pub trait TableAllocator {
    /// Allocate a zeroed, page-aligned table and return its physical address.
    fn allocate_table(&mut self) -> Option<PhysAddr>;

    /// Access a table previously returned by `allocate_table`.
    fn table(&self, pa: PhysAddr) -> Option<&RawTable>;

    /// Mutable access to a table previously returned by `allocate_table`.
    fn table_mut(&mut self, pa: PhysAddr) -> Option<&mut RawTable>;
}

/// Table construction failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "table errors must be handled"]
pub enum TableError {
    /// The allocator ran out of tables
    AllocationFailed,
    /// The virtual address already has a mapping
    AlreadyMapped(VirtAddr),
    /// Physical or virtual base is not page aligned
    NotAligned(VirtAddr),
    /// A descriptor points at memory the allocator does not own
    ForeignTable(PhysAddr),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed => write!(f, "failed to allocate translation table"),
            Self::AlreadyMapped(va) => write!(f, "{} is already mapped", va),
            Self::NotAligned(va) => write!(f, "mapping at {} is not page aligned", va),
            Self::ForeignTable(pa) => write!(f, "table at {} is not owned by the allocator", pa),
        }
    }
}

/// A root table and the allocator that owns it
pub struct TranslationTables<A: TableAllocator> {
    root: PhysAddr,
    allocator: A,
}

impl<A: TableAllocator> TranslationTables<A> {
    pub fn new(mut allocator: A) -> Result<Self, TableError> {
        let root = allocator.allocate_table().ok_or(TableError::AllocationFailed)?;
        Ok(Self { root, allocator })
    }

    /// Physical address of the L0 table, for TTBR0/TTBR1
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn into_allocator(self) -> A {
        self.allocator
    }

    /// Install every mapping in `table`.
    pub fn map_all(&mut self, table: &MappingTable) -> Result<(), TableError> {
        for mapping in table.mappings() {
            self.map(mapping)?;
        }
        Ok(())
    }

    /// Install one mapping.
    pub fn map(&mut self, mapping: &AddressMapping) -> Result<(), TableError> {
        let mut va = mapping.virt_base.as_u64();
        let mut pa = mapping.region.base.as_u64();
        let mut remaining = mapping.len();
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 || remaining % PAGE_SIZE != 0 {
            return Err(TableError::NotAligned(mapping.virt_base));
        }
        while remaining > 0 {
            let step = self.map_step(va, pa, remaining, mapping.attributes)?;
            va = va.wrapping_add(step);
            pa += step;
            remaining -= step;
        }
        Ok(())
    }

    /// Map the largest block possible at `va`, returning its size.
    fn map_step(
        &mut self,
        va: u64,
        pa: u64,
        remaining: u64,
        attrs: MapAttributes,
    ) -> Result<u64, TableError> {
        let mut table = self.root;
        let mut level = Level::L0;
        loop {
            let size = level.entry_size();
            let index = level.index(va);
            let entries = self
                .allocator
                .table_mut(table)
                .ok_or(TableError::ForeignTable(table))?;
            let existing = Descriptor::from_raw(entries[index]);

            let fits = va % size == 0 && pa % size == 0 && remaining >= size;
            if level.can_map_leaf() && fits {
                if existing.is_valid() {
                    return Err(TableError::AlreadyMapped(VirtAddr::new(va)));
                }
                entries[index] = Descriptor::new_leaf(level, PhysAddr::new(pa), attrs).as_raw();
                return Ok(size);
            }

            let next = level.next().ok_or(TableError::NotAligned(VirtAddr::new(va)))?;
            table = if existing.is_table(level) {
                existing.output_address()
            } else if existing.is_valid() {
                return Err(TableError::AlreadyMapped(VirtAddr::new(va)));
            } else {
                let new = self
                    .allocator
                    .allocate_table()
                    .ok_or(TableError::AllocationFailed)?;
                let entries = self
                    .allocator
                    .table_mut(table)
                    .ok_or(TableError::ForeignTable(table))?;
                entries[index] = Descriptor::new_table(new).as_raw();
                new
            };
            level = next;
        }
    }

    /// Software walk of the installed tables.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, MapAttributes)> {
        let va = va.as_u64();
        let mut table = self.root;
        let mut level = Level::L0;
        loop {
            let entries = self.allocator.table(table)?;
            let desc = Descriptor::from_raw(entries[level.index(va)]);
            if desc.is_leaf(level) {
                let offset = va & (level.entry_size() - 1);
                return Some((desc.output_address().checked_add(offset)?, desc.attributes()));
            }
            if !desc.is_table(level) {
                return None;
            }
            table = desc.output_address();
            level = level.next()?;
        }
    }
}

/// A page-aligned table slot
#[repr(C, align(4096))]
struct AlignedTable(RawTable);

/// Fixed pool of tables addressed by their own location.
///
/// Usable while the MMU is off (or under an identity map), where a table's
/// address is its physical address. The pool must not move once a table
/// has been handed out, so pass it boxed or by `&mut`.
pub struct TablePool<const N: usize> {
    tables: [AlignedTable; N],
    used: usize,
}

impl<const N: usize> TablePool<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tables: [const { AlignedTable([0; ENTRIES_PER_TABLE]) }; N],
            used: 0,
        }
    }

    /// Tables handed out so far
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    fn slot(&self, pa: PhysAddr) -> Option<usize> {
        let base = self.tables.as_ptr() as u64;
        let off = pa.checked_offset_from(PhysAddr::new(base))?;
        let index = usize::try_from(off / PAGE_SIZE).ok()?;
        (off % PAGE_SIZE == 0 && index < self.used).then_some(index)
    }
}

impl<const N: usize> Default for TablePool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TableAllocator for TablePool<N> {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        let slot = self.tables.get_mut(self.used)?;
        slot.0 = [0; ENTRIES_PER_TABLE];
        let pa = PhysAddr::new(slot.0.as_ptr() as u64);
        self.used += 1;
        Some(pa)
    }

    fn table(&self, pa: PhysAddr) -> Option<&RawTable> {
        let index = self.slot(pa)?;
        Some(&self.tables[index].0)
    }

    fn table_mut(&mut self, pa: PhysAddr) -> Option<&mut RawTable> {
        let index = self.slot(pa)?;
        Some(&mut self.tables[index].0)
    }
}

impl<A: TableAllocator + ?Sized> TableAllocator for Box<A> {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        (**self).allocate_table()
    }

    fn table(&self, pa: PhysAddr) -> Option<&RawTable> {
        (**self).table(pa)
    }

    fn table_mut(&mut self, pa: PhysAddr) -> Option<&mut RawTable> {
        (**self).table_mut(pa)
    }
}

impl<A: TableAllocator + ?Sized> TableAllocator for &mut A {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        (**self).allocate_table()
    }

    fn table(&self, pa: PhysAddr) -> Option<&RawTable> {
        (**self).table(pa)
    }

    fn table_mut(&mut self, pa: PhysAddr) -> Option<&mut RawTable> {
        (**self).table_mut(pa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{DEVICE_WINDOW_BASE, KERNEL_WINDOW_BASE, LINEAR_WINDOW_BASE};
    use crate::{LayoutPolicy, MappingClass, compute_mappings};
    use alloc::vec;
    use alloc::vec::Vec;
    use axon_common::memory::RegionFlags;
    use axon_common::{KernelImage, MemoryRegion, RegionClass};

    fn region(base: u64, len: u64, class: RegionClass) -> MemoryRegion {
        MemoryRegion::try_new(PhysAddr::new(base), len, class).unwrap()
    }

    fn layout() -> MappingTable {
        let regions = vec![
            region(0x0, 0x3F00_0000, RegionClass::Ram),
            region(0x3F00_0000, 0x100_0000, RegionClass::Reserved).with_flags(RegionFlags::NO_MAP),
            region(0x4000_0000, 0x1000, RegionClass::Mmio),
            region(0x4010_0000, 0x1_0000, RegionClass::Mmio),
            region(0x4020_0000, 0x1_0000, RegionClass::Mmio),
        ];
        let image = KernelImage::new(
            PhysAddr::new(0x8_0000),
            VirtAddr::new(KERNEL_WINDOW_BASE + 0x8_0000),
            0x12_3456,
        );
        compute_mappings(&regions, &image, &LayoutPolicy::default()).unwrap()
    }

    #[test]
    fn test_walk_matches_mapping_table() {
        let layout = layout();
        let mut tables = TranslationTables::new(Box::new(TablePool::<16>::new())).unwrap();
        tables.map_all(&layout).unwrap();

        for va in [
            LINEAR_WINDOW_BASE,
            LINEAR_WINDOW_BASE + 0x1234_5678,
            LINEAR_WINDOW_BASE + 0x3EFF_FFF8,
            DEVICE_WINDOW_BASE + 0x18,
            DEVICE_WINDOW_BASE + 0x20_0040,
            KERNEL_WINDOW_BASE + 0x8_0000,
            KERNEL_WINDOW_BASE + 0x1A_3FF0,
        ] {
            let va = VirtAddr::new(va);
            let expected = layout.virt_to_phys(va).unwrap();
            let attrs = layout.mapping_for_virt(va).unwrap().attributes;
            assert_eq!(tables.translate(va), Some((expected, attrs)), "walk of {}", va);
        }
        assert_eq!(tables.translate(VirtAddr::new(DEVICE_WINDOW_BASE + 0x1000)), None);
        assert_eq!(tables.translate(VirtAddr::new(LINEAR_WINDOW_BASE + 0x3F00_0000)), None);
    }

    #[test]
    fn test_uses_blocks_for_linear_map() {
        let layout = layout();
        let mut tables = TranslationTables::new(Box::new(TablePool::<16>::new())).unwrap();
        let linear: Vec<_> = layout.iter_class(MappingClass::Linear).copied().collect();
        tables.map(&linear[0]).unwrap();
        // Root, one L1 and one L2 holding 504 2MB blocks
        assert_eq!(tables.into_allocator().used(), 3);
    }

    #[test]
    fn test_double_map_rejected() {
        let layout = layout();
        let mut tables = TranslationTables::new(Box::new(TablePool::<16>::new())).unwrap();
        let dev = *layout.iter_class(MappingClass::Device).next().unwrap();
        tables.map(&dev).unwrap();
        assert_eq!(tables.map(&dev), Err(TableError::AlreadyMapped(dev.virt_base)));
    }

    #[test]
    fn test_pool_exhaustion() {
        let layout = layout();
        let mut tables = TranslationTables::new(Box::new(TablePool::<2>::new())).unwrap();
        assert_eq!(tables.map_all(&layout), Err(TableError::AllocationFailed));
    }

    #[test]
    fn test_foreign_table_lookup() {
        let pool = TablePool::<2>::new();
        assert!(pool.table(PhysAddr::new(0x1000)).is_none());
    }
}
