//! Paging - address space partitioning and translation tables
//!
//! Turns the resolved memory map into per-class virtual mappings and,
//! from those, into ARM64 translation tables.
//!
//! # Architecture
//!
//! - `permissions`: memory types and access rights carried by a mapping
//! - `mapping`: [`AddressMapping`], [`MappingTable`] and phys/virt translation
//! - `partition`: [`compute_mappings`], the layout policy for each class
//! - `arch::arm64`: descriptor encoding and the table builder
//!
//! # Mapping classes
//!
//! There is no single global physical-to-virtual offset. The kernel image,
//! the linear map of RAM and the device window each get their own offset,
//! so code, RAM and MMIO can sit anywhere relative to each other in the
//! physical map.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod mapping;
pub mod partition;
pub mod permissions;

pub use mapping::{AddressMapping, MappingClass, MappingTable, OmittedRegion, TranslateError};
pub use partition::{LayoutPolicy, PartitionError, UnmappableReason, compute_mappings};
pub use permissions::{Access, MapAttributes, MemoryType};

/// Minimum mapping granule (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// Number of entries per translation table (512 for 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");
const _: () = assert!(
    PAGE_SIZE * ENTRIES_PER_TABLE as u64 == 2 * 1024 * 1024,
    "L2 block size must be 2MB"
);
