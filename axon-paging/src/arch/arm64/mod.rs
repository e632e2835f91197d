//! ARM64 (AArch64) translation tables
//!
//! 4-level tables with a 4KB granule and 48-bit virtual addresses:
//! - L0: 512GB per entry (table only)
//! - L1: 1GB per entry (table or block)
//! - L2: 2MB per entry (table or block)
//! - L3: 4KB per entry (page only)

pub mod descriptors;
pub mod tables;

pub use descriptors::{Descriptor, Level, MAIR_EL1_VALUE};
pub use tables::{RawTable, TableAllocator, TableError, TablePool, TranslationTables};
