//! Accelerator buffer pool
//!
//! Hands out physically contiguous buffers from the reserved range the
//! descriptor sets aside for the accelerator. The range sits in the linear
//! mapping, so every buffer has a kernel virtual address as well.

use alloc::collections::BTreeMap;
use core::fmt;

use axon_common::{PhysAddr, VirtAddr};

use super::task::BufferRegion;

/// Buffers start and end on this boundary
pub const DMA_ALIGN: u64 = 64;

#[inline]
const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No buffer pool was reserved for the accelerator
    NoPool,
    ZeroLength,
    /// No free range is large enough
    OutOfMemory { requested: u64, largest_free: u64 },
    /// Not the start of a live allocation
    UnknownBuffer(PhysAddr),
    /// A task still owns the buffer
    InUse,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPool => f.write_str("no accelerator buffer pool"),
            Self::ZeroLength => f.write_str("zero-length buffer"),
            Self::OutOfMemory {
                requested,
                largest_free,
            } => write!(f, "out of buffer memory ({} requested, {} free)", requested, largest_free),
            Self::UnknownBuffer(pa) => write!(f, "no buffer at {}", pa),
            Self::InUse => f.write_str("buffer in use"),
        }
    }
}

/// A buffer from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub phys: PhysAddr,
    pub virt: VirtAddr,
    pub len: u64,
}

impl DmaBuffer {
    #[must_use]
    pub const fn region(&self) -> BufferRegion {
        BufferRegion::new(self.phys, self.len)
    }
}

/// First-fit allocator with coalescing frees.
///
/// # Invariants
///
/// - free ranges never touch or overlap each other or a live allocation
/// - every offset and length is a multiple of [`DMA_ALIGN`]
#[derive(Debug)]
pub struct DmaPool {
    base: PhysAddr,
    virt_base: VirtAddr,
    size: u64,
    /// offset -> length
    free: BTreeMap<u64, u64>,
    /// offset -> length
    used: BTreeMap<u64, u64>,
}

impl DmaPool {
    /// Manage `[base, base + size)`, reachable at `virt_base`.
    pub fn new(base: PhysAddr, virt_base: VirtAddr, size: u64) -> Self {
        let start = align_up(base.as_u64(), DMA_ALIGN) - base.as_u64();
        let usable = size.saturating_sub(start) & !(DMA_ALIGN - 1);
        let mut free = BTreeMap::new();
        if usable > 0 {
            free.insert(start, usable);
        }
        Self {
            base,
            virt_base,
            size,
            free,
            used: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn region(&self) -> BufferRegion {
        BufferRegion::new(self.base, self.size)
    }

    pub fn alloc(&mut self, len: u64) -> Result<DmaBuffer, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }
        let want = len
            .checked_add(DMA_ALIGN - 1)
            .map(|l| l & !(DMA_ALIGN - 1))
            .ok_or(DmaError::OutOfMemory {
                requested: len,
                largest_free: self.largest_free(),
            })?;

        let Some((&offset, &free_len)) = self.free.iter().find(|(_, l)| **l >= want) else {
            return Err(DmaError::OutOfMemory {
                requested: len,
                largest_free: self.largest_free(),
            });
        };
        self.free.remove(&offset);
        if free_len > want {
            self.free.insert(offset + want, free_len - want);
        }
        self.used.insert(offset, want);

        Ok(DmaBuffer {
            phys: PhysAddr::new(self.base.as_u64() + offset),
            virt: VirtAddr::new(self.virt_base.as_u64() + offset),
            len,
        })
    }

    pub fn free(&mut self, phys: PhysAddr) -> Result<(), DmaError> {
        let offset = phys
            .as_u64()
            .checked_sub(self.base.as_u64())
            .ok_or(DmaError::UnknownBuffer(phys))?;
        let mut len = self.used.remove(&offset).ok_or(DmaError::UnknownBuffer(phys))?;
        let mut start = offset;

        // Merge with the following free range
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        // and the preceding one
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back()
            && prev + prev_len == start
        {
            self.free.remove(&prev);
            start = prev;
            len += prev_len;
        }
        self.free.insert(start, len);
        Ok(())
    }

    /// Bytes not handed out
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    pub fn allocations(&self) -> usize {
        self.used.len()
    }
}
