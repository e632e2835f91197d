//! # axon-common
//!
//! Shared types and constants for the axon kernel crates.
//!
//! - [`PhysAddr`] / [`VirtAddr`]: address newtypes used across crate boundaries
//! - [`MemoryRegion`](memory::MemoryRegion): a resolved physical range and its class
//! - [`CoreId`](boot::CoreId) and [`KernelImage`](boot::KernelImage): boot-time facts
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies so every other
//! axon crate can build on it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod boot;
pub mod memory;

pub use addr::{PhysAddr, VirtAddr};
pub use boot::{CoreId, InitialStack, KernelImage, MAX_CPUS};
pub use memory::{MemoryRegion, RegionClass};
