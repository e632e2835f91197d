//! # axon-kernel
//!
//! Boot and platform layer for a multi-core ARM kernel with an on-die
//! neural accelerator.
//!
//! Boot proceeds strictly leaf-first:
//!
//! 1. the hardware descriptor blob is resolved ([`axon_pal::descriptor`])
//! 2. boot arguments become a [`config::KernelConfig`]
//! 3. memory is partitioned into per-class mappings ([`axon_paging`])
//! 4. the [`services::PlatformServices`] facade is built and handed out by
//!    reference to everything after it
//! 5. the [`smp::BringupCoordinator`] publishes the layout and starts the
//!    secondary cores
//! 6. drivers are bound through the [`driver::DriverRegistry`] and the
//!    [`npu::AcceleratorPipeline`] is initialised
//!
//! [`boot::boot_primary`] runs that sequence against trait-backed hardware
//! so it can be exercised on the host; `main.rs` wires in the real devices.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod boot;
pub mod config;
pub mod driver;
pub mod logging;
pub mod npu;
pub mod services;
pub mod smp;

#[cfg(test)]
pub(crate) mod testing;
