//! Console devices
//!
//! Byte-level console output and input, plus a [`fmt::Write`] adaptor that
//! turns `\n` into `\r\n` for serial terminals.

use core::fmt;

use axon_common::VirtAddr;

/// A byte-oriented console.
pub trait ConsoleDevice: Send + Sync {
    /// Write one byte, blocking until the device accepts it.
    fn write_byte(&self, byte: u8);

    /// Read one byte if one is waiting.
    fn read_byte(&self) -> Option<u8>;

    /// Write a run of bytes with `\n` expanded to `\r\n`.
    fn write_bytes(&self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
    }
}

/// PL011 register offsets and flag bits
pub mod pl011 {
    /// Data register
    pub const DR: usize = 0x00;
    /// Flag register
    pub const FR: usize = 0x18;
    /// Receive FIFO empty
    pub const FR_RXFE: u32 = 1 << 4;
    /// Transmit FIFO full
    pub const FR_TXFF: u32 = 1 << 5;
}

/// ARM PL011 UART reached through its mapped register window
#[derive(Debug)]
pub struct Pl011 {
    base: VirtAddr,
}

impl Pl011 {
    /// # Safety
    /// `base` must be the mapped virtual address of a PL011 register block
    /// that stays mapped for the lifetime of the returned value.
    #[must_use]
    pub const unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        (self.base.as_u64() as usize + offset) as *mut u32
    }
}

// SAFETY: the registers are accessed with single volatile loads and stores
unsafe impl Send for Pl011 {}
// SAFETY: as above
unsafe impl Sync for Pl011 {}

impl ConsoleDevice for Pl011 {
    fn write_byte(&self, byte: u8) {
        // SAFETY: `new` guarantees the register block is mapped
        unsafe {
            while core::ptr::read_volatile(self.reg(pl011::FR)) & pl011::FR_TXFF != 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile(self.reg(pl011::DR), u32::from(byte));
        }
    }

    fn read_byte(&self) -> Option<u8> {
        // SAFETY: `new` guarantees the register block is mapped
        unsafe {
            if core::ptr::read_volatile(self.reg(pl011::FR)) & pl011::FR_RXFE != 0 {
                return None;
            }
            Some((core::ptr::read_volatile(self.reg(pl011::DR)) & 0xFF) as u8)
        }
    }
}

/// Console writer for `fmt::Write`
pub struct ConsoleWriter<'a> {
    device: &'a dyn ConsoleDevice,
}

impl<'a> ConsoleWriter<'a> {
    #[must_use]
    pub fn new(device: &'a dyn ConsoleDevice) -> Self {
        Self { device }
    }
}

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.device.write_bytes(s.as_bytes());
        Ok(())
    }
}
