//! Platform Service Facade
//!
//! The single interface drivers, the bring-up coordinator and the
//! accelerator pipeline use to reach the platform: address translation,
//! the monotonic clock, one-shot timers, the console, power-off and the
//! MMIO/interrupt resources described at boot.
//!
//! One [`PlatformServices`] is built per boot, after the descriptor has
//! been resolved and the address space partitioned, and then handed out by
//! reference. It is never rebuilt.

mod irq;
mod timer_queue;

use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use axon_common::{PhysAddr, VirtAddr};
use axon_paging::{MappingClass, MappingTable, TranslateError};
use axon_pal::console::ConsoleWriter;
use axon_pal::descriptor::DeviceWindow;
use axon_pal::{ConsoleDevice, CounterHardware, Instant, PlatformDescriptor, PowerControl, PsciError, TickConverter};
use spin::Mutex;

pub use irq::{IrqError, IrqHandler, IrqTable, MAX_IRQ};
pub use timer_queue::{Expired, TimerCallback, TimerId, TimerQueue};

/// Hardware handles the facade is built over
#[derive(Clone, Copy)]
pub struct PlatformHardware {
    pub console: &'static dyn ConsoleDevice,
    pub counter: &'static dyn CounterHardware,
    pub power: &'static dyn PowerControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "service construction errors must be handled"]
pub enum ServiceError {
    /// Neither the descriptor nor the counter gave a usable frequency
    NoClock(u64),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoClock(hz) => write!(f, "unusable counter frequency {} Hz", hz),
        }
    }
}

pub struct PlatformServices {
    descriptor: PlatformDescriptor,
    mappings: MappingTable,
    hw: PlatformHardware,
    clock: TickConverter,
    timers: Mutex<TimerQueue>,
    irqs: IrqTable,
}

impl PlatformServices {
    /// Build the facade. A frequency in the descriptor overrides the
    /// counter's own register.
    pub fn new(
        descriptor: PlatformDescriptor,
        mappings: MappingTable,
        hw: PlatformHardware,
    ) -> Result<Self, ServiceError> {
        let frequency = descriptor
            .timer_frequency()
            .map_or_else(|| hw.counter.frequency(), u64::from);
        let clock = TickConverter::new(frequency).ok_or(ServiceError::NoClock(frequency))?;

        log::debug!(
            "services: {} mappings, counter at {} Hz",
            mappings.mappings().len(),
            frequency
        );

        Ok(Self {
            descriptor,
            mappings,
            hw,
            clock,
            timers: Mutex::new(TimerQueue::new()),
            irqs: IrqTable::new(),
        })
    }

    pub fn descriptor(&self) -> &PlatformDescriptor {
        &self.descriptor
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    // -- Address translation

    /// Fails with `AddressNotMapped` outside every mapping, never clamps.
    pub fn phys_to_virt(&self, pa: PhysAddr) -> Result<VirtAddr, TranslateError> {
        self.mappings.phys_to_virt(pa)
    }

    pub fn virt_to_phys(&self, va: VirtAddr) -> Result<PhysAddr, TranslateError> {
        self.mappings.virt_to_phys(va)
    }

    /// Translate through one mapping class only
    pub fn phys_to_virt_in(&self, class: MappingClass, pa: PhysAddr) -> Result<VirtAddr, TranslateError> {
        self.mappings.phys_to_virt_in(class, pa)
    }

    /// `[pa, pa + len)` is covered by a single mapping
    pub fn is_range_mapped(&self, pa: PhysAddr, len: u64) -> bool {
        self.mappings.is_range_mapped(pa, len)
    }

    // -- Time

    pub fn now(&self) -> Instant {
        Instant::from_ticks(self.hw.counter.counter())
    }

    pub fn clock(&self) -> &TickConverter {
        &self.clock
    }

    pub fn now_nanos(&self) -> u64 {
        self.clock.ticks_to_nanos(self.now().ticks())
    }

    pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        self.clock.ticks_to_nanos(ticks)
    }

    pub fn nanos_to_ticks(&self, nanos: u64) -> u64 {
        self.clock.nanos_to_ticks(nanos)
    }

    /// Absolute deadline `after` from now, rounded so it never fires early
    pub fn deadline_after(&self, after: Duration) -> Instant {
        self.now().saturating_add_ticks(self.clock.duration_to_ticks(after))
    }

    pub fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.clock.ticks_to_duration(self.now().ticks_since(earlier))
    }

    /// Pause briefly inside a polling loop
    pub fn relax(&self) {
        core::hint::spin_loop();
    }

    // -- One-shot timers

    /// Arm a one-shot timer for absolute `deadline`.
    ///
    /// Does not wait: `callback` runs from [`handle_timer_interrupt`](Self::handle_timer_interrupt)
    /// once the deadline has passed. A deadline already in the past fires on
    /// the next interrupt.
    pub fn arm_oneshot(&self, deadline: Instant, callback: TimerCallback, context: usize) -> TimerId {
        let mut timers = self.timers.lock();
        let id = timers.arm(deadline, callback, context);
        self.program_comparator(&timers);
        id
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.timers.lock();
        let removed = timers.cancel(id);
        self.program_comparator(&timers);
        removed
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Fire every expired timer and reprogram the comparator.
    ///
    /// Callbacks run after the queue lock is released so they may arm new
    /// timers. Returns the number fired.
    pub fn handle_timer_interrupt(&self) -> usize {
        let expired = {
            let mut timers = self.timers.lock();
            let expired = timers.expire(self.now());
            self.program_comparator(&timers);
            expired
        };
        let fired = expired.len();
        for timer in expired {
            timer.fire();
        }
        fired
    }

    fn program_comparator(&self, timers: &TimerQueue) {
        match timers.earliest() {
            Some(deadline) => self.hw.counter.set_deadline(deadline.ticks()),
            None => self.hw.counter.cancel_deadline(),
        }
    }

    // -- Console

    pub fn console_write(&self, bytes: &[u8]) {
        self.hw.console.write_bytes(bytes);
    }

    pub fn console_read(&self) -> Option<u8> {
        self.hw.console.read_byte()
    }

    pub fn console_writer(&self) -> ConsoleWriter<'static> {
        ConsoleWriter::new(self.hw.console)
    }

    pub fn console_device(&self) -> &'static dyn ConsoleDevice {
        self.hw.console
    }

    // -- Power

    /// Power the system off. Only returns if firmware refuses.
    pub fn power_off(&self) -> Result<(), PsciError> {
        log::info!("services: powering off");
        self.hw.power.system_off()
    }

    // -- Driver resources

    pub fn mmio_windows(&self) -> &[DeviceWindow] {
        self.descriptor.windows()
    }

    pub fn find_window(&self, compatible: &str) -> Option<&DeviceWindow> {
        self.descriptor.find_window(compatible)
    }

    /// Virtual base of a device window through the device mapping
    pub fn window_virt(&self, window: &DeviceWindow) -> Result<VirtAddr, TranslateError> {
        self.mappings.phys_to_virt_in(MappingClass::Device, window.base)
    }

    /// Interrupt ids routed from the named source
    pub fn irqs_for(&self, source: &str) -> Vec<u32> {
        self.descriptor
            .interrupts()
            .iter()
            .filter(|r| r.source == source)
            .map(|r| r.irq)
            .collect()
    }

    pub fn register_irq(&self, irq: u32, handler: IrqHandler, context: usize) -> Result<(), IrqError> {
        self.irqs.register(irq, handler, context)
    }

    pub fn unregister_irq(&self, irq: u32) -> Result<(), IrqError> {
        self.irqs.unregister(irq)
    }

    /// Route an acknowledged interrupt. The timer interrupt goes to
    /// [`handle_timer_interrupt`](Self::handle_timer_interrupt).
    pub fn dispatch_irq(&self, irq: u32) -> bool {
        if irq == self.descriptor.timer_irq() && !self.irqs.is_registered(irq) {
            self.handle_timer_interrupt();
            return true;
        }
        let handled = self.irqs.dispatch(irq);
        if !handled {
            log::warn!("services: spurious irq {}", irq);
        }
        handled
    }
}

impl fmt::Debug for PlatformServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformServices")
            .field("model", &self.descriptor.model())
            .field("mappings", &self.mappings.mappings().len())
            .field("frequency", &self.clock.frequency())
            .finish()
    }
}
