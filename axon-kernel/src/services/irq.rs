//! Interrupt handler table
//!
//! Drivers register a handler per interrupt id; the exception path calls
//! [`IrqTable::dispatch`] with the acknowledged id.

use alloc::collections::BTreeMap;
use core::fmt;

use spin::Mutex;

/// Highest interrupt id accepted (GICv3 SPI range ends at 1019)
pub const MAX_IRQ: u32 = 1019;

/// Called with the interrupt id and the registered context
pub type IrqHandler = fn(u32, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "irq registration errors must be handled"]
pub enum IrqError {
    AlreadyRegistered(u32),
    InvalidIrq(u32),
    NotRegistered(u32),
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered(irq) => write!(f, "irq {} already has a handler", irq),
            Self::InvalidIrq(irq) => write!(f, "irq {} out of range", irq),
            Self::NotRegistered(irq) => write!(f, "irq {} has no handler", irq),
        }
    }
}

#[derive(Clone, Copy)]
struct Slot {
    handler: IrqHandler,
    context: usize,
    count: u64,
}

#[derive(Default)]
pub struct IrqTable {
    slots: Mutex<BTreeMap<u32, Slot>>,
}

impl IrqTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, irq: u32, handler: IrqHandler, context: usize) -> Result<(), IrqError> {
        if irq > MAX_IRQ {
            return Err(IrqError::InvalidIrq(irq));
        }
        let mut slots = self.slots.lock();
        if slots.contains_key(&irq) {
            return Err(IrqError::AlreadyRegistered(irq));
        }
        slots.insert(
            irq,
            Slot {
                handler,
                context,
                count: 0,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, irq: u32) -> Result<(), IrqError> {
        self.slots
            .lock()
            .remove(&irq)
            .map(|_| ())
            .ok_or(IrqError::NotRegistered(irq))
    }

    /// Run the handler for `irq`. Returns false for a spurious interrupt.
    ///
    /// The handler runs without the table lock held so it may register or
    /// unregister interrupts itself.
    pub fn dispatch(&self, irq: u32) -> bool {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&irq) {
                Some(slot) => {
                    slot.count += 1;
                    *slot
                }
                None => return false,
            }
        };
        (slot.handler)(irq, slot.context);
        true
    }

    /// Times `irq` has been dispatched
    pub fn count(&self, irq: u32) -> u64 {
        self.slots.lock().get(&irq).map_or(0, |s| s.count)
    }

    pub fn is_registered(&self, irq: u32) -> bool {
        self.slots.lock().contains_key(&irq)
    }
}
