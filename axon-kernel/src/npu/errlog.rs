//! Accelerator error log
//!
//! Bounded record of task and device failures. When full, the oldest entry
//! is dropped; sequence numbers keep counting so a reader can tell.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use super::task::TaskId;

/// How a device loss was noticed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The device raised a loss event itself
    Reported,
    /// The heartbeat check failed
    Heartbeat,
    /// A task outlived the hang timeout
    Hang(TaskId),
    /// A dispatch call failed with something other than busy/rejected
    DispatchFailed,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported => f.write_str("reported by device"),
            Self::Heartbeat => f.write_str("heartbeat lost"),
            Self::Hang(task) => write!(f, "{} hung", task),
            Self::DispatchFailed => f.write_str("dispatch failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputRejected,
    DeviceFault(u32),
    DeviceLost(LossReason),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputRejected => f.write_str("input rejected"),
            Self::DeviceFault(code) => write!(f, "device fault {:#x}", code),
            Self::DeviceLost(reason) => write!(f, "device lost: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub generation: u32,
    /// Task the error belongs to, `None` for device-wide errors
    pub task: Option<TaskId>,
    pub kind: ErrorKind,
}

#[derive(Debug)]
pub struct ErrorLog {
    entries: VecDeque<ErrorLogEntry>,
    capacity: usize,
    next_sequence: u64,
    dropped: u64,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 0,
            dropped: 0,
        }
    }

    pub fn record(&mut self, timestamp_ns: u64, generation: u32, task: Option<TaskId>, kind: ErrorKind) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(ErrorLogEntry {
            sequence: self.next_sequence,
            timestamp_ns,
            generation,
            task,
            kind,
        });
        self.next_sequence += 1;
    }

    /// Shrink or grow the bound, dropping the oldest entries that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<ErrorLogEntry> {
        self.entries.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries pushed out by newer ones since boot
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
