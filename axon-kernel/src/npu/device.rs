//! Accelerator hardware interface
//!
//! The pipeline talks to the accelerator only through [`AcceleratorDevice`]:
//! it hands over complete jobs and later collects events. Nothing else is
//! shared between the two execution domains besides the job buffers.

use core::fmt;

use super::task::{BufferRegion, TaskId};

/// What the device reported at probe time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub name: &'static str,
    /// Independent execution cores on the accelerator
    pub cores: u32,
    /// Jobs the hardware accepts before reporting `Busy`
    pub hw_queue_depth: usize,
    /// The device tolerates jobs arriving out of submission order
    pub can_reorder: bool,
}

/// One unit of work handed to the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceJob {
    pub task: TaskId,
    pub format: u32,
    pub input: BufferRegion,
    pub output: BufferRegion,
}

/// Something the device reported asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Started(TaskId),
    Completed { task: TaskId, bytes_written: u64 },
    Fault { task: TaskId, code: u32 },
    Rejected(TaskId),
    /// The device stopped responding
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    NotPresent,
    InitFailed(u32),
    /// Hardware queue full, try again after a completion
    Busy,
    /// The job was refused synchronously
    Rejected,
    Lost,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent => f.write_str("device not present"),
            Self::InitFailed(code) => write!(f, "device init failed (code {:#x})", code),
            Self::Busy => f.write_str("device busy"),
            Self::Rejected => f.write_str("job rejected"),
            Self::Lost => f.write_str("device lost"),
        }
    }
}

/// An on-die neural accelerator.
pub trait AcceleratorDevice: Send + Sync {
    /// Identify the device without changing its state.
    fn probe(&self) -> Result<Capabilities, DeviceError>;

    /// Bring the device to a clean idle state, dropping any queued jobs.
    fn reset(&self) -> Result<(), DeviceError>;

    /// Queue a job. The buffers must stay untouched until the job's
    /// terminal event has been drained.
    fn dispatch(&self, job: &DeviceJob) -> Result<(), DeviceError>;

    /// Hand every pending event to `sink`, oldest first.
    fn drain_events(&self, sink: &mut dyn FnMut(DeviceEvent));

    /// The device is still alive.
    fn heartbeat(&self) -> bool;
}
