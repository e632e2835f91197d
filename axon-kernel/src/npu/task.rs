//! Accelerator tasks
//!
//! A task is owned by the pipeline from `submit` until the caller consumes
//! it with `take_result` or `discard`. Its state only moves forward:
//!
//! ```text
//! Queued -> Dispatched -> Executing -> Completed
//!    \           \            \
//!     `-----------`------------`----> Failed(..)
//! ```
//!
//! Steps may be skipped (a device can report completion without a start
//! event) but never reversed, and the two terminal states are final.

use core::fmt;

use axon_common::PhysAddr;
use axon_pal::Instant;

/// Unique, monotonically assigned task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The device refused the input descriptor
    InputRejected,
    /// The device reported an error for this task only; it stays usable
    DeviceFault(u32),
    /// The device stopped responding; every unfinished task of the same
    /// generation fails with this
    DeviceLost,
    /// Cancelled before it reached the hardware
    Cancelled,
}

impl TaskError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputRejected => "input rejected",
            Self::DeviceFault(_) => "device fault",
            Self::DeviceLost => "device lost",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceFault(code) => write!(f, "device fault (code {:#x})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Dispatched,
    Executing,
    Completed,
    Failed(TaskError),
}

impl TaskState {
    /// Position in the forward order; terminal states share the top rank
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Dispatched => 1,
            Self::Executing => 2,
            Self::Completed | Self::Failed(_) => 3,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// `next` is a legal successor of `self`
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Dispatched => f.write_str("dispatched"),
            Self::Executing => f.write_str("executing"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Dispatch priority, honoured only by devices that can reorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// A physical buffer handed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub phys: PhysAddr,
    pub len: u64,
}

impl BufferRegion {
    #[must_use]
    pub const fn new(phys: PhysAddr, len: u64) -> Self {
        Self { phys, len }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.phys.as_u64().saturating_add(self.len)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.phys.as_u64() < other.end()
            && other.phys.as_u64() < self.end()
    }
}

/// What to run: an input buffer, its format tag and where to put the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDescriptor {
    pub region: BufferRegion,
    /// Model/tensor format understood by the device
    pub format: u32,
    pub output: BufferRegion,
}

impl InputDescriptor {
    #[must_use]
    pub const fn new(region: BufferRegion, format: u32, output: BufferRegion) -> Self {
        Self {
            region,
            format,
            output,
        }
    }

    /// Either buffer of `self` overlaps either buffer of `other`
    #[must_use]
    pub const fn shares_memory_with(&self, other: &Self) -> bool {
        self.region.overlaps(&other.region)
            || self.region.overlaps(&other.output)
            || self.output.overlaps(&other.region)
            || self.output.overlaps(&other.output)
    }
}

/// Where a completed task's result was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultDescriptor {
    pub output: BufferRegion,
    /// Bytes the device wrote at the start of `output`
    pub bytes_written: u64,
}

/// Returned when a state change would move a task backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// Pipeline bookkeeping for one task
#[derive(Debug, Clone)]
pub struct AcceleratorTask {
    pub id: TaskId,
    /// Device generation the task was submitted against
    pub generation: u32,
    pub input: InputDescriptor,
    pub priority: Priority,
    pub submitted_at: Instant,
    /// Set when the task was handed to the hardware
    pub dispatched_at: Option<Instant>,
    pub result: Option<ResultDescriptor>,
    /// Counted against the hardware queue
    pub(crate) in_flight: bool,
    /// Advisory cancel was requested after dispatch
    pub(crate) cancel_requested: bool,
    /// Drop the task as soon as it finishes
    pub(crate) discard_on_finish: bool,
    state: TaskState,
}

impl AcceleratorTask {
    #[must_use]
    pub fn new(
        id: TaskId,
        generation: u32,
        input: InputDescriptor,
        priority: Priority,
        submitted_at: Instant,
    ) -> Self {
        Self {
            id,
            generation,
            input,
            priority,
            submitted_at,
            dispatched_at: None,
            result: None,
            in_flight: false,
            cancel_requested: false,
            discard_on_finish: false,
            state: TaskState::Queued,
        }
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Move to `next` if that is a forward step.
    pub fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// The task's buffers must not be reused while this holds
    #[must_use]
    pub fn owns_buffers(&self) -> bool {
        !self.state.is_terminal()
    }
}
