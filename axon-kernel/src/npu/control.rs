//! Accelerator control surface
//!
//! Numeric command interface over the pipeline for callers that only pass
//! registers around (a system call layer, a debug shell).
//!
//! # ABI
//!
//! - command number selects the operation
//! - `args[0..6]` carry its arguments
//! - `out[0..4]` receive results, also on some errors (see each command)
//! - the return value is 0 on success or a negative [`ControlError`]

use core::time::Duration;

use axon_common::PhysAddr;

use super::dma::DmaError;
use super::errlog::{ErrorKind, LossReason};
use super::pipeline::{
    AcceleratorConfig, AcceleratorInitError, AcceleratorPipeline, AwaitOutcome, CancelOutcome, DeviceStatus,
    PipelineError, SubmitError,
};
use super::task::{BufferRegion, InputDescriptor, Priority, TaskError, TaskId, TaskState};

/// Control command numbers
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NpuCommand {
    /// out: [present, cores, hw queue depth, status | generation << 8]
    Query = 0,
    /// args: [input pa, input len, format, output pa, output len, priority]
    /// out: [task id]
    Submit = 1,
    /// args: [task id]; out: [state, error]
    Poll = 2,
    /// args: [task id, timeout ns]; out: [state, error]
    Wait = 3,
    /// args: [task id]; out: [0 cancelled | 1 advisory | 2 already finished]
    Cancel = 4,
    /// args: [task id]; out: [bytes written, output pa], or [_, error] on TaskFailed
    Take = 5,
    /// args: [len]; out: [pa, va, len]
    Alloc = 6,
    /// args: [pa, len]
    Free = 7,
    /// args: [index]; out: [entries, sequence, task id or u64::MAX, kind | detail << 8]
    ErrorLog = 8,
    ClearErrorLog = 9,
    /// out: [generation, queue depth]
    Init = 10,
}

impl NpuCommand {
    pub const fn from_number(num: u64) -> Option<Self> {
        Some(match num {
            0 => Self::Query,
            1 => Self::Submit,
            2 => Self::Poll,
            3 => Self::Wait,
            4 => Self::Cancel,
            5 => Self::Take,
            6 => Self::Alloc,
            7 => Self::Free,
            8 => Self::ErrorLog,
            9 => Self::ClearErrorLog,
            10 => Self::Init,
            _ => return None,
        })
    }
}

/// Control return codes.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlError {
    InvalidCommand = -1,
    InvalidArg = -2,
    NotInitialized = -3,
    QueueFull = -4,
    InputRejected = -5,
    DeviceLost = -6,
    UnknownTask = -7,
    NotFinished = -8,
    /// `out` holds the task's current state
    TimedOut = -9,
    NoMemory = -10,
    InUse = -11,
    /// `out[1]` holds the task error code
    TaskFailed = -12,
    NoDevice = -13,
    /// Index past the end
    Range = -14,
    DeviceInitFailed = -15,
}

impl ControlError {
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidCommand => "InvalidCommand",
            Self::InvalidArg => "InvalidArg",
            Self::NotInitialized => "NotInitialized",
            Self::QueueFull => "QueueFull",
            Self::InputRejected => "InputRejected",
            Self::DeviceLost => "DeviceLost",
            Self::UnknownTask => "UnknownTask",
            Self::NotFinished => "NotFinished",
            Self::TimedOut => "TimedOut",
            Self::NoMemory => "NoMemory",
            Self::InUse => "InUse",
            Self::TaskFailed => "TaskFailed",
            Self::NoDevice => "NoDevice",
            Self::Range => "Range",
            Self::DeviceInitFailed => "DeviceInitFailed",
        }
    }
}

impl From<SubmitError> for ControlError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::NotInitialized => Self::NotInitialized,
            SubmitError::QueueFull => Self::QueueFull,
            SubmitError::InputRejected(_) => Self::InputRejected,
            SubmitError::DeviceLost => Self::DeviceLost,
        }
    }
}

impl From<PipelineError> for ControlError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::UnknownTask(_) => Self::UnknownTask,
            PipelineError::NotFinished(_) => Self::NotFinished,
        }
    }
}

impl From<DmaError> for ControlError {
    fn from(e: DmaError) -> Self {
        match e {
            DmaError::NoPool | DmaError::OutOfMemory { .. } => Self::NoMemory,
            DmaError::ZeroLength | DmaError::UnknownBuffer(_) => Self::InvalidArg,
            DmaError::InUse => Self::InUse,
        }
    }
}

impl From<AcceleratorInitError> for ControlError {
    fn from(e: AcceleratorInitError) -> Self {
        match e {
            AcceleratorInitError::DeviceNotPresent => Self::NoDevice,
            AcceleratorInitError::DeviceInitFailed(_) => Self::DeviceInitFailed,
        }
    }
}

pub type ControlResult = Result<(), ControlError>;

/// Convert a result to the raw return value
#[inline]
pub const fn to_return_value(result: ControlResult) -> i64 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// Arguments in, results out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlArgs {
    pub args: [u64; 6],
    pub out: [u64; 4],
}

impl ControlArgs {
    pub fn new(args: &[u64]) -> Self {
        let mut a = Self::default();
        let n = args.len().min(a.args.len());
        a.args[..n].copy_from_slice(&args[..n]);
        a
    }
}

const fn state_code(state: TaskState) -> (u64, u64) {
    match state {
        TaskState::Queued => (0, 0),
        TaskState::Dispatched => (1, 0),
        TaskState::Executing => (2, 0),
        TaskState::Completed => (3, 0),
        TaskState::Failed(e) => (4, error_code(e)),
    }
}

/// Task error as a number: 1 input rejected, 2 fault (code << 8), 3 lost, 4 cancelled
const fn error_code(e: TaskError) -> u64 {
    match e {
        TaskError::InputRejected => 1,
        TaskError::DeviceFault(code) => 2 | ((code as u64) << 8),
        TaskError::DeviceLost => 3,
        TaskError::Cancelled => 4,
    }
}

const fn kind_code(kind: ErrorKind) -> u64 {
    match kind {
        ErrorKind::InputRejected => 1,
        ErrorKind::DeviceFault(code) => 2 | ((code as u64) << 8),
        ErrorKind::DeviceLost(LossReason::Reported) => 3,
        ErrorKind::DeviceLost(LossReason::Heartbeat) => 3 | (1 << 8),
        ErrorKind::DeviceLost(LossReason::Hang(task)) => 3 | (2 << 8) | (task.0 << 16),
        ErrorKind::DeviceLost(LossReason::DispatchFailed) => 3 | (3 << 8),
    }
}

pub struct NpuControl<'a> {
    pipeline: &'a AcceleratorPipeline,
    config: AcceleratorConfig,
}

impl<'a> NpuControl<'a> {
    /// `config` is used by the `Init` command.
    pub fn new(pipeline: &'a AcceleratorPipeline, config: AcceleratorConfig) -> Self {
        Self { pipeline, config }
    }

    /// Run one command.
    pub fn handle(&self, cmd: u64, a: &mut ControlArgs) -> ControlResult {
        let Some(command) = NpuCommand::from_number(cmd) else {
            log::debug!("npu: unknown control command {}", cmd);
            return Err(ControlError::InvalidCommand);
        };
        a.out = [0; 4];
        let p = self.pipeline;

        match command {
            NpuCommand::Init => {
                let handle = p.init_accelerator(self.config)?;
                a.out[0] = u64::from(handle.generation);
                a.out[1] = handle.queue_depth as u64;
            }
            NpuCommand::Query => {
                let devices = p.get_available_devices();
                let Some(dev) = devices.first() else {
                    return Err(ControlError::NoDevice);
                };
                let status = match dev.status {
                    DeviceStatus::Uninitialized => 0,
                    DeviceStatus::Ready => 1,
                    DeviceStatus::Lost => 2,
                };
                a.out = [
                    devices.len() as u64,
                    u64::from(dev.cores),
                    dev.hw_queue_depth as u64,
                    status | (u64::from(dev.generation) << 8),
                ];
            }
            NpuCommand::Submit => {
                let [in_pa, in_len, format, out_pa, out_len, prio] = a.args;
                let priority = match prio {
                    0 => Priority::Normal,
                    1 => Priority::High,
                    _ => return Err(ControlError::InvalidArg),
                };
                let format = u32::try_from(format).map_err(|_| ControlError::InvalidArg)?;
                let input = InputDescriptor::new(
                    BufferRegion::new(PhysAddr::new(in_pa), in_len),
                    format,
                    BufferRegion::new(PhysAddr::new(out_pa), out_len),
                );
                a.out[0] = p.submit_with(input, priority)?.0;
            }
            NpuCommand::Poll => {
                let (state, err) = state_code(p.poll(TaskId(a.args[0]))?);
                a.out[0] = state;
                a.out[1] = err;
            }
            NpuCommand::Wait => {
                let outcome = p.await_completion(TaskId(a.args[0]), Duration::from_nanos(a.args[1]))?;
                let (state, timed_out) = match outcome {
                    AwaitOutcome::Finished(s) => (s, false),
                    AwaitOutcome::TimedOut(s) => (s, true),
                };
                (a.out[0], a.out[1]) = state_code(state);
                if timed_out {
                    return Err(ControlError::TimedOut);
                }
            }
            NpuCommand::Cancel => {
                a.out[0] = match p.cancel(TaskId(a.args[0]))? {
                    CancelOutcome::Cancelled => 0,
                    CancelOutcome::Advisory => 1,
                    CancelOutcome::AlreadyFinished => 2,
                };
            }
            NpuCommand::Take => match p.take_result(TaskId(a.args[0]))? {
                Ok(result) => {
                    a.out[0] = result.bytes_written;
                    a.out[1] = result.output.phys.as_u64();
                }
                Err(e) => {
                    a.out[1] = error_code(e);
                    return Err(ControlError::TaskFailed);
                }
            },
            NpuCommand::Alloc => {
                let buf = p.alloc_buffer(a.args[0])?;
                a.out[0] = buf.phys.as_u64();
                a.out[1] = buf.virt.as_u64();
                a.out[2] = buf.len;
            }
            NpuCommand::Free => {
                p.free_buffer(BufferRegion::new(PhysAddr::new(a.args[0]), a.args[1]))?;
            }
            NpuCommand::ErrorLog => {
                let logs = p.get_error_logs();
                let index = usize::try_from(a.args[0]).map_err(|_| ControlError::Range)?;
                a.out[0] = logs.len() as u64;
                let entry = logs.get(index).ok_or(ControlError::Range)?;
                a.out[1] = entry.sequence;
                a.out[2] = entry.task.map_or(u64::MAX, |t| t.0);
                a.out[3] = kind_code(entry.kind);
            }
            NpuCommand::ClearErrorLog => p.clear_error_logs(),
        }
        Ok(())
    }
}
