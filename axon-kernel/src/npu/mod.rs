//! Accelerator Task Pipeline
//!
//! Runs inference tasks on the on-die neural accelerator:
//!
//! - [`task`]: task identity, state machine and buffer descriptors
//! - [`device`]: the hardware trait the pipeline drives
//! - [`pipeline`]: the shared queue, dispatch and completion tracking
//! - [`dma`]: buffers carved from the accelerator's reserved memory
//! - [`errlog`]: bounded history of task and device failures
//! - [`control`]: numeric command surface for register-passing callers

pub mod control;
pub mod device;
pub mod dma;
pub mod errlog;
pub mod pipeline;
pub mod task;

pub use control::{ControlArgs, ControlError, NpuCommand, NpuControl};
pub use device::{AcceleratorDevice, Capabilities, DeviceError, DeviceEvent, DeviceJob};
pub use dma::{DMA_ALIGN, DmaBuffer, DmaError, DmaPool};
pub use errlog::{ErrorKind, ErrorLog, ErrorLogEntry, LossReason};
pub use pipeline::{
    AcceleratorConfig, AcceleratorHandle, AcceleratorInitError, AcceleratorPipeline, AwaitOutcome, CancelOutcome,
    DeviceInfo, DeviceStatus, PipelineError, PipelineStats, RejectReason, SubmitError, TaskOutcome,
};
pub use task::{
    AcceleratorTask, BufferRegion, InputDescriptor, Priority, ResultDescriptor, TaskError, TaskId, TaskState,
};
