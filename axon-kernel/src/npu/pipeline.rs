//! Accelerator task pipeline
//!
//! Accepts inference tasks, feeds them to the device in submission order
//! and tracks each one until the caller collects its result.
//!
//! # Queueing
//!
//! Every task counts against `queue_depth` from `submit` until the caller
//! consumes it with [`take_result`](AcceleratorPipeline::take_result) or
//! [`discard`](AcceleratorPipeline::discard). Past that, `submit` fails
//! with [`SubmitError::QueueFull`] and nothing already accepted is touched.
//! At most `hw_queue_depth` tasks sit in the hardware at once; the rest
//! wait in a FIFO. High priority only jumps the FIFO when both the
//! configuration and the device allow reordering.
//!
//! # Failure
//!
//! A fault or rejection fails one task and the device keeps going. A loss
//! (event, missed heartbeat, hung task, failed dispatch) fails every
//! unfinished task and refuses new work until
//! [`init_accelerator`](AcceleratorPipeline::init_accelerator) runs again,
//! which starts a new device generation.
//!
//! # Locking
//!
//! `state` guards the bookkeeping and is never held across a device call.
//! `dispatch` serialises everything that feeds or resets the device so jobs
//! reach it in queue order. Lock order is `init`, then `dispatch`, then
//! `state`.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use axon_common::PhysAddr;
use spin::Mutex;

use super::device::{AcceleratorDevice, Capabilities, DeviceError, DeviceEvent, DeviceJob};
use super::dma::{DmaBuffer, DmaError, DmaPool};
use super::errlog::{ErrorKind, ErrorLog, ErrorLogEntry, LossReason};
use super::task::{
    AcceleratorTask, BufferRegion, InputDescriptor, Priority, ResultDescriptor, TaskError, TaskId, TaskState,
};
use crate::config::{
    ACCELERATOR_POOL_NAME, DEFAULT_HANG_TIMEOUT_MS, DEFAULT_QUEUE_DEPTH, ERROR_LOG_CAPACITY, MAX_QUEUE_DEPTH,
};
use crate::services::{IrqError, PlatformServices};

/// Tunables applied at `init_accelerator`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorConfig {
    /// Tasks accepted but not yet consumed
    pub queue_depth: usize,
    /// A dispatched task older than this marks the device lost
    pub hang_timeout: Duration,
    /// Let high-priority tasks overtake, if the device can reorder
    pub allow_reorder: bool,
    pub error_log_capacity: usize,
    /// Reserved area to carve buffers from
    pub pool_name: &'static str,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            hang_timeout: Duration::from_millis(DEFAULT_HANG_TIMEOUT_MS),
            allow_reorder: false,
            error_log_capacity: ERROR_LOG_CAPACITY,
            pool_name: ACCELERATOR_POOL_NAME,
        }
    }
}

/// An initialised device generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorHandle {
    pub generation: u32,
    pub capabilities: Capabilities,
    pub queue_depth: usize,
    /// Priorities are honoured
    pub reorder: bool,
    /// Buffer pool, if one was reserved
    pub pool: Option<BufferRegion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "accelerator init errors must be handled"]
pub enum AcceleratorInitError {
    DeviceNotPresent,
    DeviceInitFailed(DeviceError),
}

impl fmt::Display for AcceleratorInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotPresent => f.write_str("accelerator not present"),
            Self::DeviceInitFailed(e) => write!(f, "accelerator init failed: {}", e),
        }
    }
}

/// Why an input descriptor was refused at submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyBuffer,
    /// Input and output overlap each other
    SelfOverlap,
    NotMapped(PhysAddr),
    /// Buffers overlap those of an unfinished task
    InUse(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "submit errors must be handled"]
pub enum SubmitError {
    NotInitialized,
    QueueFull,
    InputRejected(RejectReason),
    /// The device was lost; re-initialise before submitting
    DeviceLost,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => f.write_str("accelerator not initialised"),
            Self::QueueFull => f.write_str("queue full"),
            Self::InputRejected(reason) => write!(f, "input rejected: {:?}", reason),
            Self::DeviceLost => f.write_str("device lost"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    UnknownTask(TaskId),
    NotFinished(TaskId),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTask(id) => write!(f, "unknown {}", id),
            Self::NotFinished(id) => write!(f, "{} not finished", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    Finished(TaskState),
    /// Still running when the timeout ran out; the task is untouched
    TimedOut(TaskState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed before it reached the hardware
    Cancelled,
    /// Already handed to the hardware; it will still finish normally
    Advisory,
    AlreadyFinished,
}

pub type TaskOutcome = Result<ResultDescriptor, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Uninitialized,
    Ready,
    Lost,
}

/// One entry of [`AcceleratorPipeline::get_available_devices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: &'static str,
    pub cores: u32,
    pub hw_queue_depth: usize,
    pub can_reorder: bool,
    pub status: DeviceStatus,
    /// Zero until first initialised
    pub generation: u32,
    pub window: Option<PhysAddr>,
    pub irq: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub generation: u32,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Submits refused with `QueueFull` or `InputRejected`
    pub refused: u64,
    pub interrupts: u64,
    /// Accepted and not yet consumed
    pub pending: usize,
    pub queued: usize,
    pub in_flight: usize,
}

struct PipelineState {
    handle: Option<AcceleratorHandle>,
    lost: bool,
    generation: u32,
    next_id: u64,
    tasks: BTreeMap<TaskId, AcceleratorTask>,
    fifo: VecDeque<TaskId>,
    /// High-priority tasks, only used when reordering
    urgent: VecDeque<TaskId>,
    in_hw: usize,
    hang_timeout: Duration,
    errors: ErrorLog,
    pool: Option<DmaPool>,
    stats: PipelineStats,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            handle: None,
            lost: false,
            generation: 0,
            next_id: 1,
            tasks: BTreeMap::new(),
            fifo: VecDeque::new(),
            urgent: VecDeque::new(),
            in_hw: 0,
            hang_timeout: Duration::from_millis(DEFAULT_HANG_TIMEOUT_MS),
            errors: ErrorLog::new(ERROR_LOG_CAPACITY),
            pool: None,
            stats: PipelineStats::default(),
        }
    }

    fn enqueue(&mut self, id: TaskId, priority: Priority, front: bool) {
        let reorder = self.handle.is_some_and(|h| h.reorder);
        let queue = if reorder && priority == Priority::High {
            &mut self.urgent
        } else {
            &mut self.fifo
        };
        if front {
            queue.push_front(id);
        } else {
            queue.push_back(id);
        }
    }

    fn next_queued(&mut self) -> Option<TaskId> {
        self.urgent.pop_front().or_else(|| self.fifo.pop_front())
    }

    fn unqueue(&mut self, id: TaskId) {
        self.fifo.retain(|t| *t != id);
        self.urgent.retain(|t| *t != id);
    }

    fn release_slot(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id)
            && task.in_flight
        {
            task.in_flight = false;
            self.in_hw = self.in_hw.saturating_sub(1);
        }
    }

    /// Move a task to a terminal state. Returns false if it already was.
    fn finish(&mut self, id: TaskId, state: TaskState) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if task.transition(state).is_err() {
            return false;
        }
        let discard = task.discard_on_finish;
        self.release_slot(id);
        match state {
            TaskState::Completed => self.stats.completed += 1,
            TaskState::Failed(TaskError::Cancelled) => self.stats.cancelled += 1,
            _ => self.stats.failed += 1,
        }
        if discard {
            self.tasks.remove(&id);
        }
        true
    }

    /// Input must be non-empty, mapped and not shared with an unfinished task.
    fn validate(&self, services: &PlatformServices, input: &InputDescriptor) -> Result<(), RejectReason> {
        if input.region.is_empty() || input.output.is_empty() {
            return Err(RejectReason::EmptyBuffer);
        }
        if input.region.overlaps(&input.output) {
            return Err(RejectReason::SelfOverlap);
        }
        for buf in [input.region, input.output] {
            if !services.is_range_mapped(buf.phys, buf.len) {
                return Err(RejectReason::NotMapped(buf.phys));
            }
        }
        match self
            .tasks
            .values()
            .find(|t| t.owns_buffers() && t.input.shares_memory_with(input))
        {
            Some(owner) => Err(RejectReason::InUse(owner.id)),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            generation: self.generation,
            pending: self.tasks.len(),
            queued: self.fifo.len() + self.urgent.len(),
            in_flight: self.in_hw,
            ..self.stats
        }
    }
}

pub struct AcceleratorPipeline {
    device: &'static dyn AcceleratorDevice,
    services: &'static PlatformServices,
    state: Mutex<PipelineState>,
    dispatch: Mutex<()>,
    init: Mutex<()>,
}

impl AcceleratorPipeline {
    pub fn new(device: &'static dyn AcceleratorDevice, services: &'static PlatformServices) -> Self {
        Self {
            device,
            services,
            state: Mutex::new(PipelineState::new()),
            dispatch: Mutex::new(()),
            init: Mutex::new(()),
        }
    }

    // -- Lifecycle

    /// Bring the device up. Calling it again on a healthy device returns
    /// the existing handle without touching the hardware; after a loss it
    /// resets the device and starts a new generation.
    pub fn init_accelerator(&self, config: AcceleratorConfig) -> Result<AcceleratorHandle, AcceleratorInitError> {
        let _init = self.init.lock();
        {
            let st = self.state.lock();
            if let Some(handle) = st.handle
                && !st.lost
            {
                return Ok(handle);
            }
        }

        let _dispatch = self.dispatch.lock();
        let caps = self.device.probe().map_err(|e| match e {
            DeviceError::NotPresent => AcceleratorInitError::DeviceNotPresent,
            other => AcceleratorInitError::DeviceInitFailed(other),
        })?;
        if let Err(e) = self.device.reset() {
            log::error!("npu: {} reset failed: {}", caps.name, e);
            return Err(AcceleratorInitError::DeviceInitFailed(e));
        }

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.pool.is_none() {
            st.pool = self.build_pool(config.pool_name);
        }

        st.generation += 1;
        st.lost = false;
        st.in_hw = 0;
        st.fifo.clear();
        st.urgent.clear();
        st.hang_timeout = config.hang_timeout;
        st.errors.set_capacity(config.error_log_capacity);

        let handle = AcceleratorHandle {
            generation: st.generation,
            capabilities: caps,
            queue_depth: config.queue_depth.clamp(1, MAX_QUEUE_DEPTH),
            reorder: config.allow_reorder && caps.can_reorder,
            pool: st.pool.as_ref().map(DmaPool::region),
        };
        st.handle = Some(handle);

        log::info!(
            "npu: {} ready, generation {}, {} cores, queue {}/{}",
            caps.name,
            handle.generation,
            caps.cores,
            caps.hw_queue_depth,
            handle.queue_depth
        );
        Ok(handle)
    }

    fn build_pool(&self, name: &str) -> Option<DmaPool> {
        let Some(area) = self.services.descriptor().find_reserved(name) else {
            log::warn!("npu: no '{}' reservation, buffer pool disabled", name);
            return None;
        };
        match self.services.phys_to_virt(area.region.base) {
            Ok(virt) => Some(DmaPool::new(area.region.base, virt, area.region.length)),
            Err(e) => {
                log::warn!("npu: '{}' not mapped ({:?}), buffer pool disabled", name, e);
                None
            }
        }
    }

    pub fn handle(&self) -> Option<AcceleratorHandle> {
        self.state.lock().handle
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }

    // -- Submission and dispatch

    pub fn submit(&self, input: InputDescriptor) -> Result<TaskId, SubmitError> {
        self.submit_with(input, Priority::Normal)
    }

    /// Queue a task. It is handed to the device as soon as a hardware slot
    /// frees up, possibly before this returns.
    pub fn submit_with(&self, input: InputDescriptor, priority: Priority) -> Result<TaskId, SubmitError> {
        let id = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(handle) = st.handle else {
                return Err(SubmitError::NotInitialized);
            };
            if st.lost {
                return Err(SubmitError::DeviceLost);
            }
            if st.tasks.len() >= handle.queue_depth {
                st.stats.refused += 1;
                return Err(SubmitError::QueueFull);
            }
            if let Err(reason) = st.validate(self.services, &input) {
                st.stats.refused += 1;
                log::debug!("npu: submit refused: {:?}", reason);
                return Err(SubmitError::InputRejected(reason));
            }

            let id = TaskId(st.next_id);
            st.next_id += 1;
            let task = AcceleratorTask::new(id, st.generation, input, priority, self.services.now());
            st.tasks.insert(id, task);
            st.enqueue(id, priority, false);
            st.stats.submitted += 1;
            id
        };

        log::trace!("npu: {} queued", id);
        self.pump();
        Ok(id)
    }

    /// Feed queued tasks to the device until it is full or the queue is empty.
    fn pump(&self) {
        let _dispatch = self.dispatch.lock();
        loop {
            let job = {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                let Some(handle) = st.handle else { return };
                if st.lost || st.in_hw >= handle.capabilities.hw_queue_depth {
                    return;
                }
                let Some(id) = st.next_queued() else { return };
                let Some(task) = st.tasks.get_mut(&id) else { continue };
                if task.state() != TaskState::Queued {
                    continue;
                }
                task.in_flight = true;
                let job = DeviceJob {
                    task: id,
                    format: task.input.format,
                    input: task.input.region,
                    output: task.input.output,
                };
                st.in_hw += 1;
                job
            };

            let result = self.device.dispatch(&job);
            let now = self.services.now();

            let mut guard = self.state.lock();
            let st = &mut *guard;
            match result {
                Ok(()) => {
                    if let Some(task) = st.tasks.get_mut(&job.task)
                        && !task.state().is_terminal()
                    {
                        // A fast device may already have reported progress
                        let _ = task.transition(TaskState::Dispatched);
                        task.dispatched_at.get_or_insert(now);
                        log::trace!("npu: {} dispatched", job.task);
                    }
                }
                Err(DeviceError::Busy) => {
                    st.release_slot(job.task);
                    if let Some(task) = st.tasks.get(&job.task)
                        && task.state() == TaskState::Queued
                    {
                        // Never reached the hardware, so a cancel raised
                        // meanwhile still applies
                        if task.cancel_requested {
                            st.finish(job.task, TaskState::Failed(TaskError::Cancelled));
                            log::debug!("npu: {} cancelled", job.task);
                        } else {
                            let priority = task.priority;
                            st.enqueue(job.task, priority, true);
                        }
                    }
                    return;
                }
                Err(DeviceError::Rejected) => {
                    if st.finish(job.task, TaskState::Failed(TaskError::InputRejected)) {
                        let (ts, generation) = (self.services.now_nanos(), st.generation);
                        st.errors.record(ts, generation, Some(job.task), ErrorKind::InputRejected);
                        log::warn!("npu: {} rejected by device", job.task);
                    }
                }
                Err(e) => {
                    log::error!("npu: dispatch of {} failed: {}", job.task, e);
                    self.lose(st, LossReason::DispatchFailed);
                    return;
                }
            }
        }
    }

    /// Collect device events and refill the hardware queue. Runs from the
    /// accelerator interrupt, and from polling loops.
    pub fn service_interrupt(&self) {
        let mut events = Vec::new();
        self.device.drain_events(&mut |e| events.push(e));
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.stats.interrupts += 1;
            for event in events {
                self.apply_event(st, event);
            }
        }
        self.pump();
    }

    fn apply_event(&self, st: &mut PipelineState, event: DeviceEvent) {
        match event {
            DeviceEvent::Started(id) => {
                if let Some(task) = st.tasks.get_mut(&id) {
                    let _ = task.transition(TaskState::Executing);
                }
            }
            DeviceEvent::Completed { task: id, bytes_written } => {
                if let Some(task) = st.tasks.get_mut(&id)
                    && task.state().can_advance_to(TaskState::Completed)
                {
                    task.result = Some(ResultDescriptor {
                        output: task.input.output,
                        bytes_written: bytes_written.min(task.input.output.len),
                    });
                    if task.cancel_requested {
                        log::debug!("npu: {} completed despite cancel", id);
                    }
                }
                if !st.finish(id, TaskState::Completed) {
                    log::debug!("npu: stale completion for {}", id);
                }
            }
            DeviceEvent::Fault { task: id, code } => {
                if st.finish(id, TaskState::Failed(TaskError::DeviceFault(code))) {
                    let (ts, generation) = (self.services.now_nanos(), st.generation);
                    st.errors.record(ts, generation, Some(id), ErrorKind::DeviceFault(code));
                    log::warn!("npu: {} faulted, code {:#x}", id, code);
                }
            }
            DeviceEvent::Rejected(id) => {
                if st.finish(id, TaskState::Failed(TaskError::InputRejected)) {
                    let (ts, generation) = (self.services.now_nanos(), st.generation);
                    st.errors.record(ts, generation, Some(id), ErrorKind::InputRejected);
                    log::warn!("npu: {} input rejected", id);
                }
            }
            DeviceEvent::Lost => self.lose(st, LossReason::Reported),
        }
    }

    /// Fail every unfinished task of the current generation and refuse
    /// work until re-initialised.
    fn lose(&self, st: &mut PipelineState, reason: LossReason) {
        if st.lost || st.handle.is_none() {
            return;
        }
        st.lost = true;
        let victims: Vec<TaskId> = st
            .tasks
            .values()
            .filter(|t| !t.state().is_terminal() && t.generation == st.generation)
            .map(|t| t.id)
            .collect();
        for id in &victims {
            st.finish(*id, TaskState::Failed(TaskError::DeviceLost));
        }
        st.fifo.clear();
        st.urgent.clear();
        st.in_hw = 0;

        let (ts, generation) = (self.services.now_nanos(), st.generation);
        st.errors.record(ts, generation, None, ErrorKind::DeviceLost(reason));
        log::error!(
            "npu: device lost ({}), generation {}, {} tasks failed",
            reason,
            generation,
            victims.len()
        );
    }

    /// Declare the device lost from outside, e.g. a bus error handler.
    pub fn mark_lost(&self) {
        let mut guard = self.state.lock();
        self.lose(&mut guard, LossReason::Reported);
    }

    /// Check the heartbeat and look for hung tasks. Returns whether the
    /// device is initialised and healthy.
    pub fn check_health(&self) -> bool {
        let alive = self.device.heartbeat();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.handle.is_none() || st.lost {
            return false;
        }
        if !alive {
            self.lose(st, LossReason::Heartbeat);
            return false;
        }

        let now = self.services.now();
        let limit = self.services.clock().duration_to_ticks(st.hang_timeout);
        let hung = st
            .tasks
            .values()
            .filter(|t| !t.state().is_terminal())
            .find(|t| t.dispatched_at.is_some_and(|at| now.ticks_since(at) > limit))
            .map(|t| t.id);
        if let Some(id) = hung {
            self.lose(st, LossReason::Hang(id));
            return false;
        }
        true
    }

    // -- Observation

    pub fn poll(&self, id: TaskId) -> Result<TaskState, PipelineError> {
        self.state
            .lock()
            .tasks
            .get(&id)
            .map(AcceleratorTask::state)
            .ok_or(PipelineError::UnknownTask(id))
    }

    /// Wait for a task to reach a terminal state.
    ///
    /// A zero timeout is a plain poll. Timing out leaves the task as it was.
    pub fn await_completion(&self, id: TaskId, timeout: Duration) -> Result<AwaitOutcome, PipelineError> {
        let state = self.poll(id)?;
        if state.is_terminal() {
            return Ok(AwaitOutcome::Finished(state));
        }
        if timeout.is_zero() {
            return Ok(AwaitOutcome::TimedOut(state));
        }

        let deadline = self.services.deadline_after(timeout);
        loop {
            self.service_interrupt();
            self.check_health();
            let state = self.poll(id)?;
            if state.is_terminal() {
                return Ok(AwaitOutcome::Finished(state));
            }
            if self.services.now() >= deadline {
                return Ok(AwaitOutcome::TimedOut(state));
            }
            self.services.relax();
        }
    }

    /// Cancel a task. Only tasks still waiting for the hardware are
    /// actually removed; once dispatched the request is advisory.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, PipelineError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let task = st.tasks.get_mut(&id).ok_or(PipelineError::UnknownTask(id))?;
        let state = task.state();
        if state.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        if state == TaskState::Queued && !task.in_flight {
            st.unqueue(id);
            st.finish(id, TaskState::Failed(TaskError::Cancelled));
            log::debug!("npu: {} cancelled", id);
            return Ok(CancelOutcome::Cancelled);
        }
        task.cancel_requested = true;
        Ok(CancelOutcome::Advisory)
    }

    /// Consume a finished task and free its queue slot.
    pub fn take_result(&self, id: TaskId) -> Result<TaskOutcome, PipelineError> {
        let mut st = self.state.lock();
        let task = st.tasks.get(&id).ok_or(PipelineError::UnknownTask(id))?;
        let outcome = match task.state() {
            TaskState::Completed => Ok(task.result.unwrap_or(ResultDescriptor {
                output: task.input.output,
                bytes_written: 0,
            })),
            TaskState::Failed(e) => Err(e),
            _ => return Err(PipelineError::NotFinished(id)),
        };
        st.tasks.remove(&id);
        Ok(outcome)
    }

    /// Drop a task without looking at its result. Unfinished tasks are
    /// cancelled if possible, otherwise dropped as soon as they finish.
    pub fn discard(&self, id: TaskId) -> Result<(), PipelineError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let task = st.tasks.get_mut(&id).ok_or(PipelineError::UnknownTask(id))?;
        let state = task.state();
        if state.is_terminal() {
            st.tasks.remove(&id);
            return Ok(());
        }
        task.discard_on_finish = true;
        if state == TaskState::Queued && !task.in_flight {
            st.unqueue(id);
            st.finish(id, TaskState::Failed(TaskError::Cancelled));
        } else {
            task.cancel_requested = true;
        }
        Ok(())
    }

    // -- Diagnostics

    /// Devices the pipeline can drive. Before initialisation the device
    /// is probed (which has no side effects) to see whether it exists.
    pub fn get_available_devices(&self) -> Vec<DeviceInfo> {
        let known = {
            let st = self.state.lock();
            st.handle.map(|h| {
                let status = if st.lost { DeviceStatus::Lost } else { DeviceStatus::Ready };
                (h.capabilities, status, h.generation)
            })
        };
        let (caps, status, generation) = match known {
            Some(k) => k,
            None => match self.device.probe() {
                Ok(caps) => (caps, DeviceStatus::Uninitialized, 0),
                Err(_) => return Vec::new(),
            },
        };

        let window = self.services.descriptor().accelerator();
        alloc::vec![DeviceInfo {
            name: caps.name,
            cores: caps.cores,
            hw_queue_depth: caps.hw_queue_depth,
            can_reorder: caps.can_reorder,
            status,
            generation,
            window: window.map(|w| w.base),
            irq: window.and_then(|w| w.irqs.first().copied()),
        }]
    }

    /// Oldest first
    pub fn get_error_logs(&self) -> Vec<ErrorLogEntry> {
        self.state.lock().errors.snapshot()
    }

    pub fn clear_error_logs(&self) {
        self.state.lock().errors.clear();
    }

    pub fn stats(&self) -> PipelineStats {
        self.state.lock().snapshot()
    }

    // -- Buffers

    pub fn alloc_buffer(&self, len: u64) -> Result<DmaBuffer, DmaError> {
        self.state.lock().pool.as_mut().ok_or(DmaError::NoPool)?.alloc(len)
    }

    /// Return a buffer to the pool. Refused while an unfinished task uses it.
    pub fn free_buffer(&self, region: BufferRegion) -> Result<(), DmaError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st
            .tasks
            .values()
            .any(|t| t.owns_buffers() && (t.input.region.overlaps(&region) || t.input.output.overlaps(&region)))
        {
            return Err(DmaError::InUse);
        }
        st.pool.as_mut().ok_or(DmaError::NoPool)?.free(region.phys)
    }

    // -- Interrupt wiring

    /// Route the accelerator's interrupt to [`service_interrupt`](Self::service_interrupt).
    /// Returns the line used, or `None` if the descriptor names none.
    pub fn attach_interrupt(&'static self) -> Result<Option<u32>, IrqError> {
        let Some(irq) = self
            .services
            .descriptor()
            .accelerator()
            .and_then(|w| w.irqs.first().copied())
        else {
            log::warn!("npu: no interrupt in descriptor, completions need polling");
            return Ok(None);
        };
        self.services
            .register_irq(irq, service_trampoline, self as *const Self as usize)?;
        log::debug!("npu: irq {} attached", irq);
        Ok(Some(irq))
    }
}

fn service_trampoline(_irq: u32, context: usize) {
    // SAFETY: `context` was made from a `&'static AcceleratorPipeline` in
    // `attach_interrupt`.
    let pipeline = unsafe { &*(context as *const AcceleratorPipeline) };
    pipeline.service_interrupt();
}

impl fmt::Debug for AcceleratorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("AcceleratorPipeline")
            .field("handle", &st.handle)
            .field("lost", &st.lost)
            .field("pending", &st.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MOCK_CAPS, MockAccelerator, MockCounter};
    use std::thread;

    fn pipeline_with(caps: Capabilities) -> (&'static AcceleratorPipeline, &'static MockAccelerator) {
        let device = testing::leak(MockAccelerator::new(caps));
        let pipeline = testing::leak(AcceleratorPipeline::new(device, testing::services()));
        (pipeline, device)
    }

    fn ready() -> (&'static AcceleratorPipeline, &'static MockAccelerator) {
        let (p, d) = pipeline_with(MOCK_CAPS);
        p.init_accelerator(AcceleratorConfig::default()).unwrap();
        (p, d)
    }

    fn ready_with_counter() -> (&'static AcceleratorPipeline, &'static MockAccelerator, &'static MockCounter) {
        let (services, counter) = testing::services_with_counter();
        let device = testing::leak(MockAccelerator::new(MOCK_CAPS));
        let pipeline = testing::leak(AcceleratorPipeline::new(device, services));
        let config = AcceleratorConfig {
            hang_timeout: Duration::from_millis(1),
            ..AcceleratorConfig::default()
        };
        pipeline.init_accelerator(config).unwrap();
        (pipeline, device, counter)
    }

    /// Distinct 4KB input/output pair in RAM
    fn input(n: u64) -> InputDescriptor {
        let base = 0x1000_0000 + n * 0x2000;
        InputDescriptor::new(
            BufferRegion::new(PhysAddr::new(base), 0x1000),
            1,
            BufferRegion::new(PhysAddr::new(base + 0x1000), 0x1000),
        )
    }

    fn submit_n(p: &AcceleratorPipeline, n: u64) -> Vec<TaskId> {
        (0..n).map(|i| p.submit(input(i)).unwrap()).collect()
    }

    #[test]
    fn test_init_is_idempotent() {
        let (p, dev) = pipeline_with(MOCK_CAPS);
        let first = p.init_accelerator(AcceleratorConfig::default()).unwrap();
        let second = p.init_accelerator(AcceleratorConfig::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.generation, 1);
        assert_eq!(dev.probes(), 1);
        assert_eq!(dev.resets(), 1);
        assert!(first.pool.is_some());
        assert!(!first.reorder);
    }

    #[test]
    fn test_init_failures() {
        let absent = testing::leak(MockAccelerator::absent());
        let p = AcceleratorPipeline::new(absent, testing::services());
        assert_eq!(
            p.init_accelerator(AcceleratorConfig::default()),
            Err(AcceleratorInitError::DeviceNotPresent)
        );

        let (p, dev) = pipeline_with(MOCK_CAPS);
        dev.set_reset_fails(true);
        assert_eq!(
            p.init_accelerator(AcceleratorConfig::default()),
            Err(AcceleratorInitError::DeviceInitFailed(DeviceError::InitFailed(0xE1)))
        );
        assert!(p.handle().is_none());
        assert_eq!(p.submit(input(0)), Err(SubmitError::NotInitialized));

        dev.set_reset_fails(false);
        assert_eq!(p.init_accelerator(AcceleratorConfig::default()).unwrap().generation, 1);
    }

    #[test]
    fn test_submit_before_init() {
        let (p, dev) = pipeline_with(MOCK_CAPS);
        assert_eq!(p.submit(input(0)), Err(SubmitError::NotInitialized));
        assert!(dev.dispatched().is_empty());
    }

    #[test]
    fn test_queue_full_then_space_after_consume() {
        let (p, dev) = ready();
        let ids = submit_n(p, 8);
        assert_eq!(p.submit(input(8)), Err(SubmitError::QueueFull));

        // The refusal left every accepted task alone
        assert_eq!(p.poll(ids[0]), Ok(TaskState::Dispatched));
        assert_eq!(p.poll(ids[1]), Ok(TaskState::Dispatched));
        for id in &ids[2..] {
            assert_eq!(p.poll(*id), Ok(TaskState::Queued));
        }
        assert_eq!(p.stats().pending, 8);

        dev.complete(ids[0], 16);
        p.service_interrupt();
        assert_eq!(p.poll(ids[0]), Ok(TaskState::Completed));
        // Finished but not consumed still counts
        assert_eq!(p.submit(input(8)), Err(SubmitError::QueueFull));

        let result = p.take_result(ids[0]).unwrap().unwrap();
        assert_eq!(result.bytes_written, 16);
        assert_eq!(result.output, input(0).output);

        let tenth = p.submit(input(9)).unwrap();
        assert_eq!(p.poll(tenth), Ok(TaskState::Queued));
        assert_eq!(p.stats().refused, 2);
    }

    #[test]
    fn test_zero_timeout_leaves_queued_task() {
        let (p, dev) = ready();
        let ids = submit_n(p, 3);
        assert_eq!(
            p.await_completion(ids[2], Duration::ZERO),
            Ok(AwaitOutcome::TimedOut(TaskState::Queued))
        );
        assert_eq!(p.poll(ids[2]), Ok(TaskState::Queued));
        assert_eq!(dev.dispatched(), &ids[..2]);
    }

    #[test]
    fn test_await_completion() {
        let (p, dev) = ready();
        let ids = submit_n(p, 2);

        dev.start(ids[0]);
        dev.complete(ids[0], 8);
        assert_eq!(
            p.await_completion(ids[0], Duration::from_millis(1)),
            Ok(AwaitOutcome::Finished(TaskState::Completed))
        );
        // Already finished: returns at once even with a zero timeout
        assert_eq!(
            p.await_completion(ids[0], Duration::ZERO),
            Ok(AwaitOutcome::Finished(TaskState::Completed))
        );

        assert_eq!(
            p.await_completion(ids[1], Duration::from_micros(100)),
            Ok(AwaitOutcome::TimedOut(TaskState::Dispatched))
        );
        assert_eq!(
            p.await_completion(TaskId(999), Duration::ZERO),
            Err(PipelineError::UnknownTask(TaskId(999)))
        );
    }

    #[test]
    fn test_dispatch_is_fifo() {
        let (p, dev) = ready();
        let mut ids = submit_n(p, 2);
        // Priority is ignored when the device cannot reorder
        ids.push(p.submit_with(input(2), Priority::High).unwrap());
        ids.push(p.submit(input(3)).unwrap());
        ids.push(p.submit(input(4)).unwrap());

        for id in &ids {
            dev.complete(*id, 1);
            p.service_interrupt();
        }
        assert_eq!(dev.dispatched(), ids);
        assert!(ids.iter().all(|id| p.poll(*id) == Ok(TaskState::Completed)));
    }

    #[test]
    fn test_high_priority_overtakes_when_reordering() {
        let caps = Capabilities {
            hw_queue_depth: 1,
            can_reorder: true,
            ..MOCK_CAPS
        };
        let (p, dev) = pipeline_with(caps);
        let config = AcceleratorConfig {
            allow_reorder: true,
            ..AcceleratorConfig::default()
        };
        assert!(p.init_accelerator(config).unwrap().reorder);

        let a = p.submit(input(0)).unwrap();
        let b = p.submit(input(1)).unwrap();
        let c = p.submit_with(input(2), Priority::High).unwrap();
        dev.complete(a, 1);
        p.service_interrupt();
        dev.complete(c, 1);
        p.service_interrupt();
        assert_eq!(dev.dispatched(), [a, c, b]);
    }

    #[test]
    fn test_fault_fails_only_that_task() {
        let (p, dev) = ready();
        let ids = submit_n(p, 3);
        dev.start(ids[1]);
        dev.fault(ids[1], 7);
        p.service_interrupt();

        assert_eq!(p.poll(ids[1]), Ok(TaskState::Failed(TaskError::DeviceFault(7))));
        assert_eq!(p.poll(ids[0]), Ok(TaskState::Dispatched));
        assert_eq!(p.poll(ids[2]), Ok(TaskState::Dispatched));
        assert!(p.check_health());
        assert!(p.submit(input(5)).is_ok());

        let logs = p.get_error_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].task, Some(ids[1]));
        assert_eq!(logs[0].kind, ErrorKind::DeviceFault(7));
        assert_eq!(p.take_result(ids[1]), Ok(Err(TaskError::DeviceFault(7))));
    }

    #[test]
    fn test_device_loss_fails_generation() {
        let (p, dev) = ready();
        let ids = submit_n(p, 4);
        dev.complete(ids[0], 4);
        p.service_interrupt();

        dev.lose();
        p.service_interrupt();
        assert_eq!(p.poll(ids[0]), Ok(TaskState::Completed));
        for id in &ids[1..] {
            assert_eq!(p.poll(*id), Ok(TaskState::Failed(TaskError::DeviceLost)));
        }
        assert_eq!(p.submit(input(9)), Err(SubmitError::DeviceLost));
        assert!(p.is_lost());
        assert_eq!(
            p.get_error_logs().last().map(|e| e.kind),
            Some(ErrorKind::DeviceLost(LossReason::Reported))
        );

        let handle = p.init_accelerator(AcceleratorConfig::default()).unwrap();
        assert_eq!(handle.generation, 2);
        assert_eq!(dev.resets(), 2);
        // Old failures stay until consumed; their buffers are free again
        let fresh = p.submit(input(1)).unwrap();
        assert_eq!(p.poll(fresh), Ok(TaskState::Dispatched));
        assert_eq!(p.take_result(ids[2]), Ok(Err(TaskError::DeviceLost)));
    }

    #[test]
    fn test_heartbeat_loss() {
        let (p, dev) = ready();
        let id = p.submit(input(0)).unwrap();
        dev.hang();
        assert!(!p.check_health());
        assert_eq!(p.poll(id), Ok(TaskState::Failed(TaskError::DeviceLost)));
        assert_eq!(
            p.get_error_logs()[0].kind,
            ErrorKind::DeviceLost(LossReason::Heartbeat)
        );
    }

    #[test]
    fn test_hung_task_marks_device_lost() {
        let (p, _dev, counter) = ready_with_counter();
        let id = p.submit(input(0)).unwrap();
        assert!(p.check_health());
        counter.advance(1_000_000);
        assert!(!p.check_health());
        assert_eq!(p.poll(id), Ok(TaskState::Failed(TaskError::DeviceLost)));
        assert_eq!(
            p.get_error_logs()[0].kind,
            ErrorKind::DeviceLost(LossReason::Hang(id))
        );
    }

    #[test]
    fn test_cancel() {
        let (p, dev) = ready();
        let ids = submit_n(p, 3);

        assert_eq!(p.cancel(ids[2]), Ok(CancelOutcome::Cancelled));
        assert_eq!(p.poll(ids[2]), Ok(TaskState::Failed(TaskError::Cancelled)));

        assert_eq!(p.cancel(ids[0]), Ok(CancelOutcome::Advisory));
        dev.complete(ids[0], 2);
        dev.complete(ids[1], 2);
        p.service_interrupt();
        assert_eq!(p.poll(ids[0]), Ok(TaskState::Completed));
        assert_eq!(p.cancel(ids[0]), Ok(CancelOutcome::AlreadyFinished));
        assert_eq!(p.cancel(TaskId(999)), Err(PipelineError::UnknownTask(TaskId(999))));

        // The cancelled task never reached the device
        assert_eq!(dev.dispatched(), &ids[..2]);
        assert_eq!(p.stats().cancelled, 1);
    }

    #[test]
    fn test_input_validation() {
        let (p, dev) = ready();
        let a = p.submit(input(0)).unwrap();
        assert_eq!(
            p.submit(input(0)),
            Err(SubmitError::InputRejected(RejectReason::InUse(a)))
        );

        let unmapped = InputDescriptor::new(
            BufferRegion::new(PhysAddr::new(0x8000_0000_0000), 0x100),
            0,
            input(3).output,
        );
        assert_eq!(
            p.submit(unmapped),
            Err(SubmitError::InputRejected(RejectReason::NotMapped(PhysAddr::new(0x8000_0000_0000))))
        );

        let mut empty = input(4);
        empty.output.len = 0;
        assert_eq!(p.submit(empty), Err(SubmitError::InputRejected(RejectReason::EmptyBuffer)));

        let mut tangled = input(5);
        tangled.output = tangled.region;
        assert_eq!(p.submit(tangled), Err(SubmitError::InputRejected(RejectReason::SelfOverlap)));

        // Reuse is fine once the owner has finished
        dev.complete(a, 1);
        p.service_interrupt();
        assert!(p.submit(input(0)).is_ok());
    }

    #[test]
    fn test_device_rejects_job() {
        let (p, dev) = ready();
        dev.reject_next_dispatch();
        let id = p.submit(input(0)).unwrap();
        assert_eq!(p.poll(id), Ok(TaskState::Failed(TaskError::InputRejected)));
        assert_eq!(p.get_error_logs()[0].kind, ErrorKind::InputRejected);
        // Slot was returned
        let next = p.submit(input(1)).unwrap();
        assert_eq!(p.poll(next), Ok(TaskState::Dispatched));
    }

    #[test]
    fn test_busy_requeues_at_front() {
        let (p, dev) = ready();
        dev.busy_next_dispatch();
        let a = p.submit(input(0)).unwrap();
        assert_eq!(p.poll(a), Ok(TaskState::Queued));
        assert!(dev.dispatched().is_empty());

        let b = p.submit(input(1)).unwrap();
        assert_eq!(dev.dispatched(), [a, b]);
    }

    #[test]
    fn test_cancel_while_dispatch_answers_busy() {
        let (p, dev) = ready();
        dev.busy_next_dispatch();
        dev.during_next_dispatch(move |id| {
            assert_eq!(p.cancel(id), Ok(CancelOutcome::Advisory));
        });
        let a = p.submit(input(0)).unwrap();
        assert_eq!(p.poll(a), Ok(TaskState::Failed(TaskError::Cancelled)));
        assert_eq!(p.stats().cancelled, 1);

        // The cancelled task is not retried on the next pump
        let b = p.submit(input(1)).unwrap();
        assert_eq!(dev.dispatched(), [b]);
        assert_eq!(p.stats().in_flight, 1);
    }

    #[test]
    fn test_discard_while_dispatch_answers_busy() {
        let (p, dev) = ready();
        dev.busy_next_dispatch();
        dev.during_next_dispatch(move |id| p.discard(id).unwrap());
        let a = p.submit(input(0)).unwrap();
        assert_eq!(p.poll(a), Err(PipelineError::UnknownTask(a)));

        let b = p.submit(input(1)).unwrap();
        assert_eq!(dev.dispatched(), [b]);
    }

    #[test]
    fn test_available_devices() {
        let (p, dev) = pipeline_with(MOCK_CAPS);
        let before = p.get_available_devices();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].status, DeviceStatus::Uninitialized);
        assert_eq!(before[0].irq, Some(142));
        assert_eq!(before[0].window, Some(PhysAddr::new(0x4020_0000)));

        p.init_accelerator(AcceleratorConfig::default()).unwrap();
        assert_eq!(p.get_available_devices()[0].status, DeviceStatus::Ready);
        dev.hang();
        p.check_health();
        let lost = p.get_available_devices();
        assert_eq!(lost[0].status, DeviceStatus::Lost);
        assert_eq!(lost[0].generation, 1);

        let absent = testing::leak(MockAccelerator::absent());
        assert!(AcceleratorPipeline::new(absent, testing::services()).get_available_devices().is_empty());
    }

    #[test]
    fn test_clear_error_logs() {
        let (p, dev) = ready();
        let id = p.submit(input(0)).unwrap();
        dev.reject(id);
        p.service_interrupt();
        assert_eq!(p.get_error_logs().len(), 1);
        p.clear_error_logs();
        assert!(p.get_error_logs().is_empty());
    }

    #[test]
    fn test_buffers_from_pool() {
        let (p, dev) = pipeline_with(MOCK_CAPS);
        assert_eq!(p.alloc_buffer(64), Err(DmaError::NoPool));
        p.init_accelerator(AcceleratorConfig::default()).unwrap();

        let inp = p.alloc_buffer(0x1000).unwrap();
        let out = p.alloc_buffer(0x1000).unwrap();
        assert_eq!(inp.phys, PhysAddr::new(0x3F00_0000));
        assert_eq!(testing::services().phys_to_virt(out.phys), Ok(out.virt));

        let id = p.submit(InputDescriptor::new(inp.region(), 2, out.region())).unwrap();
        assert_eq!(p.free_buffer(inp.region()), Err(DmaError::InUse));
        dev.complete(id, 0x800);
        p.service_interrupt();
        p.take_result(id).unwrap().unwrap();
        p.free_buffer(inp.region()).unwrap();
        p.free_buffer(out.region()).unwrap();
    }

    #[test]
    fn test_interrupt_drives_completion() {
        let services = testing::services();
        let dev = testing::leak(MockAccelerator::new(MOCK_CAPS));
        let p = testing::leak(AcceleratorPipeline::new(dev, services));
        p.init_accelerator(AcceleratorConfig::default()).unwrap();
        assert_eq!(p.attach_interrupt(), Ok(Some(142)));
        assert_eq!(p.attach_interrupt(), Err(IrqError::AlreadyRegistered(142)));

        let id = p.submit(input(0)).unwrap();
        dev.complete(id, 1);
        assert!(services.dispatch_irq(142));
        assert_eq!(p.poll(id), Ok(TaskState::Completed));
        assert_eq!(p.stats().interrupts, 1);
    }

    #[test]
    fn test_discard() {
        let (p, dev) = ready();
        let ids = submit_n(p, 3);
        p.discard(ids[0]).unwrap();
        p.discard(ids[2]).unwrap();
        assert_eq!(p.poll(ids[2]), Err(PipelineError::UnknownTask(ids[2])));
        assert_eq!(p.poll(ids[0]), Ok(TaskState::Dispatched));

        dev.complete(ids[0], 1);
        p.service_interrupt();
        assert_eq!(p.poll(ids[0]), Err(PipelineError::UnknownTask(ids[0])));
        assert_eq!(p.stats().pending, 1);
        assert_eq!(p.take_result(ids[1]), Err(PipelineError::NotFinished(ids[1])));
    }

    #[test]
    fn test_concurrent_submitters() {
        let (p, _dev) = ready();
        let handles: Vec<_> = (0..4u64)
            .map(|t| thread::spawn(move || (0..2).map(|i| p.submit(input(t * 2 + i)).unwrap()).collect::<Vec<_>>()))
            .collect();
        let mut ids: Vec<TaskId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(p.submit(input(20)), Err(SubmitError::QueueFull));
        assert_eq!(p.stats().in_flight, 2);
    }
}
