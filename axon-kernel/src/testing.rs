//! Host-side stand-ins for the hardware traits, shared by the unit tests.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use axon_common::{KernelImage, PhysAddr, VirtAddr};
use axon_paging::{LayoutPolicy, compute_mappings};
use axon_pal::descriptor::builder::reference_device_tree;
use axon_pal::psci::AffinityState;
use axon_pal::{ConsoleDevice, CounterHardware, CpuFirmware, PowerControl, PsciError};
use spin::Mutex;

use crate::npu::{AcceleratorDevice, Capabilities, DeviceError, DeviceEvent, DeviceJob, TaskId};
use crate::services::{PlatformHardware, PlatformServices, ServiceError};

/// 62.5 MHz, the QEMU virt counter: 16ns per tick, exact in 32.32
pub const TEST_FREQUENCY: u64 = 62_500_000;

/// Ticks the mock counter advances on every read
pub const TICKS_PER_READ: u64 = 1_000;

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

// -- Console

#[derive(Default)]
pub struct MockConsole {
    out: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
}

impl MockConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.out.lock()).into_owned()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }
}

impl ConsoleDevice for MockConsole {
    fn write_byte(&self, byte: u8) {
        self.out.lock().push(byte);
    }

    fn read_byte(&self) -> Option<u8> {
        self.input.lock().pop_front()
    }
}

// -- Counter

/// A counter that moves forward on every read so polling loops terminate
pub struct MockCounter {
    frequency: u64,
    now: AtomicU64,
    deadline: Mutex<Option<u64>>,
}

impl MockCounter {
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency,
            now: AtomicU64::new(1_000_000),
            deadline: Mutex::new(None),
        }
    }

    /// Current value without advancing
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Comparator value, `None` when disarmed
    pub fn deadline(&self) -> Option<u64> {
        *self.deadline.lock()
    }
}

impl CounterHardware for MockCounter {
    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn counter(&self) -> u64 {
        self.now.fetch_add(TICKS_PER_READ, Ordering::SeqCst)
    }

    fn set_deadline(&self, ticks: u64) {
        *self.deadline.lock() = Some(ticks);
    }

    fn cancel_deadline(&self) {
        *self.deadline.lock() = None;
    }
}

// -- Firmware

/// Power control that records requests and refuses them
#[derive(Default)]
pub struct MockPower {
    off: AtomicUsize,
}

impl MockPower {
    pub fn off_requests(&self) -> usize {
        self.off.load(Ordering::SeqCst)
    }
}

impl PowerControl for MockPower {
    fn system_off(&self) -> Result<(), PsciError> {
        self.off.fetch_add(1, Ordering::SeqCst);
        Err(PsciError::Denied)
    }

    fn system_reset(&self) -> Result<(), PsciError> {
        Err(PsciError::Denied)
    }
}

/// `CPU_ON` recorder with per-core scripted failures
#[derive(Default)]
pub struct MockCpuFirmware {
    calls: Mutex<Vec<(u64, PhysAddr, u64)>>,
    failures: Mutex<BTreeMap<u64, PsciError>>,
}

impl MockCpuFirmware {
    pub fn fail(&self, mpidr: u64, error: PsciError) {
        self.failures.lock().insert(mpidr, error);
    }

    pub fn calls(&self) -> Vec<(u64, PhysAddr, u64)> {
        self.calls.lock().clone()
    }
}

impl CpuFirmware for MockCpuFirmware {
    fn cpu_on(&self, mpidr: u64, entry: PhysAddr, context: u64) -> Result<(), PsciError> {
        self.calls.lock().push((mpidr, entry, context));
        match self.failures.lock().get(&mpidr) {
            Some(&e) => Err(e),
            None => Ok(()),
        }
    }

    fn affinity_info(&self, mpidr: u64) -> Result<AffinityState, PsciError> {
        let started = self.calls.lock().iter().any(|c| c.0 == mpidr);
        Ok(if started { AffinityState::On } else { AffinityState::Off })
    }
}

// -- Accelerator

pub const MOCK_CAPS: Capabilities = Capabilities {
    name: "mock-npu",
    cores: 3,
    hw_queue_depth: 2,
    can_reorder: false,
};

#[derive(Default)]
struct MockNpuState {
    dispatched: Vec<DeviceJob>,
    in_hw: Vec<TaskId>,
    events: VecDeque<DeviceEvent>,
    reject_next: bool,
    busy_next: bool,
}

type DispatchHook = Box<dyn FnOnce(TaskId) + Send>;

/// Scriptable accelerator: tests decide when jobs start, finish or fail
pub struct MockAccelerator {
    caps: Option<Capabilities>,
    reset_fails: AtomicBool,
    alive: AtomicBool,
    probes: AtomicUsize,
    resets: AtomicUsize,
    state: Mutex<MockNpuState>,
    hook: Mutex<Option<DispatchHook>>,
}

impl MockAccelerator {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps: Some(caps),
            reset_fails: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            state: Mutex::new(MockNpuState::default()),
            hook: Mutex::new(None),
        }
    }

    pub fn absent() -> Self {
        Self {
            caps: None,
            ..Self::new(MOCK_CAPS)
        }
    }

    pub fn set_reset_fails(&self, fails: bool) {
        self.reset_fails.store(fails, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Every job ever accepted, in dispatch order
    pub fn dispatched(&self) -> Vec<TaskId> {
        self.state.lock().dispatched.iter().map(|j| j.task).collect()
    }

    pub fn reject_next_dispatch(&self) {
        self.state.lock().reject_next = true;
    }

    /// Report `Busy` once regardless of queue occupancy
    pub fn busy_next_dispatch(&self) {
        self.state.lock().busy_next = true;
    }

    /// Run `hook` inside the next dispatch, before the device answers
    pub fn during_next_dispatch(&self, hook: impl FnOnce(TaskId) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn start(&self, task: TaskId) {
        self.state.lock().events.push_back(DeviceEvent::Started(task));
    }

    pub fn complete(&self, task: TaskId, bytes_written: u64) {
        let mut s = self.state.lock();
        s.in_hw.retain(|t| *t != task);
        s.events.push_back(DeviceEvent::Completed { task, bytes_written });
    }

    pub fn fault(&self, task: TaskId, code: u32) {
        let mut s = self.state.lock();
        s.in_hw.retain(|t| *t != task);
        s.events.push_back(DeviceEvent::Fault { task, code });
    }

    pub fn reject(&self, task: TaskId) {
        let mut s = self.state.lock();
        s.in_hw.retain(|t| *t != task);
        s.events.push_back(DeviceEvent::Rejected(task));
    }

    /// Report loss through an event
    pub fn lose(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.lock().events.push_back(DeviceEvent::Lost);
    }

    /// Stop answering heartbeats without saying so
    pub fn hang(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl AcceleratorDevice for MockAccelerator {
    fn probe(&self) -> Result<Capabilities, DeviceError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.caps.ok_or(DeviceError::NotPresent)
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.reset_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::InitFailed(0xE1));
        }
        let mut s = self.state.lock();
        s.in_hw.clear();
        s.events.clear();
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn dispatch(&self, job: &DeviceJob) -> Result<(), DeviceError> {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook(job.task);
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DeviceError::Lost);
        }
        let depth = self.caps.map_or(0, |c| c.hw_queue_depth);
        let mut s = self.state.lock();
        if core::mem::take(&mut s.reject_next) {
            return Err(DeviceError::Rejected);
        }
        if core::mem::take(&mut s.busy_next) || s.in_hw.len() >= depth {
            return Err(DeviceError::Busy);
        }
        s.in_hw.push(job.task);
        s.dispatched.push(*job);
        Ok(())
    }

    fn drain_events(&self, sink: &mut dyn FnMut(DeviceEvent)) {
        let events: Vec<DeviceEvent> = self.state.lock().events.drain(..).collect();
        for e in events {
            sink(e);
        }
    }

    fn heartbeat(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// -- Platform services over the reference board

/// Kernel loaded at 512KB, linked at the bottom of the kernel window
pub fn reference_image() -> KernelImage {
    KernelImage::new(
        PhysAddr::new(0x8_0000),
        VirtAddr::new(0xFFFF_FFFF_8008_0000),
        0x20_0000,
    )
}

pub fn try_services_with(counter: &'static MockCounter) -> Result<PlatformServices, ServiceError> {
    let hw = PlatformHardware {
        console: leak(MockConsole::new()),
        counter,
        power: leak(MockPower::default()),
    };
    build(hw)
}

fn build(hw: PlatformHardware) -> Result<PlatformServices, ServiceError> {
    let descriptor = axon_pal::resolve(&reference_device_tree()).expect("reference tree resolves");
    let mappings = compute_mappings(descriptor.regions(), &reference_image(), &LayoutPolicy::default())
        .expect("reference board partitions");
    PlatformServices::new(descriptor, mappings, hw)
}

pub fn services() -> &'static PlatformServices {
    services_with_counter().0
}

pub fn services_with_counter() -> (&'static PlatformServices, &'static MockCounter) {
    let counter = leak(MockCounter::new(TEST_FREQUENCY));
    let services = leak(try_services_with(counter).expect("services build"));
    (services, counter)
}

pub fn services_with_console() -> (&'static PlatformServices, &'static MockConsole, &'static MockPower) {
    let console = leak(MockConsole::new());
    let power = leak(MockPower::default());
    let hw = PlatformHardware {
        console,
        counter: leak(MockCounter::new(TEST_FREQUENCY)),
        power,
    };
    (leak(build(hw).expect("services build")), console, power)
}
