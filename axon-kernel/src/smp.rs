//! Multi-Core Bring-up
//!
//! Sequences the primary core's early and late initialisation and the
//! activation of every secondary core.
//!
//! Each core moves through `Unstarted -> EarlyInit -> LateInit -> Running`.
//! Phase writes are forward-only compare-and-swaps, so no observer ever
//! sees a core go backwards. A secondary that does not reach Running within
//! the retry budget is marked `Failed` and excluded from
//! [`online_cores`](BringupCoordinator::online_cores); only a system with
//! no Running core at all is fatal.
//!
//! Ordering: the primary publishes the memory layout before it reaches
//! LateInit, and secondaries are only launched from LateInit. A secondary
//! that somehow starts early finds nothing published and parks itself.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;

use axon_common::{CoreId, InitialStack, MAX_CPUS, PhysAddr, VirtAddr};
use axon_paging::{MappingClass, MappingTable};
use axon_pal::descriptor::{CoreInfo, EnableMethod};
use axon_pal::{CpuFirmware, PsciError};
use spin::Once;

use crate::services::PlatformServices;

/// Bring-up phase of one core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CorePhase {
    Unstarted = 0,
    EarlyInit = 1,
    LateInit = 2,
    Running = 3,
    /// Gave up on this core; terminal
    Failed = 4,
}

impl CorePhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::EarlyInit,
            2 => Self::LateInit,
            3 => Self::Running,
            _ => Self::Failed,
        }
    }

    /// The phase that legally follows this one
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Unstarted => Some(Self::EarlyInit),
            Self::EarlyInit => Some(Self::LateInit),
            Self::LateInit => Some(Self::Running),
            Self::Running | Self::Failed => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::EarlyInit => "early-init",
            Self::LateInit => "late-init",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "bring-up errors must be handled"]
pub enum BringupError {
    UnknownCore(CoreId),
    /// A phase change that is not the single next step
    PhaseOrder {
        core: CoreId,
        from: CorePhase,
        to: CorePhase,
    },
    /// The memory layout has not been published yet
    NotPublished,
    /// Secondaries may only be launched once the primary is in LateInit
    PrimaryNotReady(CorePhase),
    /// The primary could not produce a layout to publish
    LayoutUnavailable,
    NoCoreRunning,
}

impl fmt::Display for BringupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCore(core) => write!(f, "{} is not described", core),
            Self::PhaseOrder { core, from, to } => {
                write!(f, "{}: illegal phase change {} -> {}", core, from, to)
            }
            Self::NotPublished => f.write_str("memory layout not published"),
            Self::PrimaryNotReady(phase) => {
                write!(f, "primary core is {}, secondaries need late-init", phase)
            }
            Self::LayoutUnavailable => f.write_str("no memory layout to publish"),
            Self::NoCoreRunning => f.write_str("no core reached running"),
        }
    }
}

/// Why a launch attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    Firmware(PsciError),
    /// The spin-table release address is outside every mapping
    ReleaseNotMapped(PhysAddr),
    InvalidStack,
}

impl LaunchError {
    /// Retrying cannot help
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        match self {
            Self::Firmware(e) => e.is_permanent(),
            Self::ReleaseNotMapped(_) | Self::InvalidStack => true,
        }
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firmware(e) => write!(f, "{}", e),
            Self::ReleaseNotMapped(pa) => write!(f, "release address {} not mapped", pa),
            Self::InvalidStack => f.write_str("invalid initial stack"),
        }
    }
}

/// What the primary publishes for secondaries to adopt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedLayout {
    /// Physical address of the root translation table
    pub translation_root: PhysAddr,
    /// `virt - phys` of the kernel image mapping
    pub image_offset: u64,
    /// `virt - phys` of the linear map
    pub linear_offset: u64,
}

impl PublishedLayout {
    #[must_use]
    pub fn new(mappings: &MappingTable, translation_root: PhysAddr) -> Option<Self> {
        let image = mappings.iter_class(MappingClass::KernelImage).next()?;
        let linear = mappings.iter_class(MappingClass::Linear).next()?;
        Some(Self {
            translation_root,
            image_offset: image.virtual_offset(),
            linear_offset: linear.virtual_offset(),
        })
    }
}

/// Retry budget for each secondary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringupPolicy {
    pub attempts: u32,
    /// How long to wait for Running after each launch
    pub attempt_timeout: Duration,
}

/// Hooks the primary runs during EarlyInit.
pub trait PrimaryInit {
    fn init_console(&mut self);

    /// Build and install the translation tables.
    fn install_layout(&mut self) -> Result<PublishedLayout, BringupError>;

    fn install_vectors(&mut self);
}

/// Hooks a secondary runs on its way to Running.
pub trait SecondaryInit {
    /// Adopt the published translation tables.
    fn enable_layout(&mut self, core: CoreId, layout: &PublishedLayout);

    fn install_vectors(&mut self, core: CoreId);

    /// Per-core setup done in LateInit (timer, interrupt interface).
    fn late_init(&mut self, _core: CoreId) {}
}

/// Starts a powered-off core.
pub trait CpuLauncher: Sync {
    /// Start `core` at physical `entry` on `stack`.
    fn cpu_boot(&self, core: &CoreInfo, entry: PhysAddr, stack: InitialStack) -> Result<(), LaunchError>;
}

/// Per-core arguments read by the secondary entry stub with the MMU off
#[derive(Debug)]
#[repr(C)]
pub struct SecondaryBootArgs {
    pub mpidr: AtomicU64,
    pub core_id: AtomicU64,
    pub stack_top: AtomicU64,
    pub translation_root: AtomicU64,
}

impl SecondaryBootArgs {
    pub const SIZE: u64 = core::mem::size_of::<Self>() as u64;

    const fn new() -> Self {
        Self {
            mpidr: AtomicU64::new(u64::MAX),
            core_id: AtomicU64::new(0),
            stack_top: AtomicU64::new(0),
            translation_root: AtomicU64::new(0),
        }
    }
}

/// One [`SecondaryBootArgs`] slot per core
#[derive(Debug)]
#[repr(C, align(64))]
pub struct BootArgsTable {
    slots: [SecondaryBootArgs; MAX_CPUS],
}

impl BootArgsTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { SecondaryBootArgs::new() }; MAX_CPUS],
        }
    }

    /// Fill `core`'s slot and return its byte offset in the table.
    pub fn fill(&self, core: &CoreInfo, stack: InitialStack, translation_root: PhysAddr) -> Option<u64> {
        let index = core.core_id.index();
        let slot = self.slots.get(index)?;
        slot.core_id.store(u64::from(core.core_id.0), Ordering::Relaxed);
        slot.stack_top.store(stack.virt_top.as_u64(), Ordering::Relaxed);
        slot.translation_root.store(translation_root.as_u64(), Ordering::Relaxed);
        // Published last: the stub matches on mpidr
        slot.mpidr.store(core.mpidr, Ordering::Release);
        Some(index as u64 * SecondaryBootArgs::SIZE)
    }

    pub fn slot(&self, core: CoreId) -> Option<&SecondaryBootArgs> {
        self.slots.get(core.index())
    }
}

impl Default for BootArgsTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a core's entry point to its spin-table release address
pub type ReleaseWriter = fn(VirtAddr, PhysAddr);

/// Launches cores the way the descriptor says: PSCI `CPU_ON` or a
/// spin-table release.
pub struct FirmwareLauncher<'a> {
    firmware: &'a dyn CpuFirmware,
    services: &'a PlatformServices,
    args: &'a BootArgsTable,
    args_phys: PhysAddr,
    translation_root: PhysAddr,
    release: ReleaseWriter,
}

impl<'a> FirmwareLauncher<'a> {
    /// `args_phys` is the physical address of `args`, which the entry stub
    /// receives as its context.
    pub fn new(
        firmware: &'a dyn CpuFirmware,
        services: &'a PlatformServices,
        args: &'a BootArgsTable,
        args_phys: PhysAddr,
        translation_root: PhysAddr,
        release: ReleaseWriter,
    ) -> Self {
        Self {
            firmware,
            services,
            args,
            args_phys,
            translation_root,
            release,
        }
    }
}

impl CpuLauncher for FirmwareLauncher<'_> {
    fn cpu_boot(&self, core: &CoreInfo, entry: PhysAddr, stack: InitialStack) -> Result<(), LaunchError> {
        if !stack.is_valid() {
            return Err(LaunchError::InvalidStack);
        }
        let offset = self
            .args
            .fill(core, stack, self.translation_root)
            .ok_or(LaunchError::InvalidStack)?;

        match core.enable_method {
            EnableMethod::Psci => {
                let context = self.args_phys.as_u64() + offset;
                self.firmware
                    .cpu_on(core.mpidr, entry, context)
                    .map_err(LaunchError::Firmware)
            }
            EnableMethod::SpinTable { release_addr } => {
                let va = self
                    .services
                    .phys_to_virt(release_addr)
                    .map_err(|_| LaunchError::ReleaseNotMapped(release_addr))?;
                (self.release)(va, entry);
                Ok(())
            }
        }
    }
}

struct CoreSlot {
    phase: AtomicU8,
    attempts: AtomicU32,
    /// Physical entry used for the last launch, 0 if never launched
    boot_address: AtomicU64,
}

impl CoreSlot {
    const fn new() -> Self {
        Self {
            phase: AtomicU8::new(CorePhase::Unstarted as u8),
            attempts: AtomicU32::new(0),
            boot_address: AtomicU64::new(0),
        }
    }

    fn phase(&self) -> CorePhase {
        CorePhase::from_u8(self.phase.load(Ordering::Acquire))
    }
}

/// Snapshot of one core's bring-up state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreDescriptor {
    pub core_id: CoreId,
    pub mpidr: u64,
    /// Entry point handed to firmware; `None` for the primary and for
    /// cores never launched
    pub boot_physical_address: Option<PhysAddr>,
    pub phase: CorePhase,
    pub attempts: u32,
}

/// Outcome of bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringupReport {
    pub running: Vec<CoreId>,
    pub failed: Vec<CoreId>,
}

pub struct BringupCoordinator {
    cores: Vec<CoreInfo>,
    slots: [CoreSlot; MAX_CPUS],
    primary: CoreId,
    policy: BringupPolicy,
    layout: Once<PublishedLayout>,
}

impl BringupCoordinator {
    pub fn new(cores: &[CoreInfo], primary: CoreId, policy: BringupPolicy) -> Result<Self, BringupError> {
        if !cores.iter().any(|c| c.core_id == primary) {
            return Err(BringupError::UnknownCore(primary));
        }
        Ok(Self {
            cores: cores.iter().copied().take(MAX_CPUS).collect(),
            slots: [const { CoreSlot::new() }; MAX_CPUS],
            primary,
            policy,
            layout: Once::new(),
        })
    }

    pub fn primary(&self) -> CoreId {
        self.primary
    }

    fn slot(&self, core: CoreId) -> Result<&CoreSlot, BringupError> {
        if self.cores.iter().any(|c| c.core_id == core) {
            self.slots.get(core.index()).ok_or(BringupError::UnknownCore(core))
        } else {
            Err(BringupError::UnknownCore(core))
        }
    }

    pub fn phase(&self, core: CoreId) -> Option<CorePhase> {
        self.slot(core).ok().map(CoreSlot::phase)
    }

    /// Move `core` one phase forward. Anything else is refused.
    pub fn advance(&self, core: CoreId, to: CorePhase) -> Result<(), BringupError> {
        let slot = self.slot(core)?;
        let from = slot.phase();
        if from.next() != Some(to) {
            return Err(BringupError::PhaseOrder { core, from, to });
        }
        slot.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| BringupError::PhaseOrder {
                core,
                from: CorePhase::from_u8(actual),
                to,
            })
    }

    /// Give up on `core`. A Running core stays Running.
    pub fn fail(&self, core: CoreId) -> Result<(), BringupError> {
        let slot = self.slot(core)?;
        let mut current = slot.phase();
        while !matches!(current, CorePhase::Running | CorePhase::Failed) {
            match slot.phase.compare_exchange(
                current as u8,
                CorePhase::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = CorePhase::from_u8(actual),
            }
        }
        if current == CorePhase::Running {
            return Err(BringupError::PhaseOrder {
                core,
                from: current,
                to: CorePhase::Failed,
            });
        }
        Ok(())
    }

    // -- Primary

    /// Primary EarlyInit: console, memory layout, exception vectors.
    /// Assumes nothing about other cores.
    pub fn primary_early_init(&self, hooks: &mut dyn PrimaryInit) -> Result<PublishedLayout, BringupError> {
        self.advance(self.primary, CorePhase::EarlyInit)?;
        hooks.init_console();
        let layout = hooks.install_layout()?;
        hooks.install_vectors();
        log::debug!("smp: {} early init done", self.primary);
        Ok(layout)
    }

    /// Make the layout visible to secondaries. Only the first call wins.
    pub fn publish(&self, layout: PublishedLayout) -> &PublishedLayout {
        self.layout.call_once(|| layout)
    }

    pub fn published(&self) -> Option<&PublishedLayout> {
        self.layout.get()
    }

    pub fn primary_late_init(&self) -> Result<(), BringupError> {
        if self.layout.get().is_none() {
            return Err(BringupError::NotPublished);
        }
        self.advance(self.primary, CorePhase::LateInit)
    }

    pub fn primary_running(&self) -> Result<(), BringupError> {
        self.advance(self.primary, CorePhase::Running)?;
        log::info!("smp: {} running", self.primary);
        Ok(())
    }

    /// Launch every secondary, retrying each up to the policy's budget.
    ///
    /// `stacks` is indexed by core index. Cores that never reach Running are
    /// marked Failed; that is reported, not returned as an error.
    pub fn boot_secondaries(
        &self,
        launcher: &dyn CpuLauncher,
        entry: PhysAddr,
        stacks: &[InitialStack],
        services: &PlatformServices,
    ) -> Result<BringupReport, BringupError> {
        let primary_phase = self.slot(self.primary)?.phase();
        if primary_phase != CorePhase::LateInit {
            return Err(BringupError::PrimaryNotReady(primary_phase));
        }
        if self.layout.get().is_none() {
            return Err(BringupError::NotPublished);
        }

        for core in self.cores.iter().filter(|c| c.core_id != self.primary) {
            let Some(&stack) = stacks.get(core.core_id.index()) else {
                log::warn!("smp: no stack for {}, excluding it", core.core_id);
                let _ = self.fail(core.core_id);
                continue;
            };
            if self.launch(core, launcher, entry, stack, services) {
                log::info!("smp: {} online", core.core_id);
            } else {
                let _ = self.fail(core.core_id);
                log::warn!("smp: {} did not come up, excluded from scheduling", core.core_id);
            }
        }

        // The primary is still in LateInit here, so an empty `running`
        // list is not an error yet
        Ok(self.collect_report())
    }

    /// True once `core` is Running
    fn launch(
        &self,
        core: &CoreInfo,
        launcher: &dyn CpuLauncher,
        entry: PhysAddr,
        stack: InitialStack,
        services: &PlatformServices,
    ) -> bool {
        let Ok(slot) = self.slot(core.core_id) else {
            return false;
        };
        slot.boot_address.store(entry.as_u64(), Ordering::Relaxed);

        for attempt in 1..=self.policy.attempts {
            slot.attempts.store(attempt, Ordering::Relaxed);
            match launcher.cpu_boot(core, entry, stack) {
                // Still powering on from a previous attempt: keep waiting
                Ok(()) | Err(LaunchError::Firmware(PsciError::AlreadyOn | PsciError::OnPending)) => {}
                Err(e) if e.is_permanent() => {
                    log::warn!("smp: {} launch failed: {}", core.core_id, e);
                    return false;
                }
                Err(e) => {
                    log::warn!(
                        "smp: {} launch attempt {}/{} failed: {}",
                        core.core_id,
                        attempt,
                        self.policy.attempts,
                        e
                    );
                    continue;
                }
            }

            let deadline = services.deadline_after(self.policy.attempt_timeout);
            loop {
                match slot.phase() {
                    CorePhase::Running => return true,
                    CorePhase::Failed => return false,
                    _ => {}
                }
                if services.now() >= deadline {
                    log::debug!(
                        "smp: {} not running after attempt {} ({})",
                        core.core_id,
                        attempt,
                        slot.phase()
                    );
                    break;
                }
                services.relax();
            }
        }
        false
    }

    // -- Secondary

    /// Bring the calling secondary to Running.
    ///
    /// On error the core must park; it has been (or already was) marked
    /// Failed.
    pub fn secondary_entry(&self, core: CoreId, init: &mut dyn SecondaryInit) -> Result<(), BringupError> {
        let Some(layout) = self.layout.get() else {
            let _ = self.fail(core);
            return Err(BringupError::NotPublished);
        };
        let mut steps = || -> Result<(), BringupError> {
            self.advance(core, CorePhase::EarlyInit)?;
            init.enable_layout(core, layout);
            init.install_vectors(core);
            self.advance(core, CorePhase::LateInit)?;
            init.late_init(core);
            self.advance(core, CorePhase::Running)
        };
        let result = steps();
        if result.is_err() {
            let _ = self.fail(core);
        }
        result
    }

    // -- Queries

    /// Cores available to the scheduler
    pub fn online_cores(&self) -> Vec<CoreId> {
        self.cores
            .iter()
            .map(|c| c.core_id)
            .filter(|&id| self.phase(id) == Some(CorePhase::Running))
            .collect()
    }

    pub fn cores(&self) -> Vec<CoreDescriptor> {
        self.cores
            .iter()
            .filter_map(|c| {
                let slot = self.slots.get(c.core_id.index())?;
                let boot = slot.boot_address.load(Ordering::Relaxed);
                Some(CoreDescriptor {
                    core_id: c.core_id,
                    mpidr: c.mpidr,
                    boot_physical_address: (boot != 0).then_some(PhysAddr::new(boot)),
                    phase: slot.phase(),
                    attempts: slot.attempts.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    /// Running and Failed cores. Fails if no core is Running at all.
    pub fn report(&self) -> Result<BringupReport, BringupError> {
        let report = self.collect_report();
        if report.running.is_empty() {
            return Err(BringupError::NoCoreRunning);
        }
        Ok(report)
    }

    fn collect_report(&self) -> BringupReport {
        let mut report = BringupReport {
            running: Vec::new(),
            failed: Vec::new(),
        };
        for c in self.cores() {
            match c.phase {
                CorePhase::Running => report.running.push(c.core_id),
                CorePhase::Failed => report.failed.push(c.core_id),
                _ => {}
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockCpuFirmware};
    use proptest::prelude::*;
    use spin::Mutex;
    use std::collections::BTreeSet;
    use std::thread;

    fn cores(n: u32) -> Vec<CoreInfo> {
        (0..n)
            .map(|i| CoreInfo {
                core_id: CoreId::new(i),
                mpidr: u64::from(i),
                enable_method: EnableMethod::Psci,
            })
            .collect()
    }

    fn policy(attempts: u32, timeout: Duration) -> BringupPolicy {
        BringupPolicy {
            attempts,
            attempt_timeout: timeout,
        }
    }

    fn layout() -> PublishedLayout {
        PublishedLayout {
            translation_root: PhysAddr::new(0x4_0000),
            image_offset: 0xFFFF_FFFF_8000_0000,
            linear_offset: 0xFFFF_8000_0000_0000,
        }
    }

    fn stacks() -> Vec<InitialStack> {
        (0..MAX_CPUS as u64)
            .map(|i| {
                InitialStack::new(
                    PhysAddr::new(0x100_0000 + i * 0x1_0000),
                    VirtAddr::new(0xFFFF_8000_0101_0000 + i * 0x1_0000),
                )
            })
            .collect()
    }

    struct Hooks {
        calls: Vec<&'static str>,
    }

    impl PrimaryInit for Hooks {
        fn init_console(&mut self) {
            self.calls.push("console");
        }

        fn install_layout(&mut self) -> Result<PublishedLayout, BringupError> {
            self.calls.push("layout");
            Ok(layout())
        }

        fn install_vectors(&mut self) {
            self.calls.push("vectors");
        }
    }

    #[derive(Default)]
    struct Secondary {
        seen: Option<PublishedLayout>,
    }

    impl SecondaryInit for Secondary {
        fn enable_layout(&mut self, _core: CoreId, layout: &PublishedLayout) {
            self.seen = Some(*layout);
        }

        fn install_vectors(&mut self, _core: CoreId) {}
    }

    fn primary_to_late_init(coord: &BringupCoordinator) {
        let mut hooks = Hooks { calls: Vec::new() };
        let l = coord.primary_early_init(&mut hooks).unwrap();
        assert_eq!(hooks.calls, ["console", "layout", "vectors"]);
        coord.publish(l);
        coord.primary_late_init().unwrap();
    }

    /// Runs the secondary synchronously unless told to ignore the core
    struct InlineLauncher<'a> {
        coord: &'a BringupCoordinator,
        silent: BTreeSet<u32>,
        refuse: BTreeSet<u32>,
        calls: Mutex<Vec<u32>>,
    }

    impl CpuLauncher for InlineLauncher<'_> {
        fn cpu_boot(&self, core: &CoreInfo, _entry: PhysAddr, _stack: InitialStack) -> Result<(), LaunchError> {
            self.calls.lock().push(core.core_id.0);
            if self.refuse.contains(&core.core_id.0) {
                return Err(LaunchError::Firmware(PsciError::NotPresent));
            }
            if !self.silent.contains(&core.core_id.0) {
                let mut init = Secondary::default();
                self.coord.secondary_entry(core.core_id, &mut init).unwrap();
                assert_eq!(init.seen, Some(layout()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_all_cores_come_up() {
        let services = testing::services();
        let coord = BringupCoordinator::new(&cores(4), CoreId::new(0), policy(3, Duration::from_millis(5))).unwrap();
        primary_to_late_init(&coord);

        let launcher = InlineLauncher {
            coord: &coord,
            silent: BTreeSet::new(),
            refuse: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        };
        let report = coord
            .boot_secondaries(&launcher, PhysAddr::new(0x8_1000), &stacks(), services)
            .unwrap();
        coord.primary_running().unwrap();

        assert_eq!(*launcher.calls.lock(), [1, 2, 3]);
        assert!(report.failed.is_empty());
        assert_eq!(coord.online_cores().len(), 4);
        let cpu2 = coord.cores()[2];
        assert_eq!(cpu2.boot_physical_address, Some(PhysAddr::new(0x8_1000)));
        assert_eq!(cpu2.attempts, 1);
    }

    #[test]
    fn test_silent_core_is_retried_then_excluded() {
        let services = testing::services();
        let coord = BringupCoordinator::new(&cores(3), CoreId::new(0), policy(3, Duration::from_micros(100))).unwrap();
        primary_to_late_init(&coord);

        let launcher = InlineLauncher {
            coord: &coord,
            silent: BTreeSet::from([2]),
            refuse: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        };
        let report = coord
            .boot_secondaries(&launcher, PhysAddr::new(0x8_1000), &stacks(), services)
            .unwrap();

        assert_eq!(*launcher.calls.lock(), [1, 2, 2, 2]);
        assert_eq!(report.failed, [CoreId::new(2)]);
        assert_eq!(report.running, [CoreId::new(1)]);
        assert!(!coord.online_cores().contains(&CoreId::new(2)));

        // A late arrival cannot revive a failed core
        let err = coord.secondary_entry(CoreId::new(2), &mut Secondary::default());
        assert!(matches!(err, Err(BringupError::PhaseOrder { .. })));
        assert_eq!(coord.phase(CoreId::new(2)), Some(CorePhase::Failed));
    }

    #[test]
    fn test_permanent_launch_error_is_not_retried() {
        let services = testing::services();
        let coord = BringupCoordinator::new(&cores(2), CoreId::new(0), policy(3, Duration::from_millis(1))).unwrap();
        primary_to_late_init(&coord);
        let launcher = InlineLauncher {
            coord: &coord,
            silent: BTreeSet::new(),
            refuse: BTreeSet::from([1]),
            calls: Mutex::new(Vec::new()),
        };
        coord
            .boot_secondaries(&launcher, PhysAddr::new(0x8_1000), &stacks(), services)
            .unwrap();
        assert_eq!(*launcher.calls.lock(), [1]);
        assert_eq!(coord.phase(CoreId::new(1)), Some(CorePhase::Failed));
    }

    #[test]
    fn test_secondaries_wait_for_late_init() {
        let services = testing::services();
        let coord = BringupCoordinator::new(&cores(2), CoreId::new(0), policy(1, Duration::from_millis(1))).unwrap();
        let launcher = InlineLauncher {
            coord: &coord,
            silent: BTreeSet::new(),
            refuse: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        };
        let err = coord.boot_secondaries(&launcher, PhysAddr::new(0x8_1000), &stacks(), services);
        assert_eq!(err, Err(BringupError::PrimaryNotReady(CorePhase::Unstarted)));
        assert!(launcher.calls.lock().is_empty());

        // Late init refuses to run before the layout is published
        let mut hooks = Hooks { calls: Vec::new() };
        coord.primary_early_init(&mut hooks).unwrap();
        assert_eq!(coord.primary_late_init(), Err(BringupError::NotPublished));
    }

    #[test]
    fn test_secondary_before_publish_parks() {
        let coord = BringupCoordinator::new(&cores(2), CoreId::new(0), policy(1, Duration::from_millis(1))).unwrap();
        let err = coord.secondary_entry(CoreId::new(1), &mut Secondary::default());
        assert_eq!(err, Err(BringupError::NotPublished));
        assert_eq!(coord.phase(CoreId::new(1)), Some(CorePhase::Failed));
    }

    #[test]
    fn test_no_core_running() {
        let coord = BringupCoordinator::new(&cores(2), CoreId::new(0), policy(1, Duration::from_millis(1))).unwrap();
        assert_eq!(coord.report(), Err(BringupError::NoCoreRunning));
    }

    #[test]
    fn test_phase_changes_are_single_steps() {
        let coord = BringupCoordinator::new(&cores(2), CoreId::new(0), policy(1, Duration::from_millis(1))).unwrap();
        let core = CoreId::new(1);
        assert!(coord.advance(core, CorePhase::LateInit).is_err());
        coord.advance(core, CorePhase::EarlyInit).unwrap();
        assert!(coord.advance(core, CorePhase::EarlyInit).is_err());
        assert!(coord.advance(core, CorePhase::Unstarted).is_err());
        assert_eq!(coord.advance(CoreId::new(7), CorePhase::EarlyInit), Err(BringupError::UnknownCore(CoreId::new(7))));
        assert!(BringupCoordinator::new(&cores(2), CoreId::new(5), policy(1, Duration::ZERO)).is_err());
    }

    /// Starts each secondary on its own thread, like real hardware would
    struct ThreadLauncher<'scope, 'env> {
        scope: &'scope thread::Scope<'scope, 'env>,
        coord: &'env BringupCoordinator,
    }

    impl CpuLauncher for ThreadLauncher<'_, '_> {
        fn cpu_boot(&self, core: &CoreInfo, _entry: PhysAddr, _stack: InitialStack) -> Result<(), LaunchError> {
            let coord = self.coord;
            let id = core.core_id;
            self.scope.spawn(move || {
                let _ = coord.secondary_entry(id, &mut Secondary::default());
            });
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_secondaries() {
        let services = testing::services();
        let coord = BringupCoordinator::new(&cores(4), CoreId::new(0), policy(1, Duration::from_secs(3600))).unwrap();
        primary_to_late_init(&coord);
        let report = thread::scope(|scope| {
            let launcher = ThreadLauncher { scope, coord: &coord };
            coord.boot_secondaries(&launcher, PhysAddr::new(0x8_1000), &stacks(), services)
        })
        .unwrap();
        assert_eq!(report.running.len(), 3);
    }

    #[test]
    fn test_firmware_launcher_psci_context() {
        let services = testing::services();
        let firmware = MockCpuFirmware::default();
        let args = BootArgsTable::new();
        let launcher = FirmwareLauncher::new(
            &firmware,
            services,
            &args,
            PhysAddr::new(0x9_0000),
            PhysAddr::new(0x4_0000),
            |_, _| {},
        );
        let core = cores(3)[2];
        let stack = stacks()[2];
        launcher.cpu_boot(&core, PhysAddr::new(0x8_1000), stack).unwrap();

        let calls = firmware.calls();
        assert_eq!(calls, [(2, PhysAddr::new(0x8_1000), 0x9_0000 + 2 * SecondaryBootArgs::SIZE)]);
        let slot = args.slot(CoreId::new(2)).unwrap();
        assert_eq!(slot.stack_top.load(Ordering::Acquire), stack.virt_top.as_u64());
        assert_eq!(slot.translation_root.load(Ordering::Acquire), 0x4_0000);
        assert_eq!(slot.mpidr.load(Ordering::Acquire), 2);

        firmware.fail(1, PsciError::Denied);
        assert_eq!(
            launcher.cpu_boot(&cores(2)[1], PhysAddr::new(0x8_1000), stack),
            Err(LaunchError::Firmware(PsciError::Denied))
        );
        assert_eq!(
            launcher.cpu_boot(&core, PhysAddr::new(0x8_1000), InitialStack::new(PhysAddr::new(0), VirtAddr::new(0))),
            Err(LaunchError::InvalidStack)
        );
    }

    static RELEASED: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());

    fn record_release(va: VirtAddr, entry: PhysAddr) {
        RELEASED.lock().push((va.as_u64(), entry.as_u64()));
    }

    #[test]
    fn test_firmware_launcher_spin_table() {
        let services = testing::services();
        let firmware = MockCpuFirmware::default();
        let args = BootArgsTable::new();
        let launcher = FirmwareLauncher::new(
            &firmware,
            services,
            &args,
            PhysAddr::new(0x9_0000),
            PhysAddr::new(0x4_0000),
            record_release,
        );
        let mapped = CoreInfo {
            core_id: CoreId::new(1),
            mpidr: 1,
            enable_method: EnableMethod::SpinTable {
                release_addr: PhysAddr::new(0xFFF8),
            },
        };
        launcher.cpu_boot(&mapped, PhysAddr::new(0x8_1000), stacks()[1]).unwrap();
        let va = services.phys_to_virt(PhysAddr::new(0xFFF8)).unwrap();
        assert!(RELEASED.lock().contains(&(va.as_u64(), 0x8_1000)));
        assert!(firmware.calls().is_empty());

        let unmapped = CoreInfo {
            enable_method: EnableMethod::SpinTable {
                release_addr: PhysAddr::new(0x80_0000_0000),
            },
            ..mapped
        };
        assert_eq!(
            launcher.cpu_boot(&unmapped, PhysAddr::new(0x8_1000), stacks()[1]),
            Err(LaunchError::ReleaseNotMapped(PhysAddr::new(0x80_0000_0000)))
        );
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Advance(CorePhase),
        Fail,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Advance(CorePhase::Unstarted)),
            Just(Op::Advance(CorePhase::EarlyInit)),
            Just(Op::Advance(CorePhase::LateInit)),
            Just(Op::Advance(CorePhase::Running)),
            Just(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn prop_phases_never_go_backwards(ops in proptest::collection::vec(op(), 0..20)) {
            let coord = BringupCoordinator::new(&cores(2), CoreId::new(0), policy(1, Duration::ZERO)).unwrap();
            let core = CoreId::new(1);
            let mut last = CorePhase::Unstarted;
            for op in ops {
                match op {
                    Op::Advance(p) => { let _ = coord.advance(core, p); }
                    Op::Fail => { let _ = coord.fail(core); }
                }
                let now = coord.phase(core).unwrap();
                prop_assert!(now >= last);
                if matches!(last, CorePhase::Running | CorePhase::Failed) {
                    prop_assert_eq!(now, last);
                }
                last = now;
            }
        }
    }
}
