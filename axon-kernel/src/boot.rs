//! Boot entry
//!
//! [`boot_primary`] takes the machine from a raw descriptor blob to a
//! running system, leaf first: resolve, configure, partition, build the
//! facade, bring up the cores, bind drivers, start the accelerator. Every
//! step only depends on the ones before it.
//!
//! Everything hardware-specific comes in through [`BootHardware`], so the
//! whole sequence runs on the host in tests. [`kernel_main`] wraps it for
//! the real machine: on success it never returns, on failure it prints a
//! diagnostic, asks firmware to power off and halts.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use axon_common::{CoreId, InitialStack, KernelImage, PhysAddr};
use axon_paging::{LayoutPolicy, MappingTable, PartitionError, compute_mappings};
use axon_pal::descriptor::DESCRIPTOR_MAX_SIZE;
use axon_pal::{ConsoleDevice, CounterHardware, CpuFirmware, MalformedDescriptor, PlatformDescriptor, PowerControl};

use crate::config::KernelConfig;
use crate::driver::{DriverRegistry, PlatformDriver};
use crate::early_println;
use crate::logging;
use crate::npu::{AcceleratorDevice, AcceleratorInitError, AcceleratorPipeline};
use crate::services::{PlatformHardware, PlatformServices, ServiceError};
use crate::smp::{
    BootArgsTable, BringupCoordinator, BringupError, BringupReport, FirmwareLauncher, PrimaryInit, PublishedLayout,
    ReleaseWriter,
};

/// CPU-level setup the primary needs during EarlyInit.
pub trait ArchSupport {
    fn init_console(&mut self) {}

    /// Build translation tables for `mappings` and switch to them.
    /// Returns the physical address of the root table.
    fn install_tables(&mut self, mappings: &MappingTable) -> Result<PhysAddr, BringupError>;

    fn install_vectors(&mut self) {}
}

/// Adapts [`ArchSupport`] to the coordinator's EarlyInit hooks
struct PrimaryHooks<'a> {
    arch: &'a mut dyn ArchSupport,
    mappings: &'a MappingTable,
}

impl PrimaryInit for PrimaryHooks<'_> {
    fn init_console(&mut self) {
        self.arch.init_console();
    }

    fn install_layout(&mut self) -> Result<PublishedLayout, BringupError> {
        let root = self.arch.install_tables(self.mappings)?;
        PublishedLayout::new(self.mappings, root).ok_or(BringupError::LayoutUnavailable)
    }

    fn install_vectors(&mut self) {
        self.arch.install_vectors();
    }
}

/// Everything board- and CPU-specific that boot needs
pub struct BootHardware<'a> {
    pub console: &'static dyn ConsoleDevice,
    pub counter: &'static dyn CounterHardware,
    pub power: &'static dyn PowerControl,
    pub firmware: &'static dyn CpuFirmware,
    /// Spin-table release write
    pub release: ReleaseWriter,
    pub boot_args: &'static BootArgsTable,
    /// Physical address of `boot_args`
    pub boot_args_phys: PhysAddr,
    pub arch: &'a mut dyn ArchSupport,
    pub image: KernelImage,
    /// Physical address of the secondary entry stub
    pub secondary_entry: PhysAddr,
    /// Indexed by core index
    pub stacks: Vec<InitialStack>,
    pub accelerator: Option<&'static dyn AcceleratorDevice>,
    pub drivers: Vec<Box<dyn PlatformDriver>>,
    /// Called with the coordinator before any secondary is launched, so
    /// the secondary entry path can find it
    pub on_bringup: Option<fn(&'static BringupCoordinator)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "boot errors must be handled"]
pub enum BootError {
    Descriptor(MalformedDescriptor),
    Partition(PartitionError),
    Services(ServiceError),
    Bringup(BringupError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Descriptor(e) => write!(f, "descriptor: {}", e),
            Self::Partition(e) => write!(f, "memory layout: {}", e),
            Self::Services(e) => write!(f, "platform services: {}", e),
            Self::Bringup(e) => write!(f, "bring-up: {}", e),
        }
    }
}

impl From<MalformedDescriptor> for BootError {
    fn from(e: MalformedDescriptor) -> Self {
        Self::Descriptor(e)
    }
}

impl From<PartitionError> for BootError {
    fn from(e: PartitionError) -> Self {
        Self::Partition(e)
    }
}

impl From<ServiceError> for BootError {
    fn from(e: ServiceError) -> Self {
        Self::Services(e)
    }
}

impl From<BringupError> for BootError {
    fn from(e: BringupError) -> Self {
        Self::Bringup(e)
    }
}

/// A booted machine
pub struct BootedSystem {
    pub services: &'static PlatformServices,
    pub config: KernelConfig,
    pub coordinator: &'static BringupCoordinator,
    pub bringup: BringupReport,
    pub drivers: DriverRegistry,
    /// `None` when no accelerator is present
    pub accelerator: Option<&'static AcceleratorPipeline>,
}

impl BootedSystem {
    /// Stop drivers and power off. Returns only if firmware refuses.
    pub fn shutdown(&mut self) -> Result<(), axon_pal::PsciError> {
        log::info!("boot: shutting down");
        self.drivers.stop_all();
        self.services.power_off()
    }

    /// One pass of background housekeeping: timers, accelerator events
    /// and its watchdog.
    pub fn poll(&self) {
        self.services.handle_timer_interrupt();
        if let Some(npu) = self.accelerator {
            npu.service_interrupt();
            npu.check_health();
        }
    }
}

/// Boot the primary core from a descriptor blob.
pub fn boot_primary(blob: &[u8], core_id: u32, hw: BootHardware<'_>) -> Result<BootedSystem, BootError> {
    let descriptor = axon_pal::resolve(blob)?;
    boot_with(descriptor, CoreId::new(core_id), hw)
}

fn boot_with(descriptor: PlatformDescriptor, primary: CoreId, hw: BootHardware<'_>) -> Result<BootedSystem, BootError> {
    let config = KernelConfig::from_bootargs(descriptor.bootargs());
    logging::init(config.log_level);

    let mappings = compute_mappings(descriptor.regions(), &hw.image, &LayoutPolicy::default())?;
    let platform = PlatformHardware {
        console: hw.console,
        counter: hw.counter,
        power: hw.power,
    };
    let services: &'static PlatformServices = Box::leak(Box::new(PlatformServices::new(descriptor, mappings, platform)?));
    logging::attach(services);
    log::info!(
        "boot: {} ({:?}), {} cores, primary {}",
        services.descriptor().model(),
        services.descriptor().format(),
        services.descriptor().cores().len(),
        primary
    );

    // Cores
    let coordinator: &'static BringupCoordinator = Box::leak(Box::new(BringupCoordinator::new(
        services.descriptor().cores(),
        primary,
        config.bringup_policy(),
    )?));
    let mut hooks = PrimaryHooks {
        arch: hw.arch,
        mappings: services.mappings(),
    };
    let layout = coordinator.primary_early_init(&mut hooks)?;
    let layout = *coordinator.publish(layout);
    coordinator.primary_late_init()?;
    if let Some(hook) = hw.on_bringup {
        hook(coordinator);
    }

    let launcher = FirmwareLauncher::new(
        hw.firmware,
        services,
        hw.boot_args,
        hw.boot_args_phys,
        layout.translation_root,
        hw.release,
    );
    coordinator.boot_secondaries(&launcher, hw.secondary_entry, &hw.stacks, services)?;
    coordinator.primary_running()?;
    let bringup = coordinator.report()?;
    log::info!(
        "boot: {} of {} cores running",
        bringup.running.len(),
        services.descriptor().cores().len()
    );

    // Drivers
    let mut drivers = DriverRegistry::new();
    for driver in hw.drivers {
        drivers.register(driver);
    }
    let summary = drivers.bind_all(services);
    log::info!(
        "boot: drivers {} running, {} failed, {} unbound",
        summary.running,
        summary.failed,
        summary.unbound
    );

    let accelerator = hw
        .accelerator
        .and_then(|device| start_accelerator(device, services, &config));

    logging::disable_early_console();
    Ok(BootedSystem {
        services,
        config,
        coordinator,
        bringup,
        drivers,
        accelerator,
    })
}

/// Initialise the accelerator. Its absence is not a boot failure.
fn start_accelerator(
    device: &'static dyn AcceleratorDevice,
    services: &'static PlatformServices,
    config: &KernelConfig,
) -> Option<&'static AcceleratorPipeline> {
    let pipeline: &'static AcceleratorPipeline = Box::leak(Box::new(AcceleratorPipeline::new(device, services)));
    match pipeline.init_accelerator(config.accelerator()) {
        Ok(_) => {}
        Err(AcceleratorInitError::DeviceNotPresent) => {
            log::info!("boot: no accelerator present");
            return None;
        }
        // Kept so a later init can retry
        Err(e) => log::warn!("boot: {}", e),
    }
    if let Err(e) = pipeline.attach_interrupt() {
        log::warn!("boot: accelerator interrupt: {}", e);
    }
    Some(pipeline)
}

/// Print the fatal boot diagnostic and ask firmware to power off.
pub fn report_fatal(console: &dyn ConsoleDevice, power: &dyn PowerControl, error: &dyn fmt::Display) {
    early_println!(console, "axon: fatal boot error: {}", error);
    if let Err(e) = power.system_off() {
        early_println!(console, "axon: power off failed: {}", e);
    }
}

/// Stop this core for good
pub fn halt() -> ! {
    loop {
        #[cfg(target_arch = "aarch64")]
        aarch64_cpu::asm::wfe();
        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}

/// Console and power control used before the descriptor names the real
/// ones
#[derive(Clone, Copy)]
pub struct EarlyPlatform {
    pub console: &'static dyn ConsoleDevice,
    pub power: &'static dyn PowerControl,
}

/// Primary core entry on the real machine.
///
/// `hardware` builds the board's devices once the descriptor is known.
///
/// # Safety
///
/// `blob` must point at the descriptor the loader handed over, readable
/// for the size its header declares (at most [`DESCRIPTOR_MAX_SIZE`]).
pub unsafe fn kernel_main<'a>(
    blob: *const u8,
    core_id: u32,
    early: EarlyPlatform,
    hardware: impl FnOnce(&PlatformDescriptor) -> BootHardware<'a>,
) -> ! {
    // SAFETY: forwarded from the caller.
    let descriptor = match unsafe { axon_pal::descriptor::resolve_raw(blob, DESCRIPTOR_MAX_SIZE) } {
        Ok(d) => d,
        Err(e) => {
            report_fatal(early.console, early.power, &BootError::from(e));
            halt()
        }
    };

    let hw = hardware(&descriptor);
    let (console, power) = (hw.console, hw.power);
    match boot_with(descriptor, CoreId::new(core_id), hw) {
        Ok(system) => {
            log::info!("boot: complete");
            loop {
                system.poll();
                system.services.relax();
            }
        }
        Err(e) => {
            report_fatal(console, power, &e);
            halt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceHandle, DeviceResources, DriverState, InitError};
    use crate::smp::{CorePhase, SecondaryInit};
    use crate::testing::{
        self, MOCK_CAPS, MockAccelerator, MockConsole, MockCounter, MockCpuFirmware, MockPower, TEST_FREQUENCY,
    };
    use axon_common::{MAX_CPUS, VirtAddr};
    use axon_pal::descriptor::builder::{reference_device_tree, reference_firmware_table};
    use axon_pal::psci::AffinityState;
    use axon_pal::PsciError;
    use spin::Once;

    struct Arch {
        fail: bool,
        calls: Vec<&'static str>,
    }

    impl ArchSupport for Arch {
        fn init_console(&mut self) {
            self.calls.push("console");
        }

        fn install_tables(&mut self, mappings: &MappingTable) -> Result<PhysAddr, BringupError> {
            self.calls.push("tables");
            assert!(!mappings.mappings().is_empty());
            if self.fail {
                return Err(BringupError::LayoutUnavailable);
            }
            Ok(PhysAddr::new(0x4_0000))
        }

        fn install_vectors(&mut self) {
            self.calls.push("vectors");
        }
    }

    struct Uart;

    impl PlatformDriver for Uart {
        fn name(&self) -> &'static str {
            "pl011"
        }

        fn compatible(&self) -> &'static [&'static str] {
            &["arm,pl011"]
        }

        fn probe(&mut self, res: &DeviceResources, _services: &PlatformServices) -> Result<DeviceHandle, InitError> {
            if res.irqs.is_empty() {
                return Err(InitError::MissingResource("interrupt"));
            }
            Ok(DeviceHandle { token: 0 })
        }

        fn start(&mut self, _handle: DeviceHandle) -> Result<(), InitError> {
            Ok(())
        }

        fn stop(&mut self, _handle: DeviceHandle) {}
    }

    fn no_release(_va: VirtAddr, _entry: PhysAddr) {}

    fn stacks() -> Vec<InitialStack> {
        (0..MAX_CPUS as u64)
            .map(|i| {
                InitialStack::new(
                    PhysAddr::new(0x200_0000 + i * 0x1_0000),
                    VirtAddr::new(0xFFFF_8000_0201_0000 + i * 0x1_0000),
                )
            })
            .collect()
    }

    fn hardware<'a>(
        arch: &'a mut Arch,
        firmware: &'static dyn CpuFirmware,
        accelerator: Option<&'static dyn AcceleratorDevice>,
    ) -> (BootHardware<'a>, &'static MockConsole, &'static MockPower) {
        let console = testing::leak(MockConsole::new());
        let power = testing::leak(MockPower::default());
        let hw = BootHardware {
            console,
            counter: testing::leak(MockCounter::new(TEST_FREQUENCY)),
            power,
            firmware,
            release: no_release,
            boot_args: testing::leak(BootArgsTable::new()),
            boot_args_phys: PhysAddr::new(0x30_0000),
            arch,
            image: testing::reference_image(),
            secondary_entry: PhysAddr::new(0x8_1000),
            stacks: stacks(),
            accelerator,
            drivers: alloc::vec![Box::new(Uart) as Box<dyn PlatformDriver>],
            on_bringup: None,
        };
        (hw, console, power)
    }

    /// Firmware that runs the secondary entry path inline, like a core
    /// that comes straight up
    struct InlineFirmware;

    static INLINE_COORDINATOR: Once<&'static BringupCoordinator> = Once::new();

    fn remember_coordinator(c: &'static BringupCoordinator) {
        INLINE_COORDINATOR.call_once(|| c);
    }

    struct Secondary;

    impl SecondaryInit for Secondary {
        fn enable_layout(&mut self, _core: CoreId, layout: &PublishedLayout) {
            assert_eq!(layout.translation_root, PhysAddr::new(0x4_0000));
        }

        fn install_vectors(&mut self, _core: CoreId) {}
    }

    impl CpuFirmware for InlineFirmware {
        fn cpu_on(&self, mpidr: u64, _entry: PhysAddr, _context: u64) -> Result<(), PsciError> {
            let coord = INLINE_COORDINATOR.get().ok_or(PsciError::Denied)?;
            let core = coord
                .cores()
                .into_iter()
                .find(|c| c.mpidr == mpidr)
                .ok_or(PsciError::NotPresent)?;
            coord
                .secondary_entry(core.core_id, &mut Secondary)
                .map_err(|_| PsciError::InternalFailure)
        }

        fn affinity_info(&self, _mpidr: u64) -> Result<AffinityState, PsciError> {
            Ok(AffinityState::On)
        }
    }

    #[test]
    fn test_boot_reference_board() {
        let mut arch = Arch {
            fail: false,
            calls: Vec::new(),
        };
        let npu = testing::leak(MockAccelerator::new(MOCK_CAPS));
        let (mut hw, _console, power) = hardware(&mut arch, &InlineFirmware, Some(npu));
        hw.on_bringup = Some(remember_coordinator);

        let mut system = boot_primary(&reference_device_tree(), 0, hw).unwrap();

        assert_eq!(system.bringup.running.len(), 4);
        assert!(system.bringup.failed.is_empty());
        assert_eq!(system.coordinator.phase(CoreId::new(0)), Some(CorePhase::Running));
        assert_eq!(system.config.npu_queue_depth, 8);
        assert_eq!(system.config.log_level, log::LevelFilter::Info);
        assert_eq!(system.drivers.state_of("uart@40000000"), Some(DriverState::Running));

        let pipeline = system.accelerator.unwrap();
        assert_eq!(pipeline.handle().unwrap().generation, 1);
        assert!(system.services.dispatch_irq(142));

        system.poll();
        assert_eq!(system.shutdown(), Err(PsciError::Denied));
        assert_eq!(power.off_requests(), 1);
        assert_eq!(system.drivers.state_of("uart@40000000"), Some(DriverState::Stopped));
        assert_eq!(arch.calls, ["console", "tables", "vectors"]);
    }

    #[test]
    fn test_silent_secondaries_are_excluded() {
        let mut arch = Arch {
            fail: false,
            calls: Vec::new(),
        };
        let firmware = testing::leak(MockCpuFirmware::default());
        firmware.fail(3, PsciError::NotPresent);
        let (hw, _console, _power) = hardware(&mut arch, firmware, None);

        let system = boot_primary(&reference_firmware_table(), 0, hw).unwrap();
        assert_eq!(system.bringup.running, [CoreId::new(0)]);
        assert_eq!(system.bringup.failed.len(), 3);
        assert_eq!(system.coordinator.online_cores(), [CoreId::new(0)]);
        assert!(system.accelerator.is_none());

        // PSCI context points into the boot argument table
        let calls = firmware.calls();
        assert!(calls.iter().all(|&(_, entry, _)| entry == PhysAddr::new(0x8_1000)));
        assert!(calls.iter().all(|&(_, _, ctx)| ctx >= 0x30_0000));
    }

    #[test]
    fn test_accelerator_absence_is_not_fatal() {
        let mut arch = Arch {
            fail: false,
            calls: Vec::new(),
        };
        let firmware = testing::leak(MockCpuFirmware::default());
        let npu = testing::leak(MockAccelerator::absent());
        let (hw, _, _) = hardware(&mut arch, firmware, Some(npu));
        let system = boot_primary(&reference_device_tree(), 0, hw).unwrap();
        assert!(system.accelerator.is_none());

        let mut arch = Arch {
            fail: false,
            calls: Vec::new(),
        };
        let broken = testing::leak(MockAccelerator::new(MOCK_CAPS));
        broken.set_reset_fails(true);
        let (hw, _, _) = hardware(&mut arch, firmware, Some(broken));
        let system = boot_primary(&reference_device_tree(), 0, hw).unwrap();
        let pipeline = system.accelerator.unwrap();
        assert!(pipeline.handle().is_none());

        broken.set_reset_fails(false);
        assert!(pipeline.init_accelerator(system.config.accelerator()).is_ok());
    }

    #[test]
    fn test_boot_errors() {
        let firmware = testing::leak(MockCpuFirmware::default());

        let mut arch = Arch {
            fail: false,
            calls: Vec::new(),
        };
        let (hw, _, _) = hardware(&mut arch, firmware, None);
        assert_eq!(
            boot_primary(b"not a descriptor", 0, hw).err(),
            Some(BootError::Descriptor(MalformedDescriptor::UnknownFormat))
        );

        let mut arch = Arch {
            fail: false,
            calls: Vec::new(),
        };
        let (hw, _, _) = hardware(&mut arch, firmware, None);
        assert_eq!(
            boot_primary(&reference_device_tree(), 7, hw).err(),
            Some(BootError::Bringup(BringupError::UnknownCore(CoreId::new(7))))
        );

        let mut arch = Arch {
            fail: true,
            calls: Vec::new(),
        };
        let (hw, _, _) = hardware(&mut arch, firmware, None);
        assert_eq!(
            boot_primary(&reference_device_tree(), 0, hw).err(),
            Some(BootError::Bringup(BringupError::LayoutUnavailable))
        );
        assert!(firmware.calls().is_empty());
    }

    #[test]
    fn test_fatal_report() {
        let console = MockConsole::new();
        let power = MockPower::default();
        let err = BootError::Descriptor(MalformedDescriptor::UnknownFormat);
        report_fatal(&console, &power, &err);

        let out = console.output();
        assert!(out.starts_with("axon: fatal boot error: descriptor: unrecognised descriptor format\n"));
        assert!(out.contains("power off failed"));
        assert_eq!(power.off_requests(), 1);
    }
}
