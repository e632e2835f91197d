//! Driver lifecycle
//!
//! Peripheral drivers (power, clock, storage, USB, PCIe) plug in through
//! [`PlatformDriver`]. The registry matches them to the MMIO windows in the
//! hardware descriptor by compatible string and drives `probe -> start`,
//! then `stop` in reverse order before power-off.
//!
//! The platform layer only hands out address and interrupt resources; it
//! knows nothing about what a driver does with them. A driver that fails
//! to probe is logged and left out, it never aborts boot.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use axon_common::VirtAddr;
use axon_pal::descriptor::DeviceWindow;

use crate::services::PlatformServices;

/// What a driver gets to work with
#[derive(Debug, Clone)]
pub struct DeviceResources {
    pub window: DeviceWindow,
    /// Register window through the device mapping
    pub mmio: VirtAddr,
    pub irqs: Vec<u32>,
}

/// Opaque per-device token chosen by the driver at probe time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    pub token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "driver init errors must be handled"]
pub enum InitError {
    /// Nothing answered at the window (ID registers read back wrong)
    NoDevice,
    /// A resource the driver needs is missing from the descriptor
    MissingResource(&'static str),
    /// The device did not become ready in time
    Timeout,
    /// Device-specific failure code
    Hardware(u32),
    /// The register window is not mapped
    NotMapped,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => f.write_str("no device"),
            Self::MissingResource(what) => write!(f, "missing {}", what),
            Self::Timeout => f.write_str("timed out"),
            Self::Hardware(code) => write!(f, "hardware error {:#x}", code),
            Self::NotMapped => f.write_str("register window not mapped"),
        }
    }
}

/// A peripheral driver.
pub trait PlatformDriver: Send {
    fn name(&self) -> &'static str;

    /// Compatible strings this driver binds to
    fn compatible(&self) -> &'static [&'static str];

    /// Check the device is there and claim it.
    fn probe(&mut self, resources: &DeviceResources, services: &PlatformServices) -> Result<DeviceHandle, InitError>;

    fn start(&mut self, handle: DeviceHandle) -> Result<(), InitError>;

    fn stop(&mut self, handle: DeviceHandle);
}

/// Lifecycle state of one window's binding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverState {
    /// No driver matched the window
    Unbound = 0,
    Probed = 1,
    Running = 2,
    Stopped = 3,
    /// Probe or start failed
    Failed = 4,
}

/// One descriptor window and the driver bound to it
#[derive(Debug, Clone)]
pub struct Binding {
    /// Window name from the descriptor, e.g. `uart@40000000`
    pub window: String,
    pub driver: Option<&'static str>,
    pub state: DriverState,
    pub error: Option<InitError>,
    driver_idx: Option<usize>,
    handle: Option<DeviceHandle>,
}

/// Counts from [`DriverRegistry::bind_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindSummary {
    pub running: usize,
    pub failed: usize,
    pub unbound: usize,
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Box<dyn PlatformDriver>>,
    bindings: Vec<Binding>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Box<dyn PlatformDriver>) {
        log::debug!("driver: registered {}", driver.name());
        self.drivers.push(driver);
    }

    fn driver_for(&self, compatible: &str) -> Option<usize> {
        if compatible.is_empty() {
            return None;
        }
        self.drivers
            .iter()
            .position(|d| d.compatible().contains(&compatible))
    }

    /// Match every descriptor window to a driver and bring it up.
    pub fn bind_all(&mut self, services: &PlatformServices) -> BindSummary {
        let mut summary = BindSummary::default();

        for window in services.mmio_windows() {
            if self.bindings.iter().any(|b| b.window == window.name) {
                continue;
            }
            let mut binding = Binding {
                window: window.name.clone(),
                driver: None,
                state: DriverState::Unbound,
                error: None,
                driver_idx: None,
                handle: None,
            };

            let Some(idx) = self.driver_for(&window.compatible) else {
                summary.unbound += 1;
                self.bindings.push(binding);
                continue;
            };
            let driver = &mut self.drivers[idx];
            binding.driver = Some(driver.name());
            binding.driver_idx = Some(idx);

            match Self::bring_up(driver.as_mut(), window, services) {
                Ok(handle) => {
                    log::info!("driver: {} running on {}", driver.name(), window.name);
                    binding.handle = Some(handle);
                    binding.state = DriverState::Running;
                    summary.running += 1;
                }
                Err((state, handle, e)) => {
                    log::warn!("driver: {} on {}: {}", driver.name(), window.name, e);
                    binding.handle = handle;
                    binding.state = state;
                    binding.error = Some(e);
                    summary.failed += 1;
                }
            }
            self.bindings.push(binding);
        }

        summary
    }

    fn bring_up(
        driver: &mut dyn PlatformDriver,
        window: &DeviceWindow,
        services: &PlatformServices,
    ) -> Result<DeviceHandle, (DriverState, Option<DeviceHandle>, InitError)> {
        let mmio = services
            .window_virt(window)
            .map_err(|_| (DriverState::Failed, None, InitError::NotMapped))?;
        let resources = DeviceResources {
            window: window.clone(),
            mmio,
            irqs: window.irqs.clone(),
        };
        let handle = driver
            .probe(&resources, services)
            .map_err(|e| (DriverState::Failed, None, e))?;
        driver
            .start(handle)
            .map_err(|e| (DriverState::Failed, Some(handle), e))?;
        Ok(handle)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn state_of(&self, window: &str) -> Option<DriverState> {
        self.bindings.iter().find(|b| b.window == window).map(|b| b.state)
    }

    /// Stop every running driver, last started first.
    pub fn stop_all(&mut self) {
        for binding in self.bindings.iter_mut().rev() {
            if binding.state != DriverState::Running {
                continue;
            }
            if let (Some(idx), Some(handle)) = (binding.driver_idx, binding.handle)
                && let Some(driver) = self.drivers.get_mut(idx)
            {
                driver.stop(handle);
                log::debug!("driver: stopped {} on {}", driver.name(), binding.window);
            }
            binding.state = DriverState::Stopped;
        }
    }
}
