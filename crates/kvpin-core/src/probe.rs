//! Capability queries that feed registration and dispatch decisions.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::driver::AcceleratorDriver;
use crate::error::{KvpinError, Result};

/// Driver and device capability queries for the active accelerator.
pub struct CapabilityProbe {
    driver: Arc<dyn AcceleratorDriver>,
    config: DeviceConfig,
}

impl CapabilityProbe {
    pub fn new(driver: Arc<dyn AcceleratorDriver>, config: DeviceConfig) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> &Arc<dyn AcceleratorDriver> {
        &self.driver
    }

    pub fn visible_devices_env(&self) -> &str {
        &self.config.visible_devices_env
    }

    /// Device ordinal of the current execution context, as the runtime sees it.
    pub fn current_device(&self) -> Result<u32> {
        self.driver.current_device().map_err(|status| KvpinError::Driver {
            op: "get current device",
            status,
        })
    }

    /// Raw driver version string for the active device.
    pub fn driver_version(&self) -> Result<String> {
        let device = self.current_device()?;
        let version = self.driver.driver_version(device)?;
        debug!(device, version = %version, "queried driver version");
        Ok(version)
    }

    /// Physical index of the active device.
    pub fn resolve_local_device_index(&self) -> Result<u32> {
        resolve_local_device_index(self.driver.as_ref(), &self.config.visible_devices_env)
    }

    /// Per-core fast scratch memory, in bytes.
    pub fn on_chip_scratch_budget(&self) -> Result<u64> {
        let device = self.current_device()?;
        Ok(self
            .driver
            .scratch_bytes(device)
            .unwrap_or(self.config.scratch_bytes))
    }

    /// Number of vector compute cores on the active device (at least 1).
    pub fn vector_core_count(&self) -> Result<u32> {
        let device = self.current_device()?;
        let cores = self
            .driver
            .vector_core_count(device)
            .unwrap_or(self.config.vector_cores);
        Ok(cores.max(1))
    }

    /// PCIe bus id (`dddd:bb:dd.f`) of a physical device.
    pub fn pci_bus_id(&self, device: u32) -> Result<String> {
        Ok(self.driver.pci_address(device)?.to_string())
    }

    /// NUMA node the device is attached to, if the host reports a valid one.
    pub fn numa_node(&self, device: u32) -> Option<u32> {
        let bus_id = match self.pci_bus_id(device) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to read PCI bus id of device {}: {}", device, e);
                return None;
            }
        };
        let path = format!("/sys/bus/pci/devices/{}/numa_node", bus_id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let node = parse_numa_node(&contents);
                if node.is_none() {
                    warn!("no valid NUMA mapping for device {} ({})", device, contents.trim());
                }
                node
            }
            Err(e) => {
                warn!("failed to read {}: {}", path, e);
                None
            }
        }
    }
}

/// Physical index of the active device.
///
/// When `visible_env` is set, the runtime ordinal is a position in the sorted
/// visible-device list rather than a physical index.
pub fn resolve_local_device_index(driver: &dyn AcceleratorDriver, visible_env: &str) -> Result<u32> {
    let ordinal = driver.current_device().map_err(|status| KvpinError::Driver {
        op: "get current device",
        status,
    })?;
    match kvpin_common::platform::visible_devices(visible_env) {
        None => Ok(ordinal),
        Some(None) => Err(KvpinError::precondition(format!(
            "{} is not a comma-separated list of device indices",
            visible_env
        ))),
        Some(Some(list)) => remap_visible_device(ordinal, &list),
    }
}

/// Map a logical ordinal onto a visible-device list.
pub fn remap_visible_device(ordinal: u32, visible: &[u32]) -> Result<u32> {
    let mut sorted = visible.to_vec();
    sorted.sort_unstable();
    sorted.get(ordinal as usize).copied().ok_or_else(|| {
        KvpinError::precondition(format!(
            "device ordinal {} is outside the visible device list {:?}",
            ordinal, sorted
        ))
    })
}

/// Parse a sysfs `numa_node` file; negative values mean "unknown".
pub fn parse_numa_node(contents: &str) -> Option<u32> {
    contents.trim().parse::<i64>().ok().and_then(|n| u32::try_from(n).ok())
}
