//! Process-wide device table.
//!
//! Built once by `Dcam::init` from configuration and torn down by
//! `Dcam::shutdown`. Each entry pairs a device description with the sensor
//! behind it and an ownership flag, so at most one session holds a device.

use crate::capability::CapabilitySet;
use crate::config::DeviceConfig;
use crate::error::{DcamError, DcamResult};
use crate::sensor::{Sensor, SimulatedSensor};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Driver version string reported for every device.
pub const DRIVER_VERSION: &str = concat!("dcam-control ", env!("CARGO_PKG_VERSION"));

/// Descriptive strings for one device, available without opening it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Position in the registry.
    pub index: usize,
    /// Camera model name.
    pub model: String,
    /// Serial number string, e.g. `S/N: 000001`.
    pub serial: String,
    /// Manufacturer name.
    pub vendor: String,
    /// Bus interfaces the device is reachable through.
    pub interfaces: Vec<String>,
    /// Version string of this driver.
    pub driver_version: String,
}

pub(crate) struct DeviceEntry {
    pub(crate) config: DeviceConfig,
    pub(crate) capabilities: CapabilitySet,
    pub(crate) sensor: Arc<dyn Sensor>,
    claimed: AtomicBool,
}

impl DeviceEntry {
    fn info(&self, index: usize) -> DeviceInfo {
        DeviceInfo {
            index,
            model: self.config.model.clone(),
            serial: self.config.serial.clone(),
            vendor: self.config.vendor.clone(),
            interfaces: self.config.interfaces.clone(),
            driver_version: DRIVER_VERSION.to_string(),
        }
    }
}

/// Ordered device table.
pub struct DeviceRegistry {
    devices: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    /// Registry of simulated sensors, one per configured device.
    #[must_use]
    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        devices
            .iter()
            .fold(Self::builder(), |builder, device| {
                builder.device(device.clone(), Arc::new(SimulatedSensor::new(device)))
            })
            .build()
    }

    /// Registry with custom sensors, one device at a time.
    #[must_use]
    pub fn builder() -> DeviceRegistryBuilder {
        DeviceRegistryBuilder { devices: Vec::new() }
    }

    /// Number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Descriptive strings of the device at `index`.
    pub fn info(&self, index: usize) -> DcamResult<DeviceInfo> {
        Ok(self.entry(index)?.info(index))
    }

    pub(crate) fn entry(&self, index: usize) -> DcamResult<&DeviceEntry> {
        self.devices.get(index).ok_or_else(|| {
            DcamError::InvalidHandle(format!(
                "device index {index} out of range ({} devices)",
                self.devices.len()
            ))
        })
    }

    /// Mark a device owned. Fails with `Busy` if another session holds it.
    pub(crate) fn claim(&self, index: usize) -> DcamResult<&DeviceEntry> {
        let entry = self.entry(index)?;
        entry
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DcamError::Busy(format!("device {index} is owned by another session")))?;
        Ok(entry)
    }

    pub(crate) fn release(&self, index: usize) {
        if let Some(entry) = self.devices.get(index) {
            entry.claimed.store(false, Ordering::Release);
        }
    }
}

/// Builds a registry from explicit sensors.
pub struct DeviceRegistryBuilder {
    devices: Vec<DeviceEntry>,
}

impl DeviceRegistryBuilder {
    /// Append a device backed by `sensor`. Capabilities come from
    /// `config.capabilities`.
    #[must_use]
    pub fn device(mut self, config: DeviceConfig, sensor: Arc<dyn Sensor>) -> Self {
        let capabilities = config.capabilities.iter().copied().collect();
        self.devices.push(DeviceEntry {
            config,
            capabilities,
            sensor,
            claimed: AtomicBool::new(false),
        });
        self
    }

    /// Finish the registry; device indices follow insertion order.
    #[must_use]
    pub fn build(self) -> DeviceRegistry {
        DeviceRegistry { devices: self.devices }
    }
}
