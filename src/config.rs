//! Configuration using Figment
//!
//! Settings are layered from:
//! 1. Built-in defaults (two simulated cameras)
//! 2. A TOML file (`dcam.toml` unless another path is given)
//! 3. Environment variables prefixed with `DCAM_`, `__` separating levels
//!
//! ```text
//! DCAM_APPLICATION__LOG_LEVEL=debug
//! DCAM_ACQUISITION__MAX_POOL_BYTES=268435456
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "flowcell imager"
//! log_level = "info"
//!
//! [acquisition]
//! max_pool_bytes = 536870912
//! default_wait_timeout_ms = 1000
//!
//! [[devices]]
//! model = "C-SIM-4096"
//! serial = "S/N: 000001"
//! width = 4096
//! height = 2048
//! bit_depth = 12
//! readout_ms = 5.0
//! capabilities = ["software_trigger", "binning", "subarray", "lut"]
//! ```

use crate::capability::Capability;
use crate::sensor::TestPattern;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dcam.toml";

/// Smallest sensor height accepted, one TDI line bundle.
pub const MIN_SENSOR_ROWS: u32 = 8;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "DCAM_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or parsed.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values parsed but are inconsistent.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Buffer and wait tuning
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Device table, in enumeration order
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Acquisition tuning shared by all sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    /// Upper bound on bytes held by all allocated frame rings together
    #[serde(default = "default_max_pool_bytes")]
    pub max_pool_bytes: usize,
    /// Wait timeout used by the CLI when none is given
    #[serde(default = "default_wait_timeout_ms")]
    pub default_wait_timeout_ms: u64,
    /// How long the writer waits on a locked slot before re-checking for stop
    #[serde(default = "default_writer_poll_ms")]
    pub writer_poll_ms: u64,
}

/// One camera in the device table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Model name reported by enumeration
    pub model: String,
    /// Serial number string
    pub serial: String,
    /// Vendor name
    #[serde(default = "default_vendor")]
    pub vendor: String,
    /// Bus interfaces the device is reachable over
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,
    /// Full sensor width in pixels
    pub width: u32,
    /// Full sensor height in pixels
    pub height: u32,
    /// Native bits per pixel
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u32,
    /// Full-frame readout time in milliseconds
    #[serde(default = "default_readout_ms")]
    pub readout_ms: f64,
    /// Optional features of this device
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    /// Whether the device answers when opened
    #[serde(default = "default_reachable")]
    pub reachable: bool,
    /// Image content produced by the simulated sensor
    #[serde(default)]
    pub pattern: TestPattern,
    /// Exposure the simulated auto-exposure converges to, in seconds
    #[serde(default = "default_auto_exposure_target")]
    pub auto_exposure_target_s: f64,
}

fn default_max_pool_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_wait_timeout_ms() -> u64 {
    1_000
}

fn default_writer_poll_ms() -> u64 {
    10
}

fn default_vendor() -> String {
    "Simulated".to_string()
}

fn default_interfaces() -> Vec<String> {
    vec!["usb3".to_string()]
}

fn default_bit_depth() -> u32 {
    12
}

fn default_readout_ms() -> f64 {
    1.0
}

fn default_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

fn default_reachable() -> bool {
    true
}

fn default_auto_exposure_target() -> f64 {
    0.005
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_pool_bytes: default_max_pool_bytes(),
            default_wait_timeout_ms: default_wait_timeout_ms(),
            writer_poll_ms: default_writer_poll_ms(),
        }
    }
}

impl DeviceConfig {
    /// A simulated camera with every capability and default timing.
    #[must_use]
    pub fn simulated(model: &str, serial: &str, width: u32, height: u32) -> Self {
        Self {
            model: model.to_string(),
            serial: serial.to_string(),
            vendor: default_vendor(),
            interfaces: default_interfaces(),
            width,
            height,
            bit_depth: default_bit_depth(),
            readout_ms: default_readout_ms(),
            capabilities: default_capabilities(),
            reachable: true,
            pattern: TestPattern::default(),
            auto_exposure_target_s: default_auto_exposure_target(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "dcam".to_string(),
                log_level: "info".to_string(),
            },
            acquisition: AcquisitionConfig::default(),
            devices: vec![
                DeviceConfig::simulated("C-SIM-4096", "S/N: 000001", 4096, 2048),
                DeviceConfig::simulated("C-SIM-4096", "S/N: 000002", 4096, 2048),
            ],
        }
    }
}

impl Settings {
    /// Load from `dcam.toml` in the working directory (if present) and the
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from the given TOML file (if present) and the environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Extract and validate settings from a prepared figment.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Reject configurations that parse but cannot describe a working
    /// device table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                LEVELS.join(", ")
            )));
        }

        if self.acquisition.max_pool_bytes == 0 {
            return Err(ConfigError::Validation(
                "acquisition.max_pool_bytes must be greater than 0".to_string(),
            ));
        }
        if self.acquisition.writer_poll_ms == 0 {
            return Err(ConfigError::Validation(
                "acquisition.writer_poll_ms must be greater than 0".to_string(),
            ));
        }

        if self.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        let mut serials = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.width == 0 || device.height == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device {index} ({}) has zero sensor dimensions",
                    device.model
                )));
            }
            if device.height < MIN_SENSOR_ROWS {
                return Err(ConfigError::Validation(format!(
                    "Device {index} ({}) needs at least {MIN_SENSOR_ROWS} sensor rows, got {}",
                    device.model, device.height
                )));
            }
            if device.width % 4 != 0 || device.height % 4 != 0 {
                return Err(ConfigError::Validation(format!(
                    "Device {index} ({}) dimensions must be multiples of 4",
                    device.model
                )));
            }
            if !(8..=16).contains(&device.bit_depth) {
                return Err(ConfigError::Validation(format!(
                    "Device {index} ({}) bit depth {} outside 8..=16",
                    device.model, device.bit_depth
                )));
            }
            if !(device.readout_ms >= 0.0 && device.readout_ms.is_finite()) {
                return Err(ConfigError::Validation(format!(
                    "Device {index} ({}) readout time must be non-negative",
                    device.model
                )));
            }
            if !serials.insert(device.serial.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device serial '{}'",
                    device.serial
                )));
            }
        }

        Ok(())
    }
}
