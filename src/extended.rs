//! Typed vendor extended commands.
//!
//! Each command carries a vendor command ID. Known commands have their own
//! variants; anything else goes through [`ExtendedCommand::Raw`] and is up
//! to the sensor to accept or reject.

use serde::Serialize;

/// Command ID of [`ExtendedCommand::SensorTemperature`].
pub const CMD_SENSOR_TEMPERATURE: u32 = 0x0100;
/// Command ID of [`ExtendedCommand::SetCooler`].
pub const CMD_SET_COOLER: u32 = 0x0101;
/// Command ID of [`ExtendedCommand::FrameCounter`].
pub const CMD_FRAME_COUNTER: u32 = 0x0200;
/// Command ID of [`ExtendedCommand::ResetFrameCounter`].
pub const CMD_RESET_FRAME_COUNTER: u32 = 0x0201;

/// Vendor extended command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedCommand {
    /// Read the sensor temperature in degrees Celsius.
    SensorTemperature,
    /// Switch the sensor cooler on or off.
    SetCooler(bool),
    /// Read the hardware frame counter.
    FrameCounter,
    /// Zero the hardware frame counter.
    ResetFrameCounter,
    /// Vendor command not modelled above.
    Raw {
        /// Vendor command ID.
        id: u32,
        /// Command arguments as sent to the device.
        payload: Vec<u8>,
    },
}

impl ExtendedCommand {
    /// Vendor command ID.
    #[must_use]
    pub fn command_id(&self) -> u32 {
        match self {
            Self::SensorTemperature => CMD_SENSOR_TEMPERATURE,
            Self::SetCooler(_) => CMD_SET_COOLER,
            Self::FrameCounter => CMD_FRAME_COUNTER,
            Self::ResetFrameCounter => CMD_RESET_FRAME_COUNTER,
            Self::Raw { id, .. } => *id,
        }
    }
}

/// Reply to an [`ExtendedCommand`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedResponse {
    /// Degrees Celsius.
    Temperature(f64),
    /// Hardware frame counter.
    Counter(u64),
    /// Command accepted, no payload.
    Ack,
    /// Uninterpreted vendor payload.
    Raw(Vec<u8>),
}
