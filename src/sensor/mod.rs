//! Sensor abstraction.
//!
//! A [`Sensor`] is the device-facing half of a camera: it answers a ping
//! when a session opens, fills frame buffers during capture and handles
//! vendor extended commands. Timing (exposure, readout, triggers) is driven
//! by the acquisition engine; the sensor only produces pixels.

pub mod simulated;

pub use simulated::{SimulatedSensor, TestPattern};

use crate::error::DcamError;
use crate::extended::{ExtendedCommand, ExtendedResponse};
use crate::property::FrameGeometry;
use thiserror::Error;

/// Failure reported by a sensor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorFault {
    /// The current capture is lost; the session survives.
    #[error("sensor fault: {0}")]
    Transient(String),
    /// The device is gone; the session cannot continue.
    #[error("fatal sensor fault: {0}")]
    Fatal(String),
    /// The sensor does not implement the request.
    #[error("unsupported by sensor: {0}")]
    Unsupported(String),
}

impl SensorFault {
    /// Whether the session must move to its error state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SensorFault::Fatal(_))
    }
}

impl From<SensorFault> for DcamError {
    fn from(fault: SensorFault) -> Self {
        match fault {
            SensorFault::Unsupported(_) => DcamError::NotSupported(fault.to_string()),
            SensorFault::Transient(_) | SensorFault::Fatal(_) => {
                DcamError::Device(fault.to_string())
            }
        }
    }
}

/// Per-frame parameters handed to [`Sensor::expose`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureContext {
    /// Capture sequence number of the frame being produced.
    pub sequence: u64,
    /// Exposure in seconds.
    pub exposure_s: f64,
    /// Format of the buffer to fill.
    pub geometry: FrameGeometry,
}

/// Device-facing side of a camera.
pub trait Sensor: Send + Sync {
    /// Check that the device answers. Called once per `open`.
    fn ping(&self) -> Result<(), SensorFault>;

    /// Fill `frame` (exactly `geometry.frame_bytes` long, rows
    /// `geometry.row_bytes` apart) with one image.
    fn expose(&self, ctx: &ExposureContext, frame: &mut [u8]) -> Result<(), SensorFault>;

    /// Exposure the device would pick next when auto-exposure is on.
    /// `None` leaves the current value alone.
    fn suggest_exposure(&self, _current_s: f64) -> Option<f64> {
        None
    }

    fn extended(&self, command: &ExtendedCommand) -> Result<ExtendedResponse, SensorFault> {
        Err(SensorFault::Unsupported(format!(
            "extended command 0x{:04X}",
            command.command_id()
        )))
    }
}
