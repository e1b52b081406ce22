//! Simulated camera sensor
//!
//! Produces synthetic images so every code path above the sensor can run
//! without hardware:
//! - Configurable test pattern (gradient, flat field, noise)
//! - Pixel values clipped to the configured bit depth
//! - Auto-exposure that converges toward a target exposure
//! - Cooler, temperature and hardware frame counter for extended commands

use super::{ExposureContext, Sensor, SensorFault};
use crate::config::DeviceConfig;
use crate::extended::{ExtendedCommand, ExtendedResponse};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Image content of a simulated sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPattern {
    /// Diagonal ramp that shifts by one pixel per frame.
    #[default]
    Gradient,
    /// Every pixel at half scale.
    Flat,
    /// Uniform random noise.
    Noise,
}

const AMBIENT_C: f64 = 25.0;
const COOLED_C: f64 = -20.0;

#[derive(Debug)]
struct SimState {
    temperature_c: f64,
    cooler_on: bool,
    frame_counter: u64,
}

/// Sensor model backing devices declared in configuration.
#[derive(Debug)]
pub struct SimulatedSensor {
    model: String,
    reachable: bool,
    pattern: TestPattern,
    auto_exposure_target_s: f64,
    state: Mutex<SimState>,
}

impl SimulatedSensor {
    /// Sensor producing `device.pattern` frames.
    #[must_use]
    pub fn new(device: &DeviceConfig) -> Self {
        Self {
            model: device.model.clone(),
            reachable: device.reachable,
            pattern: device.pattern,
            auto_exposure_target_s: device.auto_exposure_target_s,
            state: Mutex::new(SimState {
                temperature_c: AMBIENT_C,
                cooler_on: false,
                frame_counter: 0,
            }),
        }
    }

    fn pixel(
        &self,
        x: usize,
        y: usize,
        ctx: &ExposureContext,
        max: u32,
        rng: &mut impl Rng,
    ) -> u32 {
        match self.pattern {
            TestPattern::Gradient => ((x + y) as u64 + ctx.sequence) as u32 & max,
            TestPattern::Flat => max / 2,
            TestPattern::Noise => rng.gen_range(0..=max),
        }
    }
}

impl Sensor for SimulatedSensor {
    fn ping(&self) -> Result<(), SensorFault> {
        if self.reachable {
            Ok(())
        } else {
            Err(SensorFault::Fatal(format!("{} does not respond", self.model)))
        }
    }

    fn expose(&self, ctx: &ExposureContext, frame: &mut [u8]) -> Result<(), SensorFault> {
        let g = ctx.geometry;
        if frame.len() < g.frame_bytes {
            return Err(SensorFault::Transient(format!(
                "frame buffer holds {} bytes, {} required",
                frame.len(),
                g.frame_bytes
            )));
        }

        let max = g.max_value();
        let mut rng = rand::thread_rng();
        for (y, row) in frame.chunks_exact_mut(g.row_bytes).take(g.height).enumerate() {
            if g.bytes_per_pixel == 1 {
                for (x, px) in row.iter_mut().enumerate() {
                    *px = self.pixel(x, y, ctx, max, &mut rng) as u8;
                }
            } else {
                for (x, px) in row.chunks_exact_mut(2).enumerate() {
                    let value = self.pixel(x, y, ctx, max, &mut rng) as u16;
                    px.copy_from_slice(&value.to_le_bytes());
                }
            }
        }

        self.state.lock().frame_counter += 1;
        Ok(())
    }

    fn suggest_exposure(&self, current_s: f64) -> Option<f64> {
        let error = self.auto_exposure_target_s - current_s;
        if error.abs() < 1e-6 {
            return None;
        }
        // Close half the gap per frame, landing exactly once close.
        if error.abs() < 1e-5 {
            Some(self.auto_exposure_target_s)
        } else {
            Some(current_s + error / 2.0)
        }
    }

    fn extended(&self, command: &ExtendedCommand) -> Result<ExtendedResponse, SensorFault> {
        let mut state = self.state.lock();
        match command {
            ExtendedCommand::SensorTemperature => {
                let setpoint = if state.cooler_on { COOLED_C } else { AMBIENT_C };
                state.temperature_c += (setpoint - state.temperature_c) / 2.0;
                Ok(ExtendedResponse::Temperature(state.temperature_c))
            }
            ExtendedCommand::SetCooler(on) => {
                debug!(model = %self.model, cooler = on, "Cooler switched");
                state.cooler_on = *on;
                Ok(ExtendedResponse::Ack)
            }
            ExtendedCommand::FrameCounter => Ok(ExtendedResponse::Counter(state.frame_counter)),
            ExtendedCommand::ResetFrameCounter => {
                state.frame_counter = 0;
                Ok(ExtendedResponse::Ack)
            }
            ExtendedCommand::Raw { id, .. } => Err(SensorFault::Unsupported(format!(
                "{} has no vendor command 0x{id:04X}",
                self.model
            ))),
        }
    }
}
