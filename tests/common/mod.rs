//! Common test utilities for dcam_control integration tests
//!
//! This module provides:
//! - Small simulated devices so rings stay cheap
//! - A scriptable sensor for fault injection
//! - A bounded poll for state changes made by the capture thread

#![allow(dead_code)] // Utilities may not all be used by every test binary

use dcam_control::config::AcquisitionConfig;
use dcam_control::{
    CaptureState, Dcam, DcamResult, DeviceConfig, DeviceRegistry, ExposureContext, ExtendedCommand,
    ExtendedResponse, PropertyId, Sensor, SensorFault, SessionHandle, SimulatedSensor, Status,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exposure short enough that waits never time out.
pub const FAST_EXPOSURE_S: f64 = 0.002;

/// Generous wait timeout for CI machines.
pub const WAIT: Duration = Duration::from_secs(2);

/// 64x32 sensor, 12-bit, no readout delay.
pub fn small_device(serial: &str) -> DeviceConfig {
    let mut device = DeviceConfig::simulated("C-SIM-64", serial, 64, 32);
    device.readout_ms = 0.0;
    device
}

pub fn acquisition_config(max_pool_bytes: usize) -> AcquisitionConfig {
    AcquisitionConfig {
        max_pool_bytes,
        default_wait_timeout_ms: 1_000,
        writer_poll_ms: 2,
    }
}

/// Two small simulated devices.
pub fn dcam() -> Dcam {
    dcam_with_budget(16 * 1024 * 1024)
}

pub fn dcam_with_budget(max_pool_bytes: usize) -> Dcam {
    let devices = [small_device("S/N: T0"), small_device("S/N: T1")];
    Dcam::with_registry(
        DeviceRegistry::from_config(&devices),
        &acquisition_config(max_pool_bytes),
    )
}

/// Open `index` with a fast exposure already set.
pub fn open_fast(dcam: &Dcam, index: usize) -> SessionHandle {
    let cam = dcam.open(index).expect("open should succeed");
    dcam.set_value(cam, PropertyId::EXPOSURE_TIME, FAST_EXPOSURE_S)
        .expect("exposure should be settable");
    cam
}

/// Poll until the capture state is `state` or the timeout expires.
pub fn wait_for_state(dcam: &Dcam, cam: SessionHandle, state: CaptureState) -> DcamResult<bool> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if dcam.capture_state(cam)? == state {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(false)
}

/// Poll until the status word is `status`, checking every observed value
/// with `allowed` on the way.
pub fn wait_for_status(
    dcam: &Dcam,
    cam: SessionHandle,
    status: Status,
    allowed: &[Status],
) -> DcamResult<bool> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        let seen = dcam.status(cam)?;
        if seen == status {
            return Ok(true);
        }
        assert!(allowed.contains(&seen), "unexpected status {seen:?}");
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(false)
}

/// What a [`ScriptedSensor`] does on a given frame.
#[derive(Debug, Clone)]
pub enum Script {
    /// Always produce frames.
    Healthy,
    /// Fail with this fault once `after` frames have been produced.
    FailAfter { after: u64, fault: SensorFault },
}

/// Sensor wrapping [`SimulatedSensor`] with injectable faults.
pub struct ScriptedSensor {
    inner: SimulatedSensor,
    script: Mutex<Script>,
    ping_fault: Option<SensorFault>,
    exposed: AtomicU64,
}

impl ScriptedSensor {
    pub fn new(device: &DeviceConfig, script: Script) -> Self {
        Self {
            inner: SimulatedSensor::new(device),
            script: Mutex::new(script),
            ping_fault: None,
            exposed: AtomicU64::new(0),
        }
    }

    pub fn unreachable(device: &DeviceConfig) -> Self {
        Self {
            ping_fault: Some(SensorFault::Fatal("no answer on bus".into())),
            ..Self::new(device, Script::Healthy)
        }
    }

    pub fn exposed(&self) -> u64 {
        self.exposed.load(Ordering::Acquire)
    }
}

impl Sensor for ScriptedSensor {
    fn ping(&self) -> Result<(), SensorFault> {
        match &self.ping_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    fn expose(&self, ctx: &ExposureContext, frame: &mut [u8]) -> Result<(), SensorFault> {
        if let Script::FailAfter { after, fault } = &*self.script.lock() {
            if self.exposed() >= *after {
                return Err(fault.clone());
            }
        }
        self.inner.expose(ctx, frame)?;
        self.exposed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn suggest_exposure(&self, current_s: f64) -> Option<f64> {
        self.inner.suggest_exposure(current_s)
    }

    fn extended(&self, command: &ExtendedCommand) -> Result<ExtendedResponse, SensorFault> {
        match command {
            ExtendedCommand::Raw { id: 0xDEAD, .. } => {
                Err(SensorFault::Fatal("firmware crashed".into()))
            }
            other => self.inner.extended(other),
        }
    }
}

/// Registry with a single device backed by `sensor`.
pub fn dcam_with_sensor(device: DeviceConfig, sensor: Arc<dyn Sensor>) -> Dcam {
    let registry = DeviceRegistry::builder().device(device, sensor).build();
    Dcam::with_registry(registry, &acquisition_config(16 * 1024 * 1024))
}
