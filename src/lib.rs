//! Camera control core modelled on the DCAM API.
//!
//! A caller opens a session on one camera, configures it through its
//! property store, then drives acquisition: allocate buffers, start
//! capture, wait for and lock frames, stop, free, close.
//!
//! ```no_run
//! use dcam_control::{CancelToken, CaptureMode, Dcam, PropertyId, Settings};
//! use std::time::Duration;
//!
//! # async fn demo() -> dcam_control::DcamResult<()> {
//! let dcam = Dcam::init(&Settings::default());
//! let cam = dcam.open(0)?;
//! dcam.set_value(cam, PropertyId::EXPOSURE_TIME, 0.005)?;
//! dcam.allocate_buffers(cam, 4)?;
//! dcam.start_capture(cam, CaptureMode::Sequence)?;
//!
//! let frame = dcam
//!     .wait_for_frame(cam, Duration::from_secs(1), &CancelToken::new())
//!     .await?;
//! let lock = dcam.lock_frame(cam, frame.slot)?;
//! println!("frame {} has {} bytes", lock.sequence(), lock.data().len());
//! dcam.unlock_frame(cam, lock)?;
//!
//! dcam.stop_capture(cam)?;
//! dcam.free_buffers(cam)?;
//! dcam.close(cam)?;
//! dcam.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod capability;
pub mod config;
pub mod dcam;
pub mod error;
pub mod extended;
pub mod group;
pub mod logging;
pub mod lut;
pub mod property;
pub mod registry;
pub mod sensor;
pub mod session;

pub use acquisition::{
    CancelToken, CaptureMode, CaptureState, FrameIndex, FrameLock, Status, TransferInfo,
};
pub use capability::{Capability, CapabilitySet};
pub use config::{DeviceConfig, Settings};
pub use dcam::{Dcam, PropertyIds};
pub use error::{DcamError, DcamResult, ErrorKind};
pub use extended::{ExtendedCommand, ExtendedResponse};
pub use group::SessionPair;
pub use property::{FrameGeometry, Preset, PropertyAttr, PropertyId, ValueKind};
pub use registry::{DeviceInfo, DeviceRegistry};
pub use sensor::{ExposureContext, Sensor, SensorFault, SimulatedSensor, TestPattern};
pub use session::{SessionHandle, SessionState};
