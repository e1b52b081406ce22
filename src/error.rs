//! Error types for camera control.
//!
//! `DcamError` is the single error type returned by every fallible operation
//! on [`crate::Dcam`]. Each variant maps onto one [`ErrorKind`], the stable,
//! message-free classification callers match on and that a session retains
//! as its "last error".
//!
//! ## Error Kinds
//!
//! - **`InvalidHandle`**: the session handle is stale (closed) or never
//!   existed, or the device index is out of range.
//! - **`InvalidState`**: the call is not legal at this point in the capture
//!   state machine, or the session is in its error state.
//! - **`NotSupported`**: the property, capability or command is absent on
//!   this device, or the property is read-only.
//! - **`OutOfRange`**: a value failed validation against its attributes.
//! - **`Busy`**: a resource is owned elsewhere, a frame is still locked, or a
//!   property is frozen while buffers are held.
//! - **`Timeout`** / **`Cancelled`**: outcomes of a frame wait.
//! - **`OutOfMemory`**: buffer allocation failed (and was rolled back).
//! - **`DeviceError`**: opaque failure below the control layer. A fatal
//!   device error puts the session into its error state.
//!
//! Nothing is retried automatically.

use dcam_pool::RingError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results of camera control operations.
pub type DcamResult<T> = std::result::Result<T, DcamError>;

/// Stable classification of a [`DcamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handle does not resolve to a live session.
    InvalidHandle,
    /// Wrong point in the capture state machine.
    InvalidState,
    /// Feature or property absent on this device.
    NotSupported,
    /// Value validation failed.
    OutOfRange,
    /// Resource or property locked.
    Busy,
    /// Wait expired.
    Timeout,
    /// Wait released by cancellation or stop.
    Cancelled,
    /// Allocation failed.
    OutOfMemory,
    /// Lower-layer failure.
    DeviceError,
}

/// Error returned by every camera control operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DcamError {
    /// Handle does not resolve, or a device index is out of range.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Operation not allowed in the current capture or session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Property or feature the device does not offer.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Value outside its range, grid or option set.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Device owned by another session, or a property or frame locked.
    #[error("Busy: {0}")]
    Busy(String),

    /// No frame arrived within the wait timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Wait released by its cancel token or by capture stopping.
    #[error("Wait cancelled")]
    Cancelled,

    /// Buffer pool allocation failed.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The device or driver reported a failure.
    #[error("Device error: {0}")]
    Device(String),
}

impl DcamError {
    /// Classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::OutOfRange(_) => ErrorKind::OutOfRange,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Device(_) => ErrorKind::DeviceError,
        }
    }
}

impl From<RingError> for DcamError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::NoSlots => Self::OutOfRange(err.to_string()),
            RingError::SlotOutOfRange { .. } => Self::OutOfRange(err.to_string()),
            RingError::SlotEmpty(_) => Self::InvalidState(err.to_string()),
            RingError::OutOfMemory { .. } => Self::OutOfMemory(err.to_string()),
            RingError::SlotTooSmall { .. } | RingError::BufferTooSmall { .. } => {
                Self::OutOfRange(err.to_string())
            }
        }
    }
}
