//! Capture state machine and frame ring.
//!
//! ```text
//! Idle --allocate/attach--> Armed --start--> Capturing --stop/snap done--> Stopped
//!   ^                                                                         |
//!   +-------------------------------- free/detach ----------------------------+
//! ```
//!
//! A stopped pool may be started again. A sensor fault moves capture to
//! `Error`, left only through `reset`.
//!
//! # Locked frames
//!
//! A slot held by a [`FrameLock`] is never overwritten: the writer waits for
//! it to be released (re-checking for stop every `writer_poll_ms`). Readers
//! that hold locks for long stall the capture.

pub mod cancel;
pub mod controller;
mod engine;

pub use cancel::CancelToken;
pub use controller::AcquisitionController;

use crate::property::FrameGeometry;
use chrono::{DateTime, TimeZone, Utc};
use dcam_pool::SlotGuard;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Capture state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// No buffer pool held.
    Idle,
    /// Pool held, capture not started.
    Armed,
    /// The engine is writing frames.
    Capturing,
    /// Capture ended; the pool and its frames are still held.
    Stopped,
    /// A sensor fault ended the capture.
    Error,
}

/// How a capture run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Loop over the ring until stopped, overwriting the oldest frames.
    Sequence,
    /// Fill every slot once, then stop.
    Snap,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptureMode::Sequence => "sequence",
            CaptureMode::Snap => "snap",
        })
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequence" => Ok(CaptureMode::Sequence),
            "snap" => Ok(CaptureMode::Snap),
            other => Err(format!("unknown capture mode '{other}' (expected sequence or snap)")),
        }
    }
}

/// Device status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Capture failed or the session is in its error state.
    Error = 0,
    /// Frames are being captured.
    Busy = 1,
    /// A buffer pool is held and capture can start.
    Ready = 2,
    /// No pool held; the device is idle.
    Stable = 3,
    /// Capture was started but the engine is not producing frames yet.
    Unstable = 4,
}

impl Status {
    /// Status of a capture in `state`. `settled` is false between
    /// `start_capture` and the engine taking over the ring.
    #[must_use]
    pub fn of(state: CaptureState, settled: bool) -> Self {
        match state {
            CaptureState::Capturing if !settled => Status::Unstable,
            other => Status::from(other),
        }
    }
}

impl From<CaptureState> for Status {
    fn from(state: CaptureState) -> Self {
        match state {
            CaptureState::Idle => Status::Stable,
            CaptureState::Armed | CaptureState::Stopped => Status::Ready,
            CaptureState::Capturing => Status::Busy,
            CaptureState::Error => Status::Error,
        }
    }
}

/// Where a captured frame lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameIndex {
    /// Ring slot holding the frame.
    pub slot: usize,
    /// Capture sequence number, counted from 0 at `start_capture`.
    pub sequence: u64,
}

/// Capture progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferInfo {
    /// Slot of the most recently written frame.
    pub newest_frame_index: Option<usize>,
    /// Frames written since `start_capture`. Keeps counting as slots are
    /// reused.
    pub total_frames_captured: u64,
}

/// Read access to one slot. The slot is not overwritten until this is
/// dropped or passed to `Dcam::unlock_frame`.
pub struct FrameLock {
    guard: SlotGuard,
    geometry: FrameGeometry,
}

impl FrameLock {
    pub(crate) fn new(guard: SlotGuard, geometry: FrameGeometry) -> Self {
        Self { guard, geometry }
    }

    /// Pixel bytes, `row_bytes() * geometry().height` long.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.guard.pixels()
    }

    /// Row stride in bytes.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.guard.layout().row_bytes
    }

    /// Ring slot this lock holds.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.guard.index()
    }

    /// Sequence number of the frame actually held by the slot.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.guard.sequence()
    }

    /// Image format the frame was captured in.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Exposure of this frame in seconds.
    #[must_use]
    pub fn exposure_s(&self) -> f64 {
        self.guard.exposure_s()
    }

    /// Time the frame was written.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.guard.timestamp_ns())
    }
}

impl fmt::Debug for FrameLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLock")
            .field("slot", &self.slot())
            .field("sequence", &self.sequence())
            .field("row_bytes", &self.row_bytes())
            .finish()
    }
}
