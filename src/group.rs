//! Two cameras driven as one.
//!
//! A [`SessionPair`] mirrors every setting onto both sessions, reads a
//! property only when both cameras agree on it, and arms and starts capture
//! on both together. Progress is that of the slower camera.

use crate::acquisition::{CancelToken, CaptureMode, CaptureState};
use crate::dcam::Dcam;
use crate::error::{DcamError, DcamResult};
use crate::property::{Preset, PropertyId};
use crate::session::SessionHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval between progress checks in
/// [`wait_for_frames_taken`](SessionPair::wait_for_frames_taken).
const PROGRESS_POLL: Duration = Duration::from_millis(5);

/// Two open sessions on distinct cameras, configured and captured together.
#[derive(Clone, Copy)]
pub struct SessionPair<'a> {
    dcam: &'a Dcam,
    handles: [SessionHandle; 2],
}

impl std::fmt::Debug for SessionPair<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPair").field("handles", &self.handles).finish_non_exhaustive()
    }
}

impl Dcam {
    /// Group two open sessions.
    ///
    /// Fails with `InvalidHandle` if either handle does not resolve and with
    /// `InvalidState` if both name the same session.
    pub fn pair(&self, first: SessionHandle, second: SessionHandle) -> DcamResult<SessionPair<'_>> {
        if first == second {
            return Err(DcamError::InvalidState(format!("{first} cannot be paired with itself")));
        }
        self.capture_state(first)?;
        self.capture_state(second)?;
        debug!(%first, %second, "Sessions paired");
        Ok(SessionPair { dcam: self, handles: [first, second] })
    }
}

impl SessionPair<'_> {
    /// Sessions in the order given to [`Dcam::pair`].
    #[must_use]
    pub fn handles(&self) -> [SessionHandle; 2] {
        self.handles
    }

    /// Set `id` on both cameras and return the applied value.
    ///
    /// If the second camera rejects the value, the first is put back to its
    /// previous value. Fails with `InvalidState` when the cameras round the
    /// value differently.
    pub fn set_value(&self, id: PropertyId, value: f64) -> DcamResult<f64> {
        let [first, second] = self.handles;
        let previous = self.dcam.get_value(first, id)?;
        let applied = self.dcam.set_value(first, id, value)?;

        let other = match self.dcam.set_value(second, id, value) {
            Ok(other) => other,
            Err(err) => {
                self.restore(first, id, previous);
                return Err(err);
            }
        };
        if applied != other {
            return Err(DcamError::InvalidState(format!(
                "{id} applied as {applied} and {other} on the two cameras"
            )));
        }
        Ok(applied)
    }

    /// Set several properties on both cameras, in order. Stops at the first
    /// failure.
    pub fn update(&self, values: &[(PropertyId, f64)]) -> DcamResult<()> {
        values.iter().try_for_each(|&(id, value)| self.set_value(id, value).map(drop))
    }

    /// Read `id`, failing with `InvalidState` if the cameras disagree.
    pub fn get_value(&self, id: PropertyId) -> DcamResult<f64> {
        let [first, second] = self.handles;
        let value = self.dcam.get_value(first, id)?;
        let other = self.dcam.get_value(second, id)?;
        if value != other {
            return Err(DcamError::InvalidState(format!(
                "{id} differs between cameras ({value} vs {other}); read each session"
            )));
        }
        Ok(value)
    }

    /// Apply `preset` to the first camera, then the second.
    pub fn apply_preset(&self, preset: Preset) -> DcamResult<()> {
        for handle in self.handles {
            self.dcam.apply_preset(handle, preset)?;
        }
        info!(%preset, "Preset applied to camera pair");
        Ok(())
    }

    /// Allocate `frame_count` slots on both cameras. Nothing stays allocated
    /// if either allocation fails.
    pub fn allocate_buffers(&self, frame_count: usize) -> DcamResult<()> {
        let [first, second] = self.handles;
        self.dcam.allocate_buffers(first, frame_count)?;
        if let Err(err) = self.dcam.allocate_buffers(second, frame_count) {
            if let Err(undo) = self.dcam.free_buffers(first) {
                warn!(
                    handle = %first,
                    error = %undo,
                    "Could not free buffers after failed pair allocation"
                );
            }
            return Err(err);
        }
        debug!(frame_count, "Buffers allocated on camera pair");
        Ok(())
    }

    /// Start capture on both cameras.
    ///
    /// Both must be Armed or Stopped before either starts. If the second
    /// camera fails to start, the first is stopped again.
    pub fn start_capture(&self, mode: CaptureMode) -> DcamResult<()> {
        let [first, second] = self.handles;
        for handle in self.handles {
            let state = self.dcam.capture_state(handle)?;
            if !matches!(state, CaptureState::Armed | CaptureState::Stopped) {
                return Err(DcamError::InvalidState(format!(
                    "cannot start pair capture: {handle} is {state:?}"
                )));
            }
        }

        self.dcam.start_capture(first, mode)?;
        if let Err(err) = self.dcam.start_capture(second, mode) {
            if let Err(undo) = self.dcam.stop_capture(first) {
                warn!(
                    handle = %first,
                    error = %undo,
                    "Could not stop capture after failed pair start"
                );
            }
            return Err(err);
        }
        info!(%mode, "Pair capture started");
        Ok(())
    }

    /// Stop both captures. Both are attempted; the first failure is returned.
    pub fn stop_capture(&self) -> DcamResult<()> {
        self.on_both(|handle| self.dcam.stop_capture(handle))
    }

    /// Free both rings. Both are attempted; the first failure is returned.
    pub fn free_buffers(&self) -> DcamResult<()> {
        self.on_both(|handle| self.dcam.free_buffers(handle))
    }

    /// Frames captured by the slower camera since capture started.
    pub fn frames_taken(&self) -> DcamResult<u64> {
        let [first, second] = self.handles;
        let a = self.dcam.transfer_info(first)?.total_frames_captured;
        let b = self.dcam.transfer_info(second)?.total_frames_captured;
        Ok(a.min(b))
    }

    /// Wait until both cameras have captured at least `target` frames.
    ///
    /// Returns the frames taken once reached. Fails with `Timeout` after
    /// `timeout` and with `Cancelled` when `cancel` fires.
    pub async fn wait_for_frames_taken(
        &self,
        target: u64,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> DcamResult<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let taken = self.frames_taken()?;
            if taken >= target {
                return Ok(taken);
            }
            if Instant::now() >= deadline {
                return Err(DcamError::Timeout(timeout));
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(DcamError::Cancelled),
                () = tokio::time::sleep(PROGRESS_POLL) => {}
            }
        }
    }

    fn on_both(&self, op: impl Fn(SessionHandle) -> DcamResult<()>) -> DcamResult<()> {
        let [first, second] = self.handles;
        let a = op(first);
        let b = op(second);
        a.and(b)
    }

    fn restore(&self, handle: SessionHandle, id: PropertyId, previous: f64) {
        if let Err(err) = self.dcam.set_value(handle, id, previous) {
            warn!(%handle, %id, error = %err, "Could not restore property after failed pair set");
        }
    }
}
