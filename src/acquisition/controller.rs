//! Per-session acquisition controller.

use super::engine::{self, CaptureShared, EngineParams};
use super::{CaptureMode, CaptureState, Status, TransferInfo};
use crate::error::{DcamError, DcamResult};
use crate::property::{FrameGeometry, PropertyStore, WriteGate};
use crate::sensor::Sensor;
use dcam_pool::{FrameRing, MemoryBudget, SlotGuard, SlotLayout};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owns the frame ring and the capture engine of one session.
pub struct AcquisitionController {
    device_index: usize,
    ring: Option<Arc<FrameRing>>,
    shared: Arc<CaptureShared>,
    engine: Option<JoinHandle<()>>,
    mode: Option<CaptureMode>,
    budget: Arc<MemoryBudget>,
    writer_poll: Duration,
}

impl AcquisitionController {
    /// Idle controller charging allocations to `budget`.
    #[must_use]
    pub fn new(device_index: usize, budget: Arc<MemoryBudget>, writer_poll: Duration) -> Self {
        Self {
            device_index,
            ring: None,
            shared: Arc::new(CaptureShared::new()),
            engine: None,
            mode: None,
            budget,
            writer_poll,
        }
    }

    /// Current capture state.
    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    /// Status word, `Unstable` while a started capture is still spinning up.
    #[must_use]
    pub fn status(&self) -> Status {
        let progress = self.shared.progress.lock();
        Status::of(progress.state, progress.settled)
    }

    /// Mode of the current or last run.
    #[must_use]
    pub fn mode(&self) -> Option<CaptureMode> {
        self.mode
    }

    /// True once a fatal sensor fault has been seen.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.shared.is_fatal()
    }

    pub(crate) fn mark_fatal(&self) {
        self.shared.mark_fatal();
        self.shared.set_state(CaptureState::Error);
    }

    /// Which property writes the current state allows.
    #[must_use]
    pub fn write_gate(&self) -> WriteGate {
        match (self.state(), &self.ring) {
            (CaptureState::Capturing, _) => WriteGate::Capturing,
            (_, Some(_)) => WriteGate::PoolHeld,
            (_, None) => WriteGate::Free,
        }
    }

    /// Slots in the held ring, or 0.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.ring.as_ref().map_or(0, |r| r.len())
    }

    /// Allocate `count` slots sized for `geometry`. Idle → Armed.
    pub fn allocate(&mut self, count: usize, geometry: &FrameGeometry) -> DcamResult<()> {
        self.expect_state(&[CaptureState::Idle], "allocate buffers")?;
        if count == 0 {
            return Err(DcamError::OutOfRange("frame count must be at least 1".to_string()));
        }

        let layout = SlotLayout::new(geometry.row_bytes, geometry.height);
        let ring = FrameRing::allocate(count, layout, &self.budget)?;
        self.ring = Some(Arc::new(ring));
        self.shared.set_state(CaptureState::Armed);
        info!(
            device = self.device_index,
            frames = count,
            frame_bytes = layout.frame_bytes,
            "Buffers allocated"
        );
        Ok(())
    }

    /// Use caller-owned buffers as the ring. Idle → Armed.
    pub fn attach(
        &mut self,
        buffers: Vec<Vec<u8>>,
        size_per_buffer: usize,
        geometry: &FrameGeometry,
    ) -> DcamResult<()> {
        self.expect_state(&[CaptureState::Idle], "attach buffers")?;
        let count = buffers.len();
        let layout = SlotLayout::new(geometry.row_bytes, geometry.height);
        let ring = FrameRing::attach(buffers, size_per_buffer, layout)?;
        self.ring = Some(Arc::new(ring));
        self.shared.set_state(CaptureState::Armed);
        info!(device = self.device_index, frames = count, size_per_buffer, "Buffers attached");
        Ok(())
    }

    /// Start the engine. Armed or Stopped → Capturing.
    pub fn start(
        &mut self,
        mode: CaptureMode,
        properties: &Arc<Mutex<PropertyStore>>,
        sensor: &Arc<dyn Sensor>,
    ) -> DcamResult<()> {
        self.expect_state(&[CaptureState::Armed, CaptureState::Stopped], "start capture")?;
        let ring = self
            .ring
            .clone()
            .ok_or_else(|| DcamError::InvalidState("no buffers allocated".to_string()))?;
        if ring.locked_frames() > 0 {
            return Err(DcamError::Busy(format!(
                "{} frame(s) still locked from the previous run",
                ring.locked_frames()
            )));
        }
        self.join_engine();

        ring.clear();
        self.shared.begin_run();
        let params = EngineParams {
            device_index: self.device_index,
            ring,
            shared: Arc::clone(&self.shared),
            properties: Arc::clone(properties),
            sensor: Arc::clone(sensor),
            mode,
            writer_poll: self.writer_poll,
        };
        match engine::spawn(params) {
            Ok(handle) => {
                self.engine = Some(handle);
                self.mode = Some(mode);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(CaptureState::Armed);
                Err(DcamError::Device(format!("failed to start capture thread: {err}")))
            }
        }
    }

    /// Capturing → Stopped. Releases pending waits with `Cancelled`.
    /// Stopping an already stopped capture does nothing.
    pub fn stop(&mut self) -> DcamResult<()> {
        match self.state() {
            CaptureState::Capturing => {}
            CaptureState::Stopped => {
                self.join_engine();
                return Ok(());
            }
            other => {
                return Err(DcamError::InvalidState(format!("cannot stop capture while {other:?}")));
            }
        }

        self.halt_engine();
        self.shared.finish(CaptureState::Stopped, None);
        info!(device = self.device_index, "Capture stopped");
        Ok(())
    }

    /// Release an allocated ring. Armed or Stopped → Idle.
    pub fn free(&mut self) -> DcamResult<()> {
        self.expect_state(&[CaptureState::Armed, CaptureState::Stopped], "free buffers")?;
        let ring = self.release_ring(false)?;
        debug!(device = self.device_index, slots = ring.len(), "Buffers freed");
        Ok(())
    }

    /// Release an attached ring, handing the buffers back in order.
    pub fn detach(&mut self) -> DcamResult<Vec<Vec<u8>>> {
        self.expect_state(&[CaptureState::Armed, CaptureState::Stopped], "detach buffers")?;
        let ring = self.release_ring(true)?;
        debug!(device = self.device_index, slots = ring.len(), "Buffers detached");
        Ok(ring.into_buffers())
    }

    /// Any state → Idle, dropping the ring.
    pub fn reset(&mut self) -> DcamResult<()> {
        if let Some(ring) = &self.ring {
            let locked = ring.locked_frames();
            if locked > 0 {
                return Err(DcamError::Busy(format!("{locked} frame(s) still locked")));
            }
        }
        self.teardown();
        info!(device = self.device_index, "Acquisition reset");
        Ok(())
    }

    /// Stop and drop everything regardless of locks. Used on close.
    pub fn teardown(&mut self) {
        self.halt_engine();
        self.ring = None;
        self.mode = None;
        self.shared.clear();
    }

    /// Read-lock a filled slot.
    pub fn lock(&self, slot: usize) -> DcamResult<SlotGuard> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| DcamError::InvalidState("no buffers allocated".to_string()))?;
        Ok(ring.lock(slot)?)
    }

    /// Progress of the current or last capture run.
    #[must_use]
    pub fn transfer_info(&self) -> TransferInfo {
        let progress = self.shared.progress.lock();
        TransferInfo {
            newest_frame_index: progress.newest_slot,
            total_frames_captured: progress.total,
        }
    }

    /// Queue one software trigger. Only valid while capturing.
    pub fn fire_trigger(&self) -> DcamResult<()> {
        self.expect_state(&[CaptureState::Capturing], "fire trigger")?;
        self.shared.fire_trigger();
        Ok(())
    }

    /// What a frame wait needs, so it can run without the controller lock.
    pub(crate) fn waiter(&self) -> DcamResult<(Arc<CaptureShared>, usize)> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| DcamError::InvalidState("no buffers allocated".to_string()))?;
        Ok((Arc::clone(&self.shared), ring.len()))
    }

    fn expect_state(&self, allowed: &[CaptureState], action: &str) -> DcamResult<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(DcamError::InvalidState(format!("cannot {action} while {state:?}")))
        }
    }

    fn release_ring(&mut self, attached: bool) -> DcamResult<Arc<FrameRing>> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| DcamError::InvalidState("no buffers allocated".to_string()))?;
        if ring.locked_frames() > 0 {
            return Err(DcamError::Busy(format!("{} frame(s) still locked", ring.locked_frames())));
        }
        if ring.is_attached() != attached {
            return Err(DcamError::InvalidState(if attached {
                "buffers were allocated, use free_buffers".to_string()
            } else {
                "buffers were attached, use detach_buffers".to_string()
            }));
        }

        self.join_engine();
        self.shared.set_state(CaptureState::Idle);
        self.mode = None;
        self.ring
            .take()
            .ok_or_else(|| DcamError::InvalidState("no buffers allocated".to_string()))
    }

    fn halt_engine(&mut self) {
        if self.engine.is_some() {
            self.shared.request_stop();
            self.join_engine();
        }
    }

    fn join_engine(&mut self) {
        if let Some(handle) = self.engine.take() {
            if handle.join().is_err() {
                warn!(device = self.device_index, "Capture thread panicked");
            }
        }
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        self.halt_engine();
    }
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("device_index", &self.device_index)
            .field("state", &self.state())
            .field("ring", &self.ring)
            .field("mode", &self.mode)
            .finish()
    }
}
