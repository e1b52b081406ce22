//! Acquisition engine: the single writer of a frame ring.
//!
//! One engine thread runs per capture. Each frame it:
//! 1. Snapshots exposure and trigger settings from the property store
//! 2. Waits for a software trigger, or sleeps exposure + readout
//! 3. Takes the slot's write lock, waiting while a reader holds it
//! 4. Has the sensor fill the slot, stamps sequence and timestamp
//! 5. Publishes progress and wakes frame waiters
//!
//! Stop is observed in every blocking step. The engine is a plain thread,
//! not a tokio task, so a stalled writer never occupies a runtime worker.

use super::cancel::CancelToken;
use super::{CaptureMode, CaptureState, FrameIndex};
use crate::error::{DcamError, DcamResult};
use crate::property::{PropertyId, PropertyStore, TriggerSource};
use crate::sensor::{ExposureContext, Sensor, SensorFault};
use chrono::Utc;
use dcam_pool::FrameRing;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Shared state
// =============================================================================

#[derive(Debug)]
pub(crate) struct Progress {
    pub(crate) state: CaptureState,
    /// Frames written this run.
    pub(crate) total: u64,
    pub(crate) newest_slot: Option<usize>,
    /// Sequence number the next wait returns.
    pub(crate) read_cursor: u64,
    /// Error reported to waiters once capture fails.
    pub(crate) fault: Option<DcamError>,
    /// Set once the engine thread has taken over the ring.
    pub(crate) settled: bool,
}

impl Progress {
    fn idle() -> Self {
        Self {
            state: CaptureState::Idle,
            total: 0,
            newest_slot: None,
            read_cursor: 0,
            fault: None,
            settled: false,
        }
    }
}

#[derive(Debug, Default)]
struct EngineSignal {
    stop: bool,
    triggers: u64,
}

/// State shared between the controller, the engine thread and waiters.
#[derive(Debug)]
pub(crate) struct CaptureShared {
    pub(crate) progress: Mutex<Progress>,
    frame_ready: Notify,
    signal: Mutex<EngineSignal>,
    wake: Condvar,
    /// Set by a fatal sensor fault; the session is unusable afterwards.
    fatal: AtomicBool,
}

impl CaptureShared {
    pub(crate) fn new() -> Self {
        Self {
            progress: Mutex::new(Progress::idle()),
            frame_ready: Notify::new(),
            signal: Mutex::new(EngineSignal::default()),
            wake: Condvar::new(),
            fatal: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> CaptureState {
        self.progress.lock().state
    }

    pub(crate) fn set_state(&self, state: CaptureState) {
        self.progress.lock().state = state;
        self.frame_ready.notify_waiters();
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub(crate) fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    /// Reset counters and signals for a new run and enter `Capturing`.
    pub(crate) fn begin_run(&self) {
        *self.signal.lock() = EngineSignal::default();
        let mut progress = self.progress.lock();
        *progress = Progress::idle();
        progress.state = CaptureState::Capturing;
    }

    fn settle(&self) {
        self.progress.lock().settled = true;
    }

    pub(crate) fn request_stop(&self) {
        self.signal.lock().stop = true;
        self.wake.notify_all();
    }

    pub(crate) fn fire_trigger(&self) {
        self.signal.lock().triggers += 1;
        self.wake.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.signal.lock().stop
    }

    /// Sleep for `duration`. Returns false if stop was requested first.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut signal = self.signal.lock();
        while !signal.stop {
            if self.wake.wait_until(&mut signal, deadline).timed_out() {
                return !signal.stop;
            }
        }
        false
    }

    /// Consume one software trigger. Returns false if stop was requested
    /// first.
    fn wait_trigger(&self) -> bool {
        let mut signal = self.signal.lock();
        loop {
            if signal.stop {
                return false;
            }
            if signal.triggers > 0 {
                signal.triggers -= 1;
                return true;
            }
            self.wake.wait(&mut signal);
        }
    }

    fn publish(&self, slot: usize, sequence: u64) {
        {
            let mut progress = self.progress.lock();
            progress.total = sequence + 1;
            progress.newest_slot = Some(slot);
        }
        self.frame_ready.notify_waiters();
    }

    /// Back to `Idle` with counters zeroed.
    pub(crate) fn clear(&self) {
        *self.progress.lock() = Progress::idle();
        self.frame_ready.notify_waiters();
    }

    /// End a run in `state` unless something else ended it first.
    pub(crate) fn finish(&self, state: CaptureState, fault: Option<DcamError>) {
        {
            let mut progress = self.progress.lock();
            // A stop that raced with us already decided the final state.
            if progress.state == CaptureState::Capturing {
                progress.state = state;
                progress.fault = fault;
            }
        }
        self.frame_ready.notify_waiters();
    }

    /// Wait for the next unread frame of a ring with `slots` slots.
    ///
    /// Frames come back in capture order. A reader that fell more than a
    /// ring behind skips ahead to the oldest frame still held. Timeout and
    /// cancellation never consume a frame. Once capture has ended, a wait
    /// that was already pending is released with `Cancelled`; a new wait
    /// with nothing left to read fails with `InvalidState`.
    pub(crate) async fn next_frame(
        &self,
        slots: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> DcamResult<FrameIndex> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut waited = false;

        loop {
            let notified = self.frame_ready.notified();
            {
                let mut progress = self.progress.lock();
                if progress.total > progress.read_cursor {
                    let oldest = progress.total.saturating_sub(slots as u64);
                    if progress.read_cursor < oldest {
                        warn!(
                            dropped = oldest - progress.read_cursor,
                            total = progress.total,
                            "Reader overrun, skipping to oldest frame in ring"
                        );
                        progress.read_cursor = oldest;
                    }
                    let sequence = progress.read_cursor;
                    progress.read_cursor += 1;
                    return Ok(FrameIndex {
                        slot: (sequence % slots as u64) as usize,
                        sequence,
                    });
                }

                match progress.state {
                    CaptureState::Capturing => {}
                    CaptureState::Error => {
                        let fault = progress.fault.clone();
                        return Err(fault.unwrap_or_else(|| {
                            DcamError::InvalidState("capture failed".to_string())
                        }));
                    }
                    _ if waited => return Err(DcamError::Cancelled),
                    other => {
                        return Err(DcamError::InvalidState(format!(
                            "no frame to wait for while {other:?}"
                        )))
                    }
                }
            }

            if cancel.is_cancelled() {
                return Err(DcamError::Cancelled);
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(DcamError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(DcamError::Timeout(timeout)),
            }
            waited = true;
        }
    }
}

// =============================================================================
// Engine thread
// =============================================================================

pub(crate) struct EngineParams {
    pub(crate) device_index: usize,
    pub(crate) ring: Arc<FrameRing>,
    pub(crate) shared: Arc<CaptureShared>,
    pub(crate) properties: Arc<Mutex<PropertyStore>>,
    pub(crate) sensor: Arc<dyn Sensor>,
    pub(crate) mode: CaptureMode,
    pub(crate) writer_poll: Duration,
}

pub(crate) fn spawn(params: EngineParams) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("dcam-capture-{}", params.device_index))
        .spawn(move || run(params))
}

fn run(p: EngineParams) {
    let layout = p.ring.layout();
    let geometry = p.properties.lock().geometry();
    let slots = p.ring.len() as u64;
    info!(
        device = p.device_index,
        mode = %p.mode,
        slots,
        width = geometry.width,
        height = geometry.height,
        "Capture started"
    );
    p.shared.settle();

    let mut sequence = 0u64;
    loop {
        if p.mode == CaptureMode::Snap && sequence == slots {
            info!(device = p.device_index, frames = sequence, "Snap complete");
            p.shared.finish(CaptureState::Stopped, None);
            return;
        }

        let settings = p.properties.lock().capture_settings();
        let proceed = match settings.trigger {
            TriggerSource::Software => p.shared.wait_trigger(),
            // External triggers run on the internal timer.
            TriggerSource::Internal | TriggerSource::External => p
                .shared
                .sleep(Duration::from_secs_f64(settings.exposure_s + settings.readout_s)),
        };
        if !proceed {
            break;
        }

        let slot = (sequence % slots) as usize;
        let mut data = loop {
            if p.shared.stop_requested() {
                debug!(device = p.device_index, slot, "Stop while waiting on locked slot");
                return;
            }
            if let Some(guard) = p.ring.try_write(slot, p.writer_poll) {
                break guard;
            }
            trace!(device = p.device_index, slot, "Writer blocked by locked slot");
        };

        let ctx = ExposureContext {
            sequence,
            exposure_s: settings.exposure_s,
            geometry,
        };
        if let Err(fault) = p.sensor.expose(&ctx, data.frame_mut(layout)) {
            drop(data);
            fail(&p, sequence, fault);
            return;
        }
        data.sequence = Some(sequence);
        data.timestamp_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        data.exposure_s = settings.exposure_s;
        drop(data);

        p.shared.publish(slot, sequence);
        trace!(device = p.device_index, slot, sequence, "Frame written");
        sequence += 1;

        if settings.auto_exposure {
            if let Some(next) = p.sensor.suggest_exposure(settings.exposure_s) {
                if let Err(err) = p.properties.lock().apply_drift(PropertyId::EXPOSURE_TIME, next) {
                    debug!(
                        device = p.device_index,
                        error = %err,
                        "Auto-exposure suggestion rejected"
                    );
                }
            }
        }
    }

    debug!(device = p.device_index, frames = sequence, "Capture engine stopped");
}

fn fail(p: &EngineParams, sequence: u64, fault: SensorFault) {
    error!(device = p.device_index, sequence, fault = %fault, "Sensor fault during capture");
    if fault.is_fatal() {
        p.shared.mark_fatal();
    }
    p.shared.finish(CaptureState::Error, Some(fault.into()));
}
