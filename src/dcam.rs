//! The camera control API.
//!
//! [`Dcam`] owns the device registry and every open session. All operations
//! take a [`SessionHandle`] and return [`DcamResult`]. A failure is also
//! recorded as the session's last error; failures on handles that do not
//! resolve are recorded in a registry-wide slot instead.
//!
//! # Threading
//!
//! `Dcam` is `Send + Sync`. The intended pattern is one controlling task per
//! session. [`Dcam::wait_for_frame`] may run concurrently with property
//! reads and with `stop_capture`/`close` on the same session. Property
//! writes during capture are serialized by the caller; the engine reads
//! exposure and trigger settings once at the start of each frame.

use crate::acquisition::{
    AcquisitionController, CancelToken, CaptureMode, CaptureState, FrameIndex, FrameLock, Status,
    TransferInfo,
};
use crate::capability::{Capability, CapabilitySet};
use crate::config::{AcquisitionConfig, Settings};
use crate::error::{DcamError, DcamResult};
use crate::extended::{ExtendedCommand, ExtendedResponse};
use crate::lut::LutRange;
use crate::property::{Preset, PropertyAttr, PropertyId, PropertyStore};
use crate::registry::{DeviceInfo, DeviceRegistry};
use crate::session::{Session, SessionHandle, SessionState, SessionTable};
use dcam_pool::MemoryBudget;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Camera control root: device registry plus open sessions.
pub struct Dcam {
    registry: DeviceRegistry,
    sessions: RwLock<SessionTable>,
    budget: Arc<MemoryBudget>,
    writer_poll: Duration,
    /// Last error on a handle that did not resolve.
    global_error: Mutex<Option<DcamError>>,
}

impl Dcam {
    /// Build the device table from configuration, one simulated sensor per
    /// configured device.
    #[must_use]
    pub fn init(settings: &Settings) -> Self {
        Self::with_registry(DeviceRegistry::from_config(&settings.devices), &settings.acquisition)
    }

    /// Start from an explicit registry.
    #[must_use]
    pub fn with_registry(registry: DeviceRegistry, acquisition: &AcquisitionConfig) -> Self {
        info!(
            devices = registry.len(),
            max_pool_mb = acquisition.max_pool_bytes / (1024 * 1024),
            "Camera registry initialized"
        );
        Self {
            registry,
            sessions: RwLock::new(SessionTable::default()),
            budget: Arc::new(MemoryBudget::new(acquisition.max_pool_bytes)),
            writer_poll: Duration::from_millis(acquisition.writer_poll_ms.max(1)),
            global_error: Mutex::new(None),
        }
    }

    /// Close every open session and tear down the registry.
    pub fn shutdown(self) {
        let closed = self.close_all();
        info!(closed, "Camera registry shut down");
    }

    fn close_all(&self) -> usize {
        let sessions = self.sessions.write().drain();
        let count = sessions.len();
        for session in sessions {
            self.release_session(&session);
        }
        count
    }

    // =========================================================================
    // Devices and sessions
    // =========================================================================

    /// Number of devices in the registry.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// Descriptive strings of the device at `index`; no session needed.
    pub fn device_info(&self, index: usize) -> DcamResult<DeviceInfo> {
        self.registry.info(index).inspect_err(|err| self.record_global(err))
    }

    /// Bytes currently held by allocated frame rings, across all sessions.
    #[must_use]
    pub fn pool_bytes_in_use(&self) -> usize {
        self.budget.in_use()
    }

    /// Open the device at `index`.
    ///
    /// Fails with `InvalidHandle` for a bad index, `Busy` if another session
    /// owns the device, and `DeviceError` if the device does not respond.
    pub fn open(&self, index: usize) -> DcamResult<SessionHandle> {
        let entry = self.registry.claim(index).inspect_err(|err| self.record_global(err))?;

        if let Err(fault) = entry.sensor.ping() {
            self.registry.release(index);
            let err = DcamError::from(fault);
            warn!(device = index, error = %err, "Device did not respond");
            self.record_global(&err);
            return Err(err);
        }

        let session = Session::new(
            index,
            entry.capabilities.clone(),
            Arc::clone(&entry.sensor),
            PropertyStore::for_device(&entry.config, &entry.capabilities),
            AcquisitionController::new(index, Arc::clone(&self.budget), self.writer_poll),
        );
        let handle = self.sessions.write().insert(session);
        info!(device = index, model = %entry.config.model, %handle, "Session opened");
        Ok(handle)
    }

    /// Stop any capture, release any buffers and invalidate the handle.
    pub fn close(&self, handle: SessionHandle) -> DcamResult<()> {
        let Some(session) = self.sessions.write().remove(handle) else {
            let err = DcamError::InvalidHandle(format!("{handle} is not open"));
            self.record_global(&err);
            return Err(err);
        };
        self.release_session(&session);
        info!(device = session.device_index, %handle, "Session closed");
        Ok(())
    }

    fn release_session(&self, session: &Session) {
        session.acquisition.lock().teardown();
        self.registry.release(session.device_index);
    }

    /// Most recent error recorded for `handle`, or the registry-wide one if
    /// the handle does not resolve.
    #[must_use]
    pub fn last_error(&self, handle: SessionHandle) -> Option<DcamError> {
        match self.sessions.read().get(handle) {
            Some(session) => session.last_error(),
            None => self.global_error.lock().clone(),
        }
    }

    /// Features offered by the session's device.
    pub fn capabilities(&self, handle: SessionHandle) -> DcamResult<CapabilitySet> {
        self.with_session(handle, Access::AnyState, |s| Ok(s.capabilities.clone()))
    }

    /// Device status word derived from the capture state. A capture that
    /// was just started reports `Unstable` until its engine is running.
    pub fn status(&self, handle: SessionHandle) -> DcamResult<Status> {
        self.with_session(handle, Access::AnyState, |s| {
            Ok(match s.state() {
                SessionState::Open => s.acquisition.lock().status(),
                SessionState::Error | SessionState::Closed => Status::Error,
            })
        })
    }

    /// Never fails: a handle that does not resolve reports `Closed`.
    #[must_use]
    pub fn session_state(&self, handle: SessionHandle) -> SessionState {
        self.sessions
            .read()
            .get(handle)
            .map_or(SessionState::Closed, |s| s.state())
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Lazy walk over the device's property IDs in ascending order.
    ///
    /// The walk ends early if the session is closed meanwhile.
    pub fn property_ids(&self, handle: SessionHandle) -> DcamResult<PropertyIds> {
        self.with_session(handle, Access::OpenOnly, |s| {
            Ok(PropertyIds::new(Arc::downgrade(&s.properties)))
        })
    }

    /// The ID after `after`, or the first ID when `after` is `None`.
    pub fn next_property_id(
        &self,
        handle: SessionHandle,
        after: Option<PropertyId>,
    ) -> DcamResult<Option<PropertyId>> {
        self.with_session(handle, Access::OpenOnly, |s| Ok(s.properties.lock().next_id(after)))
    }

    /// Range, step and flags of `id`.
    pub fn property_attr(&self, handle: SessionHandle, id: PropertyId) -> DcamResult<PropertyAttr> {
        self.with_session(handle, Access::OpenOnly, |s| s.properties.lock().attr(id).cloned())
    }

    /// Display name, for logs and UIs only.
    pub fn property_name(&self, handle: SessionHandle, id: PropertyId) -> DcamResult<String> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.properties.lock().name(id).map(str::to_string)
        })
    }

    /// Display text for `value` of `id`, such as a mode name.
    pub fn value_text(
        &self,
        handle: SessionHandle,
        id: PropertyId,
        value: f64,
    ) -> DcamResult<String> {
        self.with_session(handle, Access::OpenOnly, |s| s.properties.lock().value_text(id, value))
    }

    /// Current value of `id`.
    pub fn get_value(&self, handle: SessionHandle, id: PropertyId) -> DcamResult<f64> {
        self.with_session(handle, Access::OpenOnly, |s| s.properties.lock().get(id))
    }

    /// Validate and apply `value`, returning the value actually applied.
    pub fn set_value(&self, handle: SessionHandle, id: PropertyId, value: f64) -> DcamResult<f64> {
        self.with_session(handle, Access::OpenOnly, |s| Self::write_property(s, id, value))
    }

    fn write_property(session: &Session, id: PropertyId, value: f64) -> DcamResult<f64> {
        let acquisition = session.acquisition.lock();
        let gate = acquisition.write_gate();
        session.properties.lock().set(id, value, gate)
    }

    /// Apply every value of `preset` in order, stopping at the first
    /// failure. Values applied before the failure stay applied.
    pub fn apply_preset(&self, handle: SessionHandle, preset: Preset) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            for &(id, value) in preset.values() {
                Self::write_property(s, id, value)?;
            }
            debug!(device = s.device_index, %preset, "Preset applied");
            Ok(())
        })
    }

    /// Properties changed by the device since the last call.
    pub fn query_update(&self, handle: SessionHandle) -> DcamResult<Vec<PropertyId>> {
        self.with_session(handle, Access::OpenOnly, |s| Ok(s.properties.lock().take_updates()))
    }

    /// Raw value range mapped onto the output range by `lock_bits`.
    pub fn set_input_lut_range(&self, handle: SessionHandle, max: u32, min: u32) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.capabilities.require(Capability::Lut)?;
            let limit = s.properties.lock().geometry().max_value();
            s.lut.lock().input = Some(LutRange::new(max, min, limit)?);
            Ok(())
        })
    }

    /// 8-bit output range of `lock_bits`.
    pub fn set_output_lut_range(
        &self,
        handle: SessionHandle,
        max: u32,
        min: u32,
    ) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.capabilities.require(Capability::Lut)?;
            s.lut.lock().output = LutRange::new(max, min, u32::from(u8::MAX))?;
            Ok(())
        })
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Allocate `frame_count` slots sized for the current image format.
    pub fn allocate_buffers(&self, handle: SessionHandle, frame_count: usize) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            let geometry = s.properties.lock().geometry();
            s.acquisition.lock().allocate(frame_count, &geometry)
        })
    }

    /// Capture into caller-owned buffers instead of allocated ones.
    pub fn attach_buffers(
        &self,
        handle: SessionHandle,
        buffers: Vec<Vec<u8>>,
        size_per_buffer: usize,
    ) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.capabilities.require(Capability::UserMemory)?;
            let geometry = s.properties.lock().geometry();
            s.acquisition.lock().attach(buffers, size_per_buffer, &geometry)
        })
    }

    /// Start capture into the held pool. Armed or Stopped → Capturing.
    pub fn start_capture(&self, handle: SessionHandle, mode: CaptureMode) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.acquisition.lock().start(mode, &s.properties, &s.sensor)
        })
    }

    /// Wait for the next frame in capture order.
    ///
    /// Fails with `Timeout` after `timeout`, with `Cancelled` when `cancel`
    /// fires or capture stops while waiting, and with the capture's fault if
    /// it failed. Neither timeout nor cancellation consumes a frame.
    pub async fn wait_for_frame(
        &self,
        handle: SessionHandle,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> DcamResult<FrameIndex> {
        let waiter = self.with_session(handle, Access::OpenOnly, |s| s.acquisition.lock().waiter());
        let (shared, slots) = waiter?;

        let result = shared.next_frame(slots, timeout, cancel).await;
        if let Err(err) = &result {
            match self.sessions.read().get(handle) {
                Some(session) => session.record_error(err.clone()),
                None => self.record_global(err),
            }
            debug!(%handle, error = %err, "Frame wait ended without a frame");
        }
        result
    }

    /// Newest slot and total frames of the current or last run.
    pub fn transfer_info(&self, handle: SessionHandle) -> DcamResult<TransferInfo> {
        self.with_session(handle, Access::OpenOnly, |s| Ok(s.acquisition.lock().transfer_info()))
    }

    /// Read-lock the frame in `slot`. It is not overwritten until the lock is
    /// released through [`unlock_frame`](Self::unlock_frame) or dropped.
    pub fn lock_frame(&self, handle: SessionHandle, slot: usize) -> DcamResult<FrameLock> {
        self.with_session(handle, Access::OpenOnly, |s| {
            let geometry = s.properties.lock().geometry();
            let guard = s.acquisition.lock().lock(slot)?;
            Ok(FrameLock::new(guard, geometry))
        })
    }

    /// Release a frame lock. The lock is released even if `handle` no longer
    /// resolves.
    pub fn unlock_frame(&self, handle: SessionHandle, lock: FrameLock) -> DcamResult<()> {
        drop(lock);
        self.with_session(handle, Access::AnyState, |_| Ok(()))
    }

    /// 8-bit rendition of the frame in `slot` through the session's LUT.
    pub fn lock_bits(&self, handle: SessionHandle, slot: usize) -> DcamResult<Vec<u8>> {
        self.with_session(handle, Access::OpenOnly, |s| {
            let geometry = s.properties.lock().geometry();
            let guard = s.acquisition.lock().lock(slot)?;
            let lut = *s.lut.lock();
            Ok(lut.render(guard.pixels(), &geometry))
        })
    }

    /// Stop capture, releasing pending waits with `Cancelled`.
    pub fn stop_capture(&self, handle: SessionHandle) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| s.acquisition.lock().stop())
    }

    /// Release an allocated pool and its budget.
    pub fn free_buffers(&self, handle: SessionHandle) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| s.acquisition.lock().free())
    }

    /// Release attached buffers and hand them back in order.
    pub fn detach_buffers(&self, handle: SessionHandle) -> DcamResult<Vec<Vec<u8>>> {
        self.with_session(handle, Access::OpenOnly, |s| s.acquisition.lock().detach())
    }

    /// Return capture to `Idle` from any state, including `Error`.
    pub fn reset(&self, handle: SessionHandle) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| s.acquisition.lock().reset())
    }

    /// Release one frame of a capture running on software trigger.
    pub fn fire_trigger(&self, handle: SessionHandle) -> DcamResult<()> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.capabilities.require(Capability::SoftwareTrigger)?;
            s.acquisition.lock().fire_trigger()
        })
    }

    /// Slots in the held pool, 0 without one.
    pub fn frame_count(&self, handle: SessionHandle) -> DcamResult<usize> {
        self.with_session(handle, Access::OpenOnly, |s| Ok(s.acquisition.lock().frame_count()))
    }

    /// Bytes per frame in the current format.
    pub fn frame_bytes(&self, handle: SessionHandle) -> DcamResult<usize> {
        self.with_session(handle, Access::OpenOnly, |s| {
            Ok(s.properties.lock().geometry().frame_bytes)
        })
    }

    /// Smallest and largest pixel value of the current format.
    pub fn data_range(&self, handle: SessionHandle) -> DcamResult<(u32, u32)> {
        self.with_session(handle, Access::OpenOnly, |s| {
            Ok((0, s.properties.lock().geometry().max_value()))
        })
    }

    /// Capture state, readable in the session error state.
    pub fn capture_state(&self, handle: SessionHandle) -> DcamResult<CaptureState> {
        self.with_session(handle, Access::AnyState, |s| Ok(s.acquisition.lock().state()))
    }

    /// Send a vendor extended command to the device.
    ///
    /// A fatal device fault puts the session into its error state.
    pub fn extended(
        &self,
        handle: SessionHandle,
        command: &ExtendedCommand,
    ) -> DcamResult<ExtendedResponse> {
        self.with_session(handle, Access::OpenOnly, |s| {
            s.capabilities.require(Capability::ExtendedCommands)?;
            s.sensor.extended(command).map_err(|fault| {
                if fault.is_fatal() {
                    warn!(
                        device = s.device_index,
                        fault = %fault,
                        "Fatal fault in extended command"
                    );
                    let mut acquisition = s.acquisition.lock();
                    acquisition.teardown();
                    acquisition.mark_fatal();
                }
                DcamError::from(fault)
            })
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        access: Access,
        op: impl FnOnce(&Session) -> DcamResult<T>,
    ) -> DcamResult<T> {
        let Some(session) = self.sessions.read().get(handle) else {
            let err = DcamError::InvalidHandle(format!("{handle} is not open"));
            self.record_global(&err);
            return Err(err);
        };

        let result = if access == Access::OpenOnly && session.state() == SessionState::Error {
            Err(DcamError::InvalidState(
                "session is in error state; close and reopen it".to_string(),
            ))
        } else {
            op(&session)
        };

        if let Err(err) = &result {
            debug!(device = session.device_index, %handle, error = %err, "Operation failed");
            session.record_error(err.clone());
        }
        result
    }

    fn record_global(&self, err: &DcamError) {
        *self.global_error.lock() = Some(err.clone());
    }
}

impl Drop for Dcam {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for Dcam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcam")
            .field("devices", &self.registry.len())
            .field("sessions", &self.sessions.read().len())
            .field("pool_bytes", &self.budget.in_use())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Allowed in the session error state.
    AnyState,
    OpenOnly,
}

/// Restartable, lazy iterator over a session's property IDs.
#[derive(Debug, Clone)]
pub struct PropertyIds {
    store: Weak<Mutex<PropertyStore>>,
    cursor: Option<PropertyId>,
    done: bool,
}

impl PropertyIds {
    fn new(store: Weak<Mutex<PropertyStore>>) -> Self {
        Self {
            store,
            cursor: None,
            done: false,
        }
    }

    /// Start over from the first ID.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.done = false;
    }
}

impl Iterator for PropertyIds {
    type Item = PropertyId;

    fn next(&mut self) -> Option<PropertyId> {
        if self.done {
            return None;
        }
        let next = self.store.upgrade().and_then(|store| store.lock().next_id(self.cursor));
        match next {
            Some(id) => self.cursor = Some(id),
            None => self.done = true,
        }
        next
    }
}
