//! Sessions and the handle arena.
//!
//! Callers never hold a session directly. They hold a [`SessionHandle`], an
//! index plus generation into the arena. Closing a session bumps the
//! generation of its slot, so a handle kept past `close` no longer resolves
//! and fails with `InvalidHandle` instead of reaching a reused slot.

use crate::acquisition::AcquisitionController;
use crate::capability::CapabilitySet;
use crate::error::DcamError;
use crate::lut::Lut;
use crate::property::PropertyStore;
use crate::sensor::Sensor;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Ticket for an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}.{}", self.index, self.generation)
    }
}

/// Lifecycle state of a session as seen through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Handle resolves and the session is usable.
    Open,
    /// A fatal device error occurred; only close is useful now.
    Error,
    /// The handle no longer resolves.
    Closed,
}

pub(crate) struct Session {
    pub(crate) device_index: usize,
    pub(crate) capabilities: CapabilitySet,
    pub(crate) sensor: Arc<dyn Sensor>,
    pub(crate) properties: Arc<Mutex<PropertyStore>>,
    pub(crate) acquisition: Mutex<AcquisitionController>,
    pub(crate) lut: Mutex<Lut>,
    last_error: Mutex<Option<DcamError>>,
}

impl Session {
    pub(crate) fn new(
        device_index: usize,
        capabilities: CapabilitySet,
        sensor: Arc<dyn Sensor>,
        properties: PropertyStore,
        acquisition: AcquisitionController,
    ) -> Self {
        Self {
            device_index,
            capabilities,
            sensor,
            properties: Arc::new(Mutex::new(properties)),
            acquisition: Mutex::new(acquisition),
            lut: Mutex::new(Lut::default()),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        if self.acquisition.lock().is_fatal() {
            SessionState::Error
        } else {
            SessionState::Open
        }
    }

    pub(crate) fn record_error(&self, err: DcamError) {
        *self.last_error.lock() = Some(err);
    }

    pub(crate) fn last_error(&self) -> Option<DcamError> {
        self.last_error.lock().clone()
    }
}

struct Slot {
    generation: u32,
    session: Option<Arc<Session>>,
}

/// Generational arena of open sessions.
#[derive(Default)]
pub(crate) struct SessionTable {
    slots: Vec<Slot>,
}

impl SessionTable {
    pub(crate) fn insert(&mut self, session: Session) -> SessionHandle {
        let session = Some(Arc::new(session));
        let free = self.slots.iter_mut().enumerate().find(|(_, s)| s.session.is_none());
        if let Some((index, slot)) = free {
            slot.session = session;
            return SessionHandle {
                index: index as u32,
                generation: slot.generation,
            };
        }

        self.slots.push(Slot { generation: 0, session });
        SessionHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.clone())
    }

    pub(crate) fn remove(&mut self, handle: SessionHandle) -> Option<Arc<Session>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(session)
    }

    /// Remove every session, for shutdown.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Session>> {
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                let session = slot.session.take()?;
                slot.generation = slot.generation.wrapping_add(1);
                Some(session)
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }
}
