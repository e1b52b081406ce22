//! Per-session property values.

use super::{catalog, FrameGeometry, PropertyAttr, PropertyId, SensorMode, TriggerSource};
use crate::capability::CapabilitySet;
use crate::config::DeviceConfig;
use crate::error::{DcamError, DcamResult};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tracing::{debug, trace};

/// Fixed sensor characteristics the derived properties are computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorLimits {
    /// Sensor columns.
    pub width: u32,
    /// Sensor rows.
    pub height: u32,
    /// Full-frame readout time in seconds.
    pub readout_s: f64,
}

impl SensorLimits {
    /// Limits of the configured sensor.
    #[must_use]
    pub fn from_device(device: &DeviceConfig) -> Self {
        Self {
            width: device.width,
            height: device.height,
            readout_s: device.readout_ms / 1_000.0,
        }
    }
}

/// What the acquisition side currently holds, as far as property writes
/// are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteGate {
    /// No buffer pool; every writable property may change.
    Free,
    /// A pool is held but not capturing; format-affecting properties are
    /// frozen.
    PoolHeld,
    /// Capture running; capture-immutable properties are frozen too.
    Capturing,
}

/// Values the acquisition engine reads at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    /// Exposure in seconds.
    pub exposure_s: f64,
    /// Where frames are released from.
    pub trigger: TriggerSource,
    /// Let the sensor adjust exposure between frames.
    pub auto_exposure: bool,
    /// Readout time of the current format, seconds.
    pub readout_s: f64,
}

/// Property table and current values for one session.
#[derive(Debug, Clone)]
pub struct PropertyStore {
    attrs: BTreeMap<PropertyId, PropertyAttr>,
    values: BTreeMap<PropertyId, f64>,
    updated: BTreeSet<PropertyId>,
    limits: SensorLimits,
}

impl PropertyStore {
    /// Store with every property at its default.
    #[must_use]
    pub fn new(attrs: Vec<PropertyAttr>, limits: SensorLimits) -> Self {
        let values = attrs.iter().map(|a| (a.id, a.default)).collect();
        let attrs = attrs.into_iter().map(|a| (a.id, a)).collect();
        let mut store = Self {
            attrs,
            values,
            updated: BTreeSet::new(),
            limits,
        };
        store.recompute_derived();
        store.updated.clear();
        store
    }

    /// Store for a configured device.
    #[must_use]
    pub fn for_device(device: &DeviceConfig, caps: &CapabilitySet) -> Self {
        Self::new(catalog::build(device, caps), SensorLimits::from_device(device))
    }

    /// Number of properties the device offers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True if the device offers no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// The property following `after` in ID order, or the first one when
    /// `after` is `None`.
    #[must_use]
    pub fn next_id(&self, after: Option<PropertyId>) -> Option<PropertyId> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.attrs.range((lower, Bound::Unbounded)).next().map(|(id, _)| *id)
    }

    /// Attributes of `id`, `NotSupported` if absent.
    pub fn attr(&self, id: PropertyId) -> DcamResult<&PropertyAttr> {
        self.attrs.get(&id).ok_or_else(|| {
            DcamError::NotSupported(format!("property {id} not offered by this device"))
        })
    }

    /// Current value, recomputed for derived properties.
    pub fn get(&self, id: PropertyId) -> DcamResult<f64> {
        self.attr(id)?;
        Ok(self.value(id).unwrap_or_default())
    }

    /// Validate and apply a write, returning the value actually stored.
    ///
    /// Checks run in order: unknown ID, read-only, frozen by `gate`,
    /// attribute range, cross-property limits. Nothing is stored unless all
    /// of them pass.
    pub fn set(&mut self, id: PropertyId, value: f64, gate: WriteGate) -> DcamResult<f64> {
        let attr = self.attr(id)?;
        if !attr.writable {
            return Err(DcamError::NotSupported(format!("{} ({id}) is read-only", attr.name)));
        }
        if attr.affects_format && gate != WriteGate::Free {
            return Err(DcamError::Busy(format!(
                "{} ({id}) changes the frame format and a buffer pool is held",
                attr.name
            )));
        }
        if attr.capture_immutable && gate == WriteGate::Capturing {
            return Err(DcamError::Busy(format!(
                "{} ({id}) cannot change while capturing",
                attr.name
            )));
        }

        let applied = attr.quantize(value)?;
        self.check_cross_limits(id, applied)?;

        let previous = self.values.insert(id, applied);
        debug!(property = %id, requested = value, applied, "Property set");
        if previous != Some(applied) {
            self.recompute_derived();
        }
        Ok(applied)
    }

    /// Apply a value chosen by the device rather than the caller, and flag
    /// it for [`take_updates`](Self::take_updates).
    pub fn apply_drift(&mut self, id: PropertyId, value: f64) -> DcamResult<f64> {
        let applied = self.attr(id)?.quantize(value)?;
        if self.values.insert(id, applied) != Some(applied) {
            trace!(property = %id, applied, "Property drifted");
            self.updated.insert(id);
            self.recompute_derived();
        }
        Ok(applied)
    }

    /// Drain the set of properties changed by the device since the last
    /// call.
    pub fn take_updates(&mut self) -> Vec<PropertyId> {
        std::mem::take(&mut self.updated).into_iter().collect()
    }

    /// Display name of `id`.
    pub fn name(&self, id: PropertyId) -> DcamResult<&'static str> {
        Ok(self.attr(id)?.name)
    }

    /// Display text for `value` of `id`.
    pub fn value_text(&self, id: PropertyId, value: f64) -> DcamResult<String> {
        Ok(self.attr(id)?.value_text(value))
    }

    /// Image format implied by the current values.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        let bin = self.int(PropertyId::BINNING, 1).max(1);
        let (hsize, vsize) = self.subarray_size();
        let rows = self.rows_read(vsize);
        let rows = match self.sensor_mode() {
            SensorMode::Tdi => rows,
            SensorMode::Area | SensorMode::PartialArea => rows / bin,
        };
        let bits = self.int(PropertyId::BIT_PER_CHANNEL, 16) as u32;
        FrameGeometry::new(hsize / bin, rows.max(1), bits)
    }

    /// Snapshot for one frame of the acquisition engine.
    #[must_use]
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            exposure_s: self.value(PropertyId::EXPOSURE_TIME).unwrap_or(0.01),
            trigger: TriggerSource::from_value(
                self.value(PropertyId::TRIGGER_SOURCE).unwrap_or(1.0),
            ),
            auto_exposure: self.int(PropertyId::EXPOSURE_AUTO, 1) == 2,
            readout_s: self.readout_time(),
        }
    }

    fn value(&self, id: PropertyId) -> Option<f64> {
        self.values.get(&id).copied()
    }

    fn int(&self, id: PropertyId, default: usize) -> usize {
        self.value(id).map_or(default, |v| v.round().max(0.0) as usize)
    }

    fn sensor_mode(&self) -> SensorMode {
        SensorMode::from_value(self.value(PropertyId::SENSOR_MODE).unwrap_or(1.0))
    }

    fn subarray_size(&self) -> (usize, usize) {
        let full = (self.limits.width as usize, self.limits.height as usize);
        if self.int(PropertyId::SUBARRAY_MODE, 1) == 2 {
            (
                self.int(PropertyId::SUBARRAY_HSIZE, full.0),
                self.int(PropertyId::SUBARRAY_VSIZE, full.1),
            )
        } else {
            full
        }
    }

    /// Sensor rows read per frame in the current mode.
    fn rows_read(&self, vsize: usize) -> usize {
        match self.sensor_mode() {
            SensorMode::Area => vsize,
            SensorMode::Tdi => self.int(PropertyId::LINE_BUNDLE_HEIGHT, vsize),
            SensorMode::PartialArea => self.int(PropertyId::PARTIAL_AREA_VSIZE, vsize),
        }
    }

    fn readout_time(&self) -> f64 {
        let (_, vsize) = self.subarray_size();
        let rows = self.rows_read(vsize) as f64;
        self.limits.readout_s * rows / f64::from(self.limits.height.max(1))
    }

    fn check_cross_limits(&self, id: PropertyId, value: f64) -> DcamResult<()> {
        let (pair, extent) = match id {
            PropertyId::SUBARRAY_HPOS => (PropertyId::SUBARRAY_HSIZE, self.limits.width),
            PropertyId::SUBARRAY_HSIZE => (PropertyId::SUBARRAY_HPOS, self.limits.width),
            PropertyId::SUBARRAY_VPOS => (PropertyId::SUBARRAY_VSIZE, self.limits.height),
            PropertyId::SUBARRAY_VSIZE => (PropertyId::SUBARRAY_VPOS, self.limits.height),
            _ => return Ok(()),
        };
        let other = self.value(pair).unwrap_or_default();
        if value + other > f64::from(extent) {
            return Err(DcamError::OutOfRange(format!(
                "subarray {id} = {value} with {pair} = {other} exceeds sensor extent {extent}"
            )));
        }
        Ok(())
    }

    /// Refresh read-only values and flag the ones that changed.
    fn recompute_derived(&mut self) {
        let geometry = self.geometry();
        let readout = self.readout_time();
        let exposure = self.value(PropertyId::EXPOSURE_TIME).unwrap_or(0.01);
        let derived = [
            (PropertyId::IMAGE_WIDTH, geometry.width as f64),
            (PropertyId::IMAGE_HEIGHT, geometry.height as f64),
            (PropertyId::IMAGE_ROWBYTES, geometry.row_bytes as f64),
            (PropertyId::IMAGE_FRAMEBYTES, geometry.frame_bytes as f64),
            (PropertyId::TIMING_READOUT_TIME, readout),
            (PropertyId::INTERNAL_FRAME_RATE, 1.0 / exposure.max(readout)),
        ];

        for (id, value) in derived {
            if !self.attrs.contains_key(&id) {
                continue;
            }
            if self.values.insert(id, value) != Some(value) {
                self.updated.insert(id);
            }
        }
    }
}
