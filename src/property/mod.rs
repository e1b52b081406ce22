//! Camera properties: IDs, attributes and the per-session value store.
//!
//! Every property is keyed by a stable integer [`PropertyId`]. Names and
//! value texts exist for logs and UIs only.
//!
//! Three value types are supported:
//! - **Mode**: one of a listed set of integer options (trigger source,
//!   binning, sensor mode, ...)
//! - **Long**: integer in `[min, max]` on a `step` grid
//! - **Real**: floating point in `[min, max]` on a `step` grid
//!
//! Writes are validated against the attributes before anything is stored,
//! then snapped to the step grid. The store reports the value actually
//! applied.

pub mod catalog;
pub mod preset;
pub mod store;

pub use preset::Preset;
pub use store::{CaptureSettings, PropertyStore, SensorLimits, WriteGate};

use crate::error::{DcamError, DcamResult};
use serde::Serialize;
use std::fmt;

/// Stable property identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PropertyId(pub u32);

impl PropertyId {
    /// Trigger source (mode: internal, external, software).
    pub const TRIGGER_SOURCE: Self = Self(0x0010_0110);
    /// External trigger activation (mode: edge, level).
    pub const TRIGGER_ACTIVE: Self = Self(0x0010_0120);
    /// External trigger polarity (mode: negative, positive).
    pub const TRIGGER_POLARITY: Self = Self(0x0010_0220);
    /// Exposure time in seconds.
    pub const EXPOSURE_TIME: Self = Self(0x001F_0110);
    /// Driver-controlled exposure (mode: off, on).
    pub const EXPOSURE_AUTO: Self = Self(0x001F_0120);
    /// Analog contrast gain.
    pub const CONTRAST_GAIN: Self = Self(0x0030_0120);
    /// Sensor readout mode (mode: area, TDI, partial area).
    pub const SENSOR_MODE: Self = Self(0x0040_0210);
    /// Rows per bundle in TDI mode.
    pub const LINE_BUNDLE_HEIGHT: Self = Self(0x0040_0250);
    /// On-sensor binning (mode: 1, 2, 4).
    pub const BINNING: Self = Self(0x0040_1110);
    /// Subarray left edge.
    pub const SUBARRAY_HPOS: Self = Self(0x0040_2110);
    /// Subarray width.
    pub const SUBARRAY_HSIZE: Self = Self(0x0040_2120);
    /// Subarray top edge.
    pub const SUBARRAY_VPOS: Self = Self(0x0040_2130);
    /// Subarray height.
    pub const SUBARRAY_VSIZE: Self = Self(0x0040_2140);
    /// Subarray enable (mode: off, on).
    pub const SUBARRAY_MODE: Self = Self(0x0040_2150);
    /// Rows read in partial-area mode.
    pub const PARTIAL_AREA_VSIZE: Self = Self(0x0040_2160);
    /// Time to read one frame out of the sensor, seconds. Read-only.
    pub const TIMING_READOUT_TIME: Self = Self(0x0040_3010);
    /// Frame rate under internal trigger, Hz. Read-only.
    pub const INTERNAL_FRAME_RATE: Self = Self(0x0040_3810);
    /// Image width in pixels. Read-only.
    pub const IMAGE_WIDTH: Self = Self(0x0042_0210);
    /// Image height in pixels. Read-only.
    pub const IMAGE_HEIGHT: Self = Self(0x0042_0220);
    /// Bytes per image row. Read-only.
    pub const IMAGE_ROWBYTES: Self = Self(0x0042_0230);
    /// Bytes per image. Read-only.
    pub const IMAGE_FRAMEBYTES: Self = Self(0x0042_0240);
    /// Bits per pixel channel (mode: 8 or the native depth).
    pub const BIT_PER_CHANNEL: Self = Self(0x0042_0310);
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// One of the listed options.
    Mode,
    /// Integer on a step grid.
    Long,
    /// Real on a step grid.
    Real,
}

/// One allowed value of a mode property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeOption {
    /// Numeric property value.
    pub value: i32,
    /// Display name of the value.
    pub text: &'static str,
}

impl ModeOption {
    /// Option `value` shown as `text`.
    #[must_use]
    pub const fn new(value: i32, text: &'static str) -> Self {
        Self { value, text }
    }
}

/// Attributes of one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyAttr {
    /// Property this describes.
    pub id: PropertyId,
    /// Display name.
    pub name: &'static str,
    /// How values are interpreted and validated.
    pub kind: ValueKind,
    /// Smallest allowed value.
    pub min: f64,
    /// Largest allowed value.
    pub max: f64,
    /// Grid spacing for long/real values; zero means continuous.
    pub step: f64,
    /// Value when a session opens.
    pub default: f64,
    /// False for values derived by the device.
    pub writable: bool,
    /// Writes are refused with `Busy` while capturing.
    pub capture_immutable: bool,
    /// Changes the frame size, so writes are refused while any buffer pool
    /// is held.
    pub affects_format: bool,
    /// Allowed values of a mode property; empty for long/real.
    pub options: Vec<ModeOption>,
    /// Unit appended by `value_text`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
}

/// Tolerance used when comparing caller values to range and grid limits.
const EPSILON: f64 = 1e-9;

impl PropertyAttr {
    /// Writable mode property. `min`/`max` follow the option values.
    #[must_use]
    pub fn mode(
        id: PropertyId,
        name: &'static str,
        options: Vec<ModeOption>,
        default: i32,
    ) -> Self {
        let min = options.iter().map(|o| o.value).min().unwrap_or(default);
        let max = options.iter().map(|o| o.value).max().unwrap_or(default);
        Self {
            id,
            name,
            kind: ValueKind::Mode,
            min: f64::from(min),
            max: f64::from(max),
            step: 1.0,
            default: f64::from(default),
            writable: true,
            capture_immutable: true,
            affects_format: false,
            options,
            unit: None,
        }
    }

    /// Writable long property.
    #[must_use]
    pub fn long(
        id: PropertyId,
        name: &'static str,
        min: i64,
        max: i64,
        step: i64,
        default: i64,
    ) -> Self {
        Self {
            id,
            name,
            kind: ValueKind::Long,
            min: min as f64,
            max: max as f64,
            step: step as f64,
            default: default as f64,
            writable: true,
            capture_immutable: false,
            affects_format: false,
            options: Vec::new(),
            unit: None,
        }
    }

    /// Writable real property.
    #[must_use]
    pub fn real(
        id: PropertyId,
        name: &'static str,
        min: f64,
        max: f64,
        step: f64,
        default: f64,
    ) -> Self {
        Self {
            id,
            name,
            kind: ValueKind::Real,
            min,
            max,
            step,
            default,
            writable: true,
            capture_immutable: false,
            affects_format: false,
            options: Vec::new(),
            unit: None,
        }
    }

    /// Mark as derived by the device.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Refuse writes while capturing.
    #[must_use]
    pub fn capture_immutable(mut self, immutable: bool) -> Self {
        self.capture_immutable = immutable;
        self
    }

    /// Mark as format-affecting. Implies capture-immutable.
    #[must_use]
    pub fn affects_format(mut self) -> Self {
        self.affects_format = true;
        self.capture_immutable = true;
        self
    }

    /// Unit shown after values.
    #[must_use]
    pub fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Validate `value` and snap it to the value that would be applied.
    ///
    /// Range is checked before quantization, so a value just past `max`
    /// fails rather than snapping back inside.
    pub fn quantize(&self, value: f64) -> DcamResult<f64> {
        if !value.is_finite() {
            return Err(DcamError::OutOfRange(format!(
                "{} ({}) must be finite, got {value}",
                self.name, self.id
            )));
        }

        if self.kind == ValueKind::Mode {
            let rounded = value.round();
            return self
                .options
                .iter()
                .find(|o| {
                    (f64::from(o.value) - rounded).abs() < EPSILON
                        && (value - rounded).abs() < EPSILON
                })
                .map(|o| f64::from(o.value))
                .ok_or_else(|| {
                    DcamError::OutOfRange(format!(
                        "{value} is not an option of {} ({}); allowed: {}",
                        self.name,
                        self.id,
                        self.options
                            .iter()
                            .map(|o| o.value.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                });
        }

        let tolerance = EPSILON * self.max.abs().max(1.0);
        if value < self.min - tolerance || value > self.max + tolerance {
            return Err(DcamError::OutOfRange(format!(
                "{value} outside [{}, {}] for {} ({})",
                self.min, self.max, self.name, self.id
            )));
        }

        let mut snapped = if self.step > 0.0 {
            let k = ((value - self.min) / self.step).round();
            // Trim float noise below the step's resolution.
            let digits = (3.0 - self.step.log10().floor()).clamp(0.0, 15.0);
            let scale = 10f64.powi(digits as i32);
            ((self.min + k * self.step) * scale).round() / scale
        } else {
            value
        };
        if self.kind == ValueKind::Long {
            snapped = snapped.round();
        }
        // Rounding up may land one step past max on a grid that does not
        // end exactly at max.
        if snapped > self.max + tolerance {
            snapped -= self.step;
        }
        Ok(snapped.clamp(self.min, self.max))
    }

    /// Text for `value`: the option label for modes, the number and unit
    /// otherwise.
    #[must_use]
    pub fn value_text(&self, value: f64) -> String {
        match self.kind {
            ValueKind::Mode => self
                .options
                .iter()
                .find(|o| (f64::from(o.value) - value).abs() < EPSILON)
                .map_or_else(|| format!("{value}"), |o| o.text.to_string()),
            ValueKind::Long => match self.unit {
                Some(unit) => format!("{} {unit}", value.round() as i64),
                None => format!("{}", value.round() as i64),
            },
            ValueKind::Real => match self.unit {
                Some(unit) => format!("{value} {unit}"),
                None => format!("{value}"),
            },
        }
    }
}

/// Trigger source values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Internal frame timer.
    Internal = 1,
    /// Hardware trigger input.
    External = 2,
    /// One frame per `fire_trigger`.
    Software = 3,
}

impl TriggerSource {
    /// Decode a property value; unknown values fall back to the default.
    #[must_use]
    pub fn from_value(value: f64) -> Self {
        match value.round() as i32 {
            2 => Self::External,
            3 => Self::Software,
            _ => Self::Internal,
        }
    }
}

/// Sensor readout modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    /// Whole sensor read at once.
    Area = 1,
    /// Time-delay integration in line bundles.
    Tdi = 4,
    /// A band of rows read at once.
    PartialArea = 6,
}

impl SensorMode {
    /// Decode a property value; unknown values fall back to the default.
    #[must_use]
    pub fn from_value(value: f64) -> Self {
        match value.round() as i32 {
            4 => Self::Tdi,
            6 => Self::PartialArea,
            _ => Self::Area,
        }
    }
}

/// Image format derived from the current property values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    /// Pixels per row.
    pub width: usize,
    /// Rows per frame.
    pub height: usize,
    /// Storage bytes per pixel, 1 or 2.
    pub bytes_per_pixel: usize,
    /// Significant bits per pixel.
    pub bits_per_pixel: u32,
    /// Row stride in bytes.
    pub row_bytes: usize,
    /// Bytes per frame.
    pub frame_bytes: usize,
}

impl FrameGeometry {
    /// Tightly packed format; up to 8 bits per pixel take one byte.
    #[must_use]
    pub fn new(width: usize, height: usize, bits_per_pixel: u32) -> Self {
        let bytes_per_pixel = if bits_per_pixel <= 8 { 1 } else { 2 };
        let row_bytes = width * bytes_per_pixel;
        Self {
            width,
            height,
            bytes_per_pixel,
            bits_per_pixel,
            row_bytes,
            frame_bytes: row_bytes * height,
        }
    }

    /// Largest pixel value the format can hold.
    #[must_use]
    pub fn max_value(&self) -> u32 {
        (1u32 << self.bits_per_pixel) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_real_quantizes_to_step() {
        let attr =
            PropertyAttr::real(PropertyId::EXPOSURE_TIME, "EXPOSURE TIME", 1e-5, 10.0, 1e-3, 0.01);
        let applied = attr.quantize(0.01234).unwrap();
        assert!((applied - 0.01201).abs() < 1e-9, "got {applied}");
    }

    #[test]
    fn test_long_snaps_and_rounds() {
        let attr =
            PropertyAttr::long(PropertyId::SUBARRAY_HSIZE, "SUBARRAY HSIZE", 4, 4096, 4, 4096);
        assert_eq!(attr.quantize(101.0).unwrap(), 100.0);
        assert_eq!(attr.quantize(102.0).unwrap(), 104.0);
        assert_eq!(attr.quantize(4096.0).unwrap(), 4096.0);
    }

    #[test]
    fn test_range_checked_before_snapping() {
        let attr = PropertyAttr::long(PropertyId::CONTRAST_GAIN, "CONTRAST GAIN", 0, 100, 1, 0);
        let err = attr.quantize(100.4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(attr.quantize(-1.0).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(attr.quantize(f64::NAN).unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_grid_not_ending_at_max() {
        let attr =
            PropertyAttr::long(PropertyId::LINE_BUNDLE_HEIGHT, "LINE BUNDLE HEIGHT", 8, 100, 8, 8);
        // 100 rounds to 104 on the grid, which is past max.
        assert_eq!(attr.quantize(100.0).unwrap(), 96.0);
    }

    #[test]
    fn test_mode_requires_listed_option() {
        let attr = PropertyAttr::mode(
            PropertyId::BINNING,
            "BINNING",
            vec![ModeOption::new(1, "1X1"), ModeOption::new(2, "2X2"), ModeOption::new(4, "4X4")],
            1,
        );
        assert_eq!(attr.quantize(2.0).unwrap(), 2.0);
        assert_eq!(attr.quantize(3.0).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(attr.quantize(2.5).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(attr.min, 1.0);
        assert_eq!(attr.max, 4.0);
        assert_eq!(attr.value_text(4.0), "4X4");
    }

    #[test]
    fn test_value_text_units() {
        let attr =
            PropertyAttr::real(PropertyId::EXPOSURE_TIME, "EXPOSURE TIME", 0.0, 1.0, 0.0, 0.5)
                .unit("s");
        assert_eq!(attr.value_text(0.25), "0.25 s");
    }

    #[test]
    fn test_geometry_byte_sizes() {
        let g = FrameGeometry::new(2048, 128, 12);
        assert_eq!(g.bytes_per_pixel, 2);
        assert_eq!(g.row_bytes, 4096);
        assert_eq!(g.frame_bytes, 4096 * 128);
        assert_eq!(g.max_value(), 4095);

        let g8 = FrameGeometry::new(64, 64, 8);
        assert_eq!(g8.row_bytes, 64);
        assert_eq!(g8.max_value(), 255);
    }

    #[test]
    fn test_property_id_display() {
        assert_eq!(PropertyId::EXPOSURE_TIME.to_string(), "0x001F0110");
    }
}
