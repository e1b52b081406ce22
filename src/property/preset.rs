//! Named batches of property values for common imaging modes.

use super::PropertyId;
use std::fmt;
use std::str::FromStr;

/// Imaging mode presets, applied in order by `Dcam::apply_preset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Plain full-area readout.
    Area,
    /// Time-delay integration with 128-row bundles.
    Tdi,
    /// Short partial-area exposures for focus scanning.
    FocusSweep,
}

impl Preset {
    /// Property writes making up the preset, in application order.
    #[must_use]
    pub fn values(self) -> &'static [(PropertyId, f64)] {
        match self {
            Preset::Area => &[(PropertyId::SENSOR_MODE, 1.0)],
            Preset::Tdi => &[
                (PropertyId::SENSOR_MODE, 4.0),
                (PropertyId::LINE_BUNDLE_HEIGHT, 128.0),
            ],
            Preset::FocusSweep => &[
                (PropertyId::SENSOR_MODE, 6.0),
                (PropertyId::EXPOSURE_TIME, 0.001),
                (PropertyId::PARTIAL_AREA_VSIZE, 64.0),
            ],
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Preset::Area => "area",
            Preset::Tdi => "tdi",
            Preset::FocusSweep => "focus-sweep",
        })
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "area" => Ok(Preset::Area),
            "tdi" => Ok(Preset::Tdi),
            "focus-sweep" | "focus_sweep" | "focussweep" => Ok(Preset::FocusSweep),
            other => Err(format!("unknown preset '{other}' (expected area, tdi or focus-sweep)")),
        }
    }
}
