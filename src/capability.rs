//! Static per-device feature bits.
//!
//! Capabilities are fixed by the device description and read once when a
//! session opens. Operations that depend on an optional feature check the
//! session's set and fail with `NotSupported` when it is missing.

use crate::error::{DcamError, DcamResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One optional device feature. The discriminant is its stable ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Capability {
    /// External trigger input.
    HardwareTrigger = 0x0001,
    /// Trigger fired by the host (`fire_trigger`).
    SoftwareTrigger = 0x0002,
    /// Capture into caller-owned buffers.
    UserMemory = 0x0004,
    /// On-sensor binning above 1x1.
    Binning = 0x0008,
    /// Region-of-interest readout.
    Subarray = 0x0010,
    /// Input/output LUT for 8-bit display images.
    Lut = 0x0020,
    /// Driver-adjusted exposure.
    AutoExposure = 0x0040,
    /// Vendor extended commands.
    ExtendedCommands = 0x0080,
}

impl Capability {
    /// Every capability, in ID order.
    pub const ALL: [Capability; 8] = [
        Capability::HardwareTrigger,
        Capability::SoftwareTrigger,
        Capability::UserMemory,
        Capability::Binning,
        Capability::Subarray,
        Capability::Lut,
        Capability::AutoExposure,
        Capability::ExtendedCommands,
    ];

    /// Stable integer ID.
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::HardwareTrigger => "hardware trigger",
            Capability::SoftwareTrigger => "software trigger",
            Capability::UserMemory => "user memory",
            Capability::Binning => "binning",
            Capability::Subarray => "subarray",
            Capability::Lut => "lut",
            Capability::AutoExposure => "auto exposure",
            Capability::ExtendedCommands => "extended commands",
        };
        f.write_str(name)
    }
}

/// Set of capabilities reported by one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Set containing every capability.
    #[must_use]
    pub fn all() -> Self {
        Self(Capability::ALL.into_iter().collect())
    }

    /// True if `cap` is present.
    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Fail with `NotSupported` unless `cap` is present.
    pub fn require(&self, cap: Capability) -> DcamResult<()> {
        if self.contains(cap) {
            Ok(())
        } else {
            Err(DcamError::NotSupported(format!("device lacks {cap} capability")))
        }
    }

    /// Bitwise OR of the member IDs, as the raw capability word.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.0.iter().fold(0, |acc, cap| acc | cap.id())
    }

    /// Iterate in ID order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Number of capabilities present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the device has no optional features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_bits_combine_ids() {
        let caps: CapabilitySet = [Capability::HardwareTrigger, Capability::Lut]
            .into_iter()
            .collect();
        assert_eq!(caps.bits(), 0x0021);
    }

    #[test]
    fn test_require_missing_capability() {
        let caps: CapabilitySet = [Capability::Binning].into_iter().collect();
        assert!(caps.require(Capability::Binning).is_ok());

        let err = caps.require(Capability::SoftwareTrigger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(err.to_string().contains("software trigger"));
    }

    #[test]
    fn test_all_has_every_capability() {
        let caps = CapabilitySet::all();
        assert_eq!(caps.len(), Capability::ALL.len());
        assert_eq!(caps.bits(), 0x00FF);
    }
}
