//! Per-device property table.
//!
//! Which properties exist, and which options they offer, depends on the
//! device's sensor size, bit depth and capabilities. A property a device
//! does not offer is simply absent, so reads and writes of it fail with
//! `NotSupported`.

use super::{ModeOption, PropertyAttr, PropertyId};
use crate::capability::{Capability, CapabilitySet};
use crate::config::DeviceConfig;

/// Rows per line-bundle step in TDI mode.
const BUNDLE_STEP: i64 = 8;
const DEFAULT_BUNDLE_HEIGHT: i64 = 128;

/// Build the attribute table for one device, ordered by ID.
#[must_use]
pub fn build(device: &DeviceConfig, caps: &CapabilitySet) -> Vec<PropertyAttr> {
    let width = i64::from(device.width);
    let height = i64::from(device.height);
    let mut attrs = Vec::new();

    let mut sources = vec![ModeOption::new(1, "INTERNAL")];
    if caps.contains(Capability::HardwareTrigger) {
        sources.push(ModeOption::new(2, "EXTERNAL"));
    }
    if caps.contains(Capability::SoftwareTrigger) {
        sources.push(ModeOption::new(3, "SOFTWARE"));
    }
    attrs.push(PropertyAttr::mode(PropertyId::TRIGGER_SOURCE, "TRIGGER SOURCE", sources, 1));

    if caps.contains(Capability::HardwareTrigger) {
        attrs.push(PropertyAttr::mode(
            PropertyId::TRIGGER_ACTIVE,
            "TRIGGER ACTIVE",
            vec![ModeOption::new(1, "EDGE"), ModeOption::new(2, "LEVEL")],
            1,
        ));
        attrs.push(PropertyAttr::mode(
            PropertyId::TRIGGER_POLARITY,
            "TRIGGER POLARITY",
            vec![ModeOption::new(1, "NEGATIVE"), ModeOption::new(2, "POSITIVE")],
            2,
        ));
    }

    attrs.push(
        PropertyAttr::real(PropertyId::EXPOSURE_TIME, "EXPOSURE TIME", 1e-5, 10.0, 1e-6, 0.01)
            .unit("s"),
    );

    if caps.contains(Capability::AutoExposure) {
        attrs.push(
            PropertyAttr::mode(
                PropertyId::EXPOSURE_AUTO,
                "EXPOSURE AUTO",
                vec![ModeOption::new(1, "OFF"), ModeOption::new(2, "ON")],
                1,
            )
            .capture_immutable(false),
        );
    }

    attrs.push(
        PropertyAttr::long(PropertyId::CONTRAST_GAIN, "CONTRAST GAIN", 0, 100, 1, 0).unit("dB"),
    );

    // A line bundle needs at least one step of rows.
    let bundle_max = height - height % BUNDLE_STEP;
    let tdi = bundle_max >= BUNDLE_STEP;

    let mut modes = vec![ModeOption::new(1, "AREA")];
    if tdi {
        modes.push(ModeOption::new(4, "TDI"));
    }
    modes.push(ModeOption::new(6, "PARTIAL AREA"));
    attrs.push(
        PropertyAttr::mode(PropertyId::SENSOR_MODE, "SENSOR MODE", modes, 1).affects_format(),
    );

    if tdi {
        attrs.push(
            PropertyAttr::long(
                PropertyId::LINE_BUNDLE_HEIGHT,
                "SENSOR MODE LINE BUNDLE HEIGHT",
                BUNDLE_STEP,
                bundle_max,
                BUNDLE_STEP,
                DEFAULT_BUNDLE_HEIGHT.min(bundle_max),
            )
            .affects_format(),
        );
    }

    let mut binnings = vec![ModeOption::new(1, "1X1")];
    if caps.contains(Capability::Binning) {
        binnings.push(ModeOption::new(2, "2X2"));
        binnings.push(ModeOption::new(4, "4X4"));
    }
    attrs.push(PropertyAttr::mode(PropertyId::BINNING, "BINNING", binnings, 1).affects_format());

    if caps.contains(Capability::Subarray) {
        attrs.push(
            PropertyAttr::long(PropertyId::SUBARRAY_HPOS, "SUBARRAY HPOS", 0, width - 4, 4, 0)
                .affects_format(),
        );
        attrs.push(
            PropertyAttr::long(PropertyId::SUBARRAY_HSIZE, "SUBARRAY HSIZE", 4, width, 4, width)
                .affects_format(),
        );
        attrs.push(
            PropertyAttr::long(PropertyId::SUBARRAY_VPOS, "SUBARRAY VPOS", 0, height - 4, 4, 0)
                .affects_format(),
        );
        attrs.push(
            PropertyAttr::long(
                PropertyId::SUBARRAY_VSIZE,
                "SUBARRAY VSIZE",
                4,
                height,
                4,
                height,
            )
            .affects_format(),
        );
        attrs.push(
            PropertyAttr::mode(
                PropertyId::SUBARRAY_MODE,
                "SUBARRAY MODE",
                vec![ModeOption::new(1, "OFF"), ModeOption::new(2, "ON")],
                1,
            )
            .affects_format(),
        );
    }

    attrs.push(
        PropertyAttr::long(
            PropertyId::PARTIAL_AREA_VSIZE,
            "PARTIAL AREA VSIZE",
            4,
            height,
            4,
            64.min(height),
        )
        .affects_format(),
    );

    attrs.push(
        PropertyAttr::real(
            PropertyId::TIMING_READOUT_TIME,
            "TIMING READOUT TIME",
            0.0,
            10.0,
            0.0,
            0.0,
        )
        .unit("s")
        .read_only(),
    );
    attrs.push(
        PropertyAttr::real(
            PropertyId::INTERNAL_FRAME_RATE,
            "INTERNAL FRAME RATE",
            0.0,
            1e6,
            0.0,
            0.0,
        )
        .unit("Hz")
        .read_only(),
    );

    let max_frame = width * height * 2;
    attrs.push(
        PropertyAttr::long(PropertyId::IMAGE_WIDTH, "IMAGE WIDTH", 0, width, 1, width).read_only(),
    );
    attrs.push(
        PropertyAttr::long(PropertyId::IMAGE_HEIGHT, "IMAGE HEIGHT", 0, height, 1, height)
            .read_only(),
    );
    attrs.push(
        PropertyAttr::long(PropertyId::IMAGE_ROWBYTES, "IMAGE ROWBYTES", 0, width * 2, 1, 0)
            .read_only(),
    );
    attrs.push(
        PropertyAttr::long(PropertyId::IMAGE_FRAMEBYTES, "IMAGE FRAMEBYTES", 0, max_frame, 1, 0)
            .read_only(),
    );

    let native = device.bit_depth as i32;
    let mut depths = vec![ModeOption::new(8, "8")];
    if native != 8 {
        depths.push(ModeOption::new(native, native_depth_text(native)));
    }
    attrs.push(
        PropertyAttr::mode(PropertyId::BIT_PER_CHANNEL, "BIT PER CHANNEL", depths, native)
            .affects_format(),
    );

    attrs.sort_by_key(|a| a.id);
    attrs
}

fn native_depth_text(bits: i32) -> &'static str {
    match bits {
        9 => "9",
        10 => "10",
        11 => "11",
        12 => "12",
        13 => "13",
        14 => "14",
        15 => "15",
        _ => "16",
    }
}
