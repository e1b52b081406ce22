//! Property access through sessions: enumeration, writes, gating, device
//! updates, presets and the display LUT.

mod common;

use common::{dcam, open_fast, WAIT};
use dcam_control::{
    CancelToken, CaptureMode, Dcam, DeviceConfig, DeviceRegistry, ErrorKind, Preset, PropertyId,
    ValueKind,
};

/// Single-device registry with a 1 MiB pool budget.
fn single_dcam(device: DeviceConfig) -> Dcam {
    Dcam::with_registry(
        DeviceRegistry::from_config(&[device]),
        &common::acquisition_config(1 << 20),
    )
}

fn large_dcam() -> Dcam {
    single_dcam(DeviceConfig::simulated("C-SIM-256", "S/N: L0", 256, 256))
}

#[test]
fn test_enumeration_is_ordered_and_complete() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();

    let ids: Vec<_> = dcam.property_ids(cam).unwrap().collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(ids.contains(&PropertyId::EXPOSURE_TIME));
    assert!(ids.contains(&PropertyId::IMAGE_FRAMEBYTES));

    // Manual walk agrees with the iterator.
    let mut walked = Vec::new();
    let mut cursor = None;
    while let Some(id) = dcam.next_property_id(cam, cursor).unwrap() {
        walked.push(id);
        cursor = Some(id);
    }
    assert_eq!(walked, ids);

    for id in ids {
        let attr = dcam.property_attr(cam, id).unwrap();
        let value = dcam.get_value(cam, id).unwrap();
        assert!(value >= attr.min && value <= attr.max, "{id} default {value} outside range");
        assert!(!dcam.property_name(cam, id).unwrap().is_empty());
    }
}

#[test]
fn test_unknown_property_not_supported() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    let bogus = PropertyId(0x0FFF_0000);
    assert_eq!(dcam.property_attr(cam, bogus).unwrap_err().kind(), ErrorKind::NotSupported);
    assert_eq!(dcam.get_value(cam, bogus).unwrap_err().kind(), ErrorKind::NotSupported);
    assert_eq!(dcam.set_value(cam, bogus, 1.0).unwrap_err().kind(), ErrorKind::NotSupported);
}

#[test]
fn test_set_returns_applied_value() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();

    let applied = dcam.set_value(cam, PropertyId::EXPOSURE_TIME, 0.002_000_4).unwrap();
    assert_eq!(applied, 0.002);
    assert_eq!(dcam.get_value(cam, PropertyId::EXPOSURE_TIME).unwrap(), applied);

    let attr = dcam.property_attr(cam, PropertyId::BINNING).unwrap();
    assert_eq!(attr.kind, ValueKind::Mode);
    assert_eq!(
        dcam.set_value(cam, PropertyId::BINNING, 3.0).unwrap_err().kind(),
        ErrorKind::OutOfRange
    );
    assert_eq!(
        dcam.set_value(cam, PropertyId::EXPOSURE_TIME, 100.0).unwrap_err().kind(),
        ErrorKind::OutOfRange
    );
    assert_eq!(
        dcam.set_value(cam, PropertyId::EXPOSURE_TIME, f64::NAN).unwrap_err().kind(),
        ErrorKind::OutOfRange
    );

    // Failed writes leave the value alone.
    assert_eq!(dcam.get_value(cam, PropertyId::EXPOSURE_TIME).unwrap(), 0.002);
}

#[test]
fn test_read_only_properties_reject_writes() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    assert!(!dcam.property_attr(cam, PropertyId::IMAGE_WIDTH).unwrap().writable);
    assert_eq!(
        dcam.set_value(cam, PropertyId::IMAGE_WIDTH, 32.0).unwrap_err().kind(),
        ErrorKind::NotSupported
    );
}

#[test]
fn test_value_text() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    assert_eq!(dcam.value_text(cam, PropertyId::BINNING, 2.0).unwrap(), "2X2");
    assert_eq!(dcam.value_text(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap(), "SOFTWARE");
    assert!(dcam.value_text(cam, PropertyId::EXPOSURE_TIME, 0.5).unwrap().contains('s'));
}

#[test]
fn test_format_change_reported_as_update() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    assert!(dcam.query_update(cam).unwrap().is_empty());
    let before = dcam.frame_bytes(cam).unwrap();

    dcam.set_value(cam, PropertyId::BINNING, 2.0).unwrap();
    let updates = dcam.query_update(cam).unwrap();
    assert!(updates.contains(&PropertyId::IMAGE_WIDTH));
    assert!(updates.contains(&PropertyId::IMAGE_FRAMEBYTES));
    assert!(!updates.contains(&PropertyId::BINNING), "caller's own write is not an update");
    assert_eq!(dcam.get_value(cam, PropertyId::IMAGE_WIDTH).unwrap(), 32.0);
    assert_eq!(dcam.frame_bytes(cam).unwrap(), before / 4);

    // Drained.
    assert!(dcam.query_update(cam).unwrap().is_empty());
}

#[test]
fn test_eight_bit_format_changes_data_range() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    assert_eq!(dcam.data_range(cam).unwrap(), (0, 4095));
    dcam.set_value(cam, PropertyId::BIT_PER_CHANNEL, 8.0).unwrap();
    assert_eq!(dcam.data_range(cam).unwrap(), (0, 255));
    assert_eq!(dcam.frame_bytes(cam).unwrap(), 64 * 32);
}

#[test]
fn test_format_locked_while_pool_held() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 2).unwrap();

    assert_eq!(dcam.set_value(cam, PropertyId::BINNING, 2.0).unwrap_err().kind(), ErrorKind::Busy);
    // Exposure may still change.
    dcam.set_value(cam, PropertyId::EXPOSURE_TIME, 0.003).unwrap();
    // Capture-immutable settings are free until capture starts.
    dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 1.0).unwrap();

    dcam.free_buffers(cam).unwrap();
    dcam.set_value(cam, PropertyId::BINNING, 2.0).unwrap();
}

#[test]
fn test_capture_immutable_during_capture() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    assert_eq!(
        dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap_err().kind(),
        ErrorKind::Busy
    );
    dcam.set_value(cam, PropertyId::EXPOSURE_TIME, 0.001).unwrap();
    // Reads are always allowed.
    dcam.get_value(cam, PropertyId::TRIGGER_SOURCE).unwrap();

    dcam.stop_capture(cam).unwrap();
    dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap();
}

#[tokio::test]
async fn test_auto_exposure_drift_reported() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.set_value(cam, PropertyId::EXPOSURE_AUTO, 2.0).unwrap();
    // Drop the frame-rate change caused by our own exposure write.
    dcam.query_update(cam).unwrap();

    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();
    let cancel = CancelToken::new();
    for _ in 0..3 {
        let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
        dcam.unlock_frame(cam, dcam.lock_frame(cam, frame.slot).unwrap()).unwrap();
    }
    dcam.stop_capture(cam).unwrap();

    let updates = dcam.query_update(cam).unwrap();
    assert!(updates.contains(&PropertyId::EXPOSURE_TIME));
    let exposure = dcam.get_value(cam, PropertyId::EXPOSURE_TIME).unwrap();
    assert!(
        exposure > common::FAST_EXPOSURE_S,
        "exposure should move toward the target, got {exposure}"
    );
}

#[test]
fn test_presets() {
    let dcam = large_dcam();
    let cam = dcam.open(0).unwrap();

    dcam.apply_preset(cam, Preset::Tdi).unwrap();
    assert_eq!(dcam.get_value(cam, PropertyId::SENSOR_MODE).unwrap(), 4.0);
    assert_eq!(dcam.get_value(cam, PropertyId::IMAGE_HEIGHT).unwrap(), 128.0);

    dcam.apply_preset(cam, Preset::FocusSweep).unwrap();
    assert_eq!(dcam.get_value(cam, PropertyId::SENSOR_MODE).unwrap(), 6.0);
    assert_eq!(dcam.get_value(cam, PropertyId::EXPOSURE_TIME).unwrap(), 0.001);
    assert_eq!(dcam.get_value(cam, PropertyId::IMAGE_HEIGHT).unwrap(), 64.0);

    dcam.apply_preset(cam, Preset::Area).unwrap();
    assert_eq!(dcam.get_value(cam, PropertyId::IMAGE_HEIGHT).unwrap(), 256.0);
}

#[test]
fn test_preset_stops_at_first_failure() {
    // 32 rows cannot hold a 128-line bundle.
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    let err = dcam.apply_preset(cam, Preset::Tdi).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    // Sensor mode was applied before the failure.
    assert_eq!(dcam.get_value(cam, PropertyId::SENSOR_MODE).unwrap(), 4.0);
}

#[test]
fn test_sensor_shorter_than_a_bundle_has_no_tdi() {
    let device = DeviceConfig::simulated("C-SIM-SHORT", "S/N: S0", 64, 4);
    let dcam = single_dcam(device);
    let cam = dcam.open(0).unwrap();

    assert_eq!(
        dcam.property_attr(cam, PropertyId::LINE_BUNDLE_HEIGHT).unwrap_err().kind(),
        ErrorKind::NotSupported
    );
    for id in dcam.property_ids(cam).unwrap() {
        let attr = dcam.property_attr(cam, id).unwrap();
        let value = dcam.get_value(cam, id).unwrap();
        assert!(attr.min <= attr.max, "{id} has range {}..{}", attr.min, attr.max);
        assert!(value >= attr.min && value <= attr.max, "{id} default {value} outside range");
    }

    assert!(dcam.apply_preset(cam, Preset::Tdi).is_err());
    assert_eq!(dcam.get_value(cam, PropertyId::SENSOR_MODE).unwrap(), 1.0);
    dcam.apply_preset(cam, Preset::Area).unwrap();
}

#[tokio::test]
async fn test_lut_rendering() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    assert_eq!(dcam.set_input_lut_range(cam, 10, 20).unwrap_err().kind(), ErrorKind::OutOfRange);
    assert_eq!(dcam.set_input_lut_range(cam, 5000, 0).unwrap_err().kind(), ErrorKind::OutOfRange);
    assert_eq!(dcam.set_output_lut_range(cam, 300, 0).unwrap_err().kind(), ErrorKind::OutOfRange);

    // Gradient frame 0 spans 0 ..= 63 + 31.
    dcam.set_input_lut_range(cam, 94, 0).unwrap();
    dcam.allocate_buffers(cam, 1).unwrap();
    dcam.start_capture(cam, CaptureMode::Snap).unwrap();
    let frame = dcam.wait_for_frame(cam, WAIT, &CancelToken::new()).await.unwrap();
    assert_eq!(frame.sequence, 0);

    let bits = dcam.lock_bits(cam, frame.slot).unwrap();
    assert_eq!(bits.len(), 64 * 32);
    assert_eq!(bits[0], 0);
    assert_eq!(bits[bits.len() - 1], 255);
}
