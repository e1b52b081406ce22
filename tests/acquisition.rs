//! Acquisition through the public API: buffer pools, capture modes,
//! frame waits, locks and fault recovery.

mod common;

use common::{
    dcam, dcam_with_budget, dcam_with_sensor, open_fast, small_device, wait_for_state,
    wait_for_status, Script, ScriptedSensor, WAIT,
};
use dcam_control::{
    CancelToken, CaptureMode, CaptureState, DcamError, ErrorKind, PropertyId, SensorFault,
    SessionState, Status,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

const FRAME_BYTES: usize = 64 * 32 * 2;

#[test]
fn test_allocate_and_free() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    assert_eq!(dcam.frame_bytes(cam).unwrap(), FRAME_BYTES);

    dcam.allocate_buffers(cam, 4).unwrap();
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Armed);
    assert_eq!(dcam.status(cam).unwrap(), Status::Ready);
    assert_eq!(dcam.frame_count(cam).unwrap(), 4);
    assert_eq!(dcam.pool_bytes_in_use(), 4 * FRAME_BYTES);

    // Only one pool at a time.
    assert_eq!(dcam.allocate_buffers(cam, 2).unwrap_err().kind(), ErrorKind::InvalidState);

    dcam.free_buffers(cam).unwrap();
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Idle);
    assert_eq!(dcam.pool_bytes_in_use(), 0);
    assert_eq!(dcam.free_buffers(cam).unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_allocate_zero_rejected() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    assert_eq!(dcam.allocate_buffers(cam, 0).unwrap_err().kind(), ErrorKind::OutOfRange);
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Idle);
}

#[test]
fn test_out_of_memory_rolls_back() {
    let dcam = dcam_with_budget(3 * FRAME_BYTES + 100);
    let cam = open_fast(&dcam, 0);

    let err = dcam.allocate_buffers(cam, 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(dcam.pool_bytes_in_use(), 0);
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Idle);

    dcam.allocate_buffers(cam, 3).unwrap();

    // The budget is shared between sessions.
    let other = open_fast(&dcam, 1);
    assert_eq!(dcam.allocate_buffers(other, 1).unwrap_err().kind(), ErrorKind::OutOfMemory);
}

#[test]
fn test_start_requires_buffers() {
    let dcam = dcam();
    let cam = dcam.open(0).unwrap();
    assert_eq!(
        dcam.start_capture(cam, CaptureMode::Sequence).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(dcam.stop_capture(cam).unwrap_err().kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_wait_outside_capture_is_invalid_state() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    let cancel = CancelToken::new();
    assert!(matches!(
        dcam.wait_for_frame(cam, WAIT, &cancel).await,
        Err(DcamError::InvalidState(_))
    ));

    dcam.allocate_buffers(cam, 2).unwrap();
    assert!(matches!(
        dcam.wait_for_frame(cam, WAIT, &cancel).await,
        Err(DcamError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_software_trigger_fills_slots_in_order() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap();
    dcam.allocate_buffers(cam, 4).unwrap();

    assert_eq!(dcam.fire_trigger(cam).unwrap_err().kind(), ErrorKind::InvalidState);
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();
    // Unstable until the engine runs, then Busy even with no trigger fired.
    assert!(wait_for_status(&dcam, cam, Status::Busy, &[Status::Unstable]).unwrap());

    let cancel = CancelToken::new();
    let mut slots = Vec::new();
    for expected in 0..5u64 {
        dcam.fire_trigger(cam).unwrap();
        let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
        assert_eq!(frame.sequence, expected);
        slots.push(frame.slot);

        let info = dcam.transfer_info(cam).unwrap();
        assert_eq!(info.total_frames_captured, expected + 1);
        assert_eq!(info.newest_frame_index, Some(frame.slot));
    }
    assert_eq!(slots, vec![0, 1, 2, 3, 0]);

    dcam.stop_capture(cam).unwrap();
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Stopped);
    // Stopping twice is harmless.
    dcam.stop_capture(cam).unwrap();
}

#[tokio::test]
async fn test_free_running_sequence_counts_up() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 3).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let cancel = CancelToken::new();
    let mut last = None;
    let mut last_total = 0;
    for _ in 0..8 {
        // Frames already counted by the last total may still be queued.
        let frame = loop {
            let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
            if frame.sequence >= last_total {
                break frame;
            }
        };
        assert!(last.map_or(true, |prev| frame.sequence > prev));
        assert_eq!(frame.slot as u64, frame.sequence % 3);
        last = Some(frame.sequence);

        let lock = dcam.lock_frame(cam, frame.slot).unwrap();
        assert!(lock.sequence() >= frame.sequence);
        assert_eq!(lock.data().len(), FRAME_BYTES);
        assert_eq!(lock.row_bytes(), 64 * 2);
        assert!((lock.exposure_s() - common::FAST_EXPOSURE_S).abs() < 1e-9);
        dcam.unlock_frame(cam, lock).unwrap();

        let total = dcam.transfer_info(cam).unwrap().total_frames_captured;
        assert!(total > last_total);
        last_total = total;
    }
    dcam.stop_capture(cam).unwrap();
    dcam.free_buffers(cam).unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_overrun_reader_skips_ahead() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let cancel = CancelToken::new();
    let mut last = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap().sequence;
    let mut last_total = dcam.transfer_info(cam).unwrap().total_frames_captured;
    for _ in 0..4 {
        // Fall many frames behind a two-slot ring.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
        let total = dcam.transfer_info(cam).unwrap().total_frames_captured;

        assert!(frame.sequence > last + 1, "reader did not skip: {last} -> {}", frame.sequence);
        assert_eq!(frame.slot as u64, frame.sequence % 2);
        assert!(total > last_total);
        last = frame.sequence;
        last_total = total;
    }
    dcam.stop_capture(cam).unwrap();

    assert!(logs_contain("Reader overrun"));
}

#[tokio::test]
async fn test_snap_fills_ring_once() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 3).unwrap();
    dcam.start_capture(cam, CaptureMode::Snap).unwrap();

    let cancel = CancelToken::new();
    for expected in 0..3u64 {
        let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
        assert_eq!(frame.sequence, expected);
    }
    assert!(wait_for_state(&dcam, cam, CaptureState::Stopped).unwrap());
    assert_eq!(dcam.transfer_info(cam).unwrap().total_frames_captured, 3);
    assert!(matches!(
        dcam.wait_for_frame(cam, WAIT, &cancel).await,
        Err(DcamError::InvalidState(_))
    ));

    // A stopped pool can be started again; counters restart.
    dcam.start_capture(cam, CaptureMode::Snap).unwrap();
    let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
    assert_eq!(frame.sequence, 0);
}

#[tokio::test]
async fn test_stop_releases_pending_wait() {
    let dcam = Arc::new(dcam());
    let cam = open_fast(&dcam, 0);
    dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap();
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let waiter = {
        let dcam = Arc::clone(&dcam);
        tokio::spawn(async move { dcam.wait_for_frame(cam, WAIT, &CancelToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    dcam.stop_capture(cam).unwrap();

    let result = waiter.await.unwrap();
    assert_eq!(result, Err(DcamError::Cancelled));
    assert_eq!(dcam.last_error(cam), Some(DcamError::Cancelled));
}

#[tokio::test]
async fn test_timeout_does_not_consume_frame() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap();
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let cancel = CancelToken::new();
    let timeout = Duration::from_millis(30);
    assert_eq!(
        dcam.wait_for_frame(cam, timeout, &cancel).await,
        Err(DcamError::Timeout(timeout))
    );
    // Capture is unaffected by a timed-out wait.
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Capturing);

    dcam.fire_trigger(cam).unwrap();
    let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
    assert_eq!(frame.sequence, 0);
}

#[tokio::test]
async fn test_cancel_token_aborts_wait() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.set_value(cam, PropertyId::TRIGGER_SOURCE, 3.0).unwrap();
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    assert_eq!(dcam.wait_for_frame(cam, WAIT, &cancel).await, Err(DcamError::Cancelled));
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Capturing);

    // An already cancelled token fails at once.
    assert_eq!(
        dcam.wait_for_frame(cam, WAIT, &cancel).await,
        Err(DcamError::Cancelled)
    );
}

#[tokio::test]
async fn test_locked_frame_blocks_release_and_writer() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let cancel = CancelToken::new();
    let frame = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
    let lock = dcam.lock_frame(cam, frame.slot).unwrap();
    let held = lock.sequence();

    // The writer cannot get past the locked slot.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let stalled = dcam.transfer_info(cam).unwrap().total_frames_captured;
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(dcam.transfer_info(cam).unwrap().total_frames_captured, stalled);
    assert_eq!(lock.sequence(), held);

    dcam.stop_capture(cam).unwrap();
    assert_eq!(dcam.free_buffers(cam).unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(dcam.reset(cam).unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(
        dcam.start_capture(cam, CaptureMode::Sequence).unwrap_err().kind(),
        ErrorKind::Busy
    );

    dcam.unlock_frame(cam, lock).unwrap();
    dcam.free_buffers(cam).unwrap();
    assert_eq!(dcam.pool_bytes_in_use(), 0);
}

#[test]
fn test_lock_empty_or_missing_slot() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    assert_eq!(dcam.lock_frame(cam, 0).unwrap_err().kind(), ErrorKind::InvalidState);
    dcam.allocate_buffers(cam, 2).unwrap();
    assert_eq!(dcam.lock_frame(cam, 0).unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(dcam.lock_frame(cam, 9).unwrap_err().kind(), ErrorKind::OutOfRange);
}

#[tokio::test]
async fn test_attach_and_detach_user_buffers() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);

    let too_small = vec![vec![0u8; 16]; 2];
    assert_eq!(dcam.attach_buffers(cam, too_small, 16).unwrap_err().kind(), ErrorKind::OutOfRange);

    let buffers = vec![vec![0u8; FRAME_BYTES]; 3];
    dcam.attach_buffers(cam, buffers, FRAME_BYTES).unwrap();
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Armed);
    assert_eq!(dcam.pool_bytes_in_use(), 0, "attached memory is not charged");
    assert_eq!(dcam.free_buffers(cam).unwrap_err().kind(), ErrorKind::InvalidState);

    dcam.start_capture(cam, CaptureMode::Snap).unwrap();
    let cancel = CancelToken::new();
    for _ in 0..3 {
        dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
    }
    assert!(wait_for_state(&dcam, cam, CaptureState::Stopped).unwrap());

    let returned = dcam.detach_buffers(cam).unwrap();
    assert_eq!(returned.len(), 3);
    assert!(returned.iter().all(|b| b.len() == FRAME_BYTES));
    // Gradient frames are not all zero.
    assert!(returned.iter().all(|b| b.iter().any(|&px| px != 0)));
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Idle);

    dcam.allocate_buffers(cam, 1).unwrap();
    assert_eq!(dcam.detach_buffers(cam).unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_allocated_and_attached_pools_exclude_each_other() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);

    dcam.attach_buffers(cam, vec![vec![0u8; FRAME_BYTES]; 2], FRAME_BYTES).unwrap();
    assert_eq!(dcam.allocate_buffers(cam, 2).unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(dcam.last_error(cam).map(|e| e.kind()), Some(ErrorKind::InvalidState));
    assert_eq!(dcam.pool_bytes_in_use(), 0);
    assert_eq!(dcam.detach_buffers(cam).unwrap().len(), 2);

    dcam.allocate_buffers(cam, 2).unwrap();
    let err = dcam
        .attach_buffers(cam, vec![vec![0u8; FRAME_BYTES]; 2], FRAME_BYTES)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(dcam.frame_count(cam).unwrap(), 2);
    assert_eq!(dcam.pool_bytes_in_use(), 2 * FRAME_BYTES);
}

#[tokio::test]
async fn test_transient_fault_recovers_with_reset() {
    let device = small_device("S/N: FLAKY");
    let sensor = Arc::new(ScriptedSensor::new(
        &device,
        Script::FailAfter {
            after: 2,
            fault: SensorFault::Transient("readout overflow".into()),
        },
    ));
    let dcam = dcam_with_sensor(device, sensor.clone());
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 4).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let cancel = CancelToken::new();
    assert_eq!(dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap().sequence, 0);
    assert_eq!(dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap().sequence, 1);
    let err = dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(sensor.exposed(), 2);

    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Error);
    assert_eq!(dcam.status(cam).unwrap(), Status::Error);
    assert_eq!(dcam.session_state(cam), SessionState::Open);

    dcam.reset(cam).unwrap();
    assert_eq!(dcam.capture_state(cam).unwrap(), CaptureState::Idle);
    assert_eq!(dcam.pool_bytes_in_use(), 0);
    dcam.allocate_buffers(cam, 2).unwrap();
}

#[tokio::test]
async fn test_fatal_fault_during_capture() {
    let device = small_device("S/N: DEAD");
    let sensor = Arc::new(ScriptedSensor::new(
        &device,
        Script::FailAfter {
            after: 0,
            fault: SensorFault::Fatal("link down".into()),
        },
    ));
    let dcam = dcam_with_sensor(device, sensor);
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Sequence).unwrap();

    let err = dcam.wait_for_frame(cam, WAIT, &CancelToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(dcam.session_state(cam), SessionState::Error);
    assert_eq!(dcam.allocate_buffers(cam, 1).unwrap_err().kind(), ErrorKind::InvalidState);
    dcam.close(cam).unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_capture_lifecycle_is_logged() {
    let dcam = dcam();
    let cam = open_fast(&dcam, 0);
    dcam.allocate_buffers(cam, 2).unwrap();
    dcam.start_capture(cam, CaptureMode::Snap).unwrap();
    let cancel = CancelToken::new();
    dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
    dcam.wait_for_frame(cam, WAIT, &cancel).await.unwrap();
    assert!(wait_for_state(&dcam, cam, CaptureState::Stopped).unwrap());
    dcam.close(cam).unwrap();

    assert!(logs_contain("Buffers allocated"));
    assert!(logs_contain("Session closed"));
}
