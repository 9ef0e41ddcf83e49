// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use ucamera::constants::{
    CAPTURE_POLL_INTERVAL, DEFAULT_CLOSE_DRAIN_TIMEOUT, DEFAULT_INIT_TIMEOUT, FRAME_POOL_SIZE,
    device_error, render_event,
};

#[test]
fn test_frame_pool_is_triple_buffered() {
    // Writer, reader and one latest-frame slot
    assert_eq!(FRAME_POOL_SIZE, 3);
}

#[test]
fn test_timeouts_are_ordered() {
    // The capture thread re-checks its stop flag well inside any close bound
    assert!(CAPTURE_POLL_INTERVAL < DEFAULT_CLOSE_DRAIN_TIMEOUT);
    assert!(DEFAULT_CLOSE_DRAIN_TIMEOUT <= DEFAULT_INIT_TIMEOUT);
}

#[test]
fn test_camera2_error_codes() {
    // Values match CameraDevice.StateCallback
    assert_eq!(device_error::CAMERA_IN_USE, 1);
    assert_eq!(device_error::MAX_CAMERAS_IN_USE, 2);
    assert_eq!(device_error::CAMERA_DISABLED, 3);
    assert_eq!(device_error::CAMERA_DEVICE, 4);
    assert_eq!(device_error::CAMERA_SERVICE, 5);
}

#[test]
fn test_render_event_ids_are_distinct() {
    let ids = [
        render_event::SETUP,
        render_event::CLEANUP,
        render_event::RENDER,
        render_event::CONVERT,
        render_event::REGISTER,
    ];
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            assert_ne!(a, b, "Render event ids must be unique");
        }
    }
}
