// SPDX-License-Identifier: GPL-3.0-only

//! Crate-wide constants

use std::time::Duration;

/// Number of frame buffers in a session's pool.
///
/// One slot is being filled by the sensor, one is being read by the capture
/// thread and one holds the newest undelivered frame.
pub const FRAME_POOL_SIZE: usize = 3;

/// How often to emit per-frame diagnostic log messages (every Nth frame).
pub const LOG_EVERY_N_FRAMES: u64 = 30;

/// How long the capture thread waits for a frame before re-checking its stop flag
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on `DeviceHandle::wait_for_initialization`
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the in-flight capture drain during session close
pub const DEFAULT_CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on graphics-side cleanup confirmation during session close
pub const DEFAULT_GRAPHICS_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of lifecycle event history replayed to late subscribers
pub const LIFECYCLE_EVENT_HISTORY: usize = 64;

/// Capacity of the live frame event channel
pub const FRAME_EVENT_CAPACITY: usize = 64;

/// Default simulated sensor frame interval (~30 fps)
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Camera2 `CameraDevice.StateCallback` error codes
pub mod device_error {
    /// The camera device is in use already
    pub const CAMERA_IN_USE: i32 = 1;
    /// Too many other open camera devices
    pub const MAX_CAMERAS_IN_USE: i32 = 2;
    /// The camera is disabled by device policy
    pub const CAMERA_DISABLED: i32 = 3;
    /// The camera device has encountered a fatal error
    pub const CAMERA_DEVICE: i32 = 4;
    /// The camera service has encountered a fatal error
    pub const CAMERA_SERVICE: i32 = 5;
    /// The device was disconnected while in use
    pub const CAMERA_DISCONNECTED: i32 = 100;
    /// Camera permission was not granted or was revoked
    pub const ACCESS_DENIED: i32 = 101;
    /// The platform raised a security violation
    pub const SECURITY: i32 = 102;
    /// No camera with the requested id exists
    pub const UNKNOWN_CAMERA: i32 = 103;
    /// The request referenced an output that is not part of the session
    pub const INVALID_REQUEST: i32 = 104;
}

/// Render event ids, shared with the graphics command queue logs
pub mod render_event {
    /// Allocate an external texture binding
    pub const SETUP: i32 = 1;
    /// Release an external texture binding
    pub const CLEANUP: i32 = 2;
    /// Latch and blit the newest external image
    pub const RENDER: i32 = 3;
    /// Run the YUV compute conversion
    pub const CONVERT: i32 = 4;
    /// Register a binding for per-frame updates
    pub const REGISTER: i32 = 5;
}
