// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture pipeline
//!
//! Expected failures (camera busy, session not ready) never travel through
//! these types to the caller; they are folded into state transitions, events
//! and `Option`/`bool` returns. What remains here is what a caller has to
//! handle: platform failures reported by the hardware layer, graphics-side
//! failures, and misuse of a disposed handle.

use crate::constants::device_error;
use thiserror::Error;

/// Result type alias using CameraError
pub type CameraResult<T> = Result<T, CameraError>;

/// Failures reported by the camera platform
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The camera is already opened by another client
    #[error("camera is already in use")]
    CameraInUse,
    /// The platform limit on concurrently open cameras was hit
    #[error("maximum number of open cameras reached")]
    MaxCamerasInUse,
    /// Device policy disables the camera
    #[error("camera disabled by policy")]
    CameraDisabled,
    /// Fatal error inside the camera device
    #[error("fatal camera device error")]
    CameraDevice,
    /// Fatal error inside the camera service
    #[error("fatal camera service error")]
    CameraService,
    /// The camera disappeared while in use
    #[error("camera disconnected")]
    Disconnected,
    /// Permission was denied or revoked
    #[error("camera access denied: {0}")]
    AccessDenied(String),
    /// The platform raised a security exception
    #[error("security violation: {0}")]
    Security(String),
    /// No camera with this id exists
    #[error("unknown camera '{0}'")]
    UnknownCamera(String),
    /// The request was malformed for the session it was issued on
    #[error("invalid capture request: {0}")]
    InvalidRequest(String),
}

impl PlatformError {
    /// Numeric code surfaced with terminal events
    pub fn code(&self) -> i32 {
        match self {
            PlatformError::CameraInUse => device_error::CAMERA_IN_USE,
            PlatformError::MaxCamerasInUse => device_error::MAX_CAMERAS_IN_USE,
            PlatformError::CameraDisabled => device_error::CAMERA_DISABLED,
            PlatformError::CameraDevice => device_error::CAMERA_DEVICE,
            PlatformError::CameraService => device_error::CAMERA_SERVICE,
            PlatformError::Disconnected => device_error::CAMERA_DISCONNECTED,
            PlatformError::AccessDenied(_) => device_error::ACCESS_DENIED,
            PlatformError::Security(_) => device_error::SECURITY,
            PlatformError::UnknownCamera(_) => device_error::UNKNOWN_CAMERA,
            PlatformError::InvalidRequest(_) => device_error::INVALID_REQUEST,
        }
    }

    /// Access and security failures are terminal for the handle that saw them.
    pub fn is_access_or_security(&self) -> bool {
        matches!(
            self,
            PlatformError::AccessDenied(_)
                | PlatformError::Security(_)
                | PlatformError::CameraDisabled
        )
    }

    /// Failures a caller is expected to retry after a while
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::CameraInUse | PlatformError::MaxCamerasInUse
        )
    }
}

/// Failures on the graphics command thread
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// No usable graphics backend could be created
    #[error("render backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The session already owns a texture binding
    #[error("session already has a texture binding")]
    AlreadyRegistered,
    /// Registering the binding for per-frame updates failed
    #[error("texture registration failed: {0}")]
    RegistrationFailed(String),
    /// The binding id is not (or no longer) known
    #[error("unknown texture binding {0}")]
    UnknownBinding(u64),
    /// The texture id is not (or no longer) known
    #[error("unknown texture {0}")]
    UnknownTexture(u64),
    /// The GPU rejected an operation
    #[error("GPU error: {0}")]
    Gpu(String),
    /// The render thread has exited
    #[error("render queue is closed")]
    QueueClosed,
}

/// Main crate error type
#[derive(Debug, Clone, Error)]
pub enum CameraError {
    /// Operation on a disposed handle or session; this is a caller bug
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Platform-level failure
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    /// Graphics-side failure
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(String),
    /// The caller abandoned a wait
    #[error("wait cancelled")]
    Cancelled,
    /// A bounded wait elapsed
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CameraError {
    fn from(err: serde_json::Error) -> Self {
        CameraError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_codes() {
        assert_eq!(PlatformError::CameraInUse.code(), 1);
        assert_eq!(PlatformError::MaxCamerasInUse.code(), 2);
        assert_eq!(PlatformError::CameraService.code(), 5);
        assert_ne!(
            PlatformError::Disconnected.code(),
            PlatformError::CameraDevice.code()
        );
    }

    #[test]
    fn test_access_errors_are_terminal() {
        assert!(PlatformError::AccessDenied("revoked".into()).is_access_or_security());
        assert!(PlatformError::Security("selinux".into()).is_access_or_security());
        assert!(!PlatformError::CameraInUse.is_access_or_security());
        assert!(PlatformError::CameraInUse.is_transient());
        assert!(!PlatformError::Disconnected.is_transient());
    }

    #[test]
    fn test_error_conversion() {
        let err: CameraError = RenderError::QueueClosed.into();
        assert!(matches!(err, CameraError::Render(RenderError::QueueClosed)));
        assert_eq!(err.to_string(), "render error: render queue is closed");
    }
}
