// SPDX-License-Identifier: GPL-3.0-only

//! Camera platform abstraction
//!
//! The traits here model a Camera2-style hardware stack. Opening a device,
//! creating a capture session and closing either are asynchronous: the
//! platform reports completion by invoking callbacks on a thread it owns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  DeviceHandle /      │  ← lifecycle state machines (crate::session)
//! │  SessionController   │
//! └──────────┬───────────┘
//!            │ open_device / create_capture_session / requests
//!            ▼
//! ┌──────────────────────┐
//! │  CameraPlatform      │  ← this module
//! └──────────┬───────────┘
//!            │ callbacks on platform threads
//!            ▼
//!     ┌───────────────┐
//!     │ VirtualCamera │  ← simulated implementation
//!     └───────────────┘
//! ```

pub mod types;

pub use types::*;

use crate::errors::PlatformError;
use crate::frame::FrameProducer;
use crate::render::ExternalSurface;
use std::sync::Arc;

/// Entry point of a camera stack
pub trait CameraPlatform: Send + Sync {
    /// Human-readable platform name for logs
    fn name(&self) -> &str;

    /// Ids of the cameras this platform can open
    fn camera_ids(&self) -> Vec<String>;

    /// Begin opening a camera.
    ///
    /// Completion is reported through `callbacks`. An `Err` here means the
    /// request was rejected before any hardware I/O started.
    fn open_device(
        &self,
        camera_id: &str,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Result<(), PlatformError>;
}

/// Device state notifications, invoked on a platform thread
pub trait DeviceCallbacks: Send + Sync {
    /// The device is open and ready for session creation
    fn on_opened(&self, device: Arc<dyn PlatformDevice>);

    /// The device is no longer available
    fn on_disconnected(&self);

    /// The device hit an error; the connection is unusable afterwards
    fn on_error(&self, error: PlatformError);

    /// A `close()` on the device has completed
    fn on_closed(&self);
}

/// An open camera connection
pub trait PlatformDevice: Send + Sync {
    fn id(&self) -> &str;

    /// Begin configuring a capture session with the given outputs.
    ///
    /// Completion is reported through `callbacks`. A synchronous `Err` means
    /// the platform refused outright and no session object will follow.
    fn create_capture_session(
        &self,
        outputs: Vec<SessionOutput>,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<(), PlatformError>;

    /// Release the connection. Idempotent; `on_closed` follows once.
    fn close(&self);
}

/// Session state notifications, invoked on a platform thread
pub trait SessionCallbacks: Send + Sync {
    fn on_configured(&self, session: Arc<dyn PlatformSession>);

    fn on_configure_failed(&self);

    /// Frames for the current requests are flowing
    fn on_active(&self);

    /// No requests are in flight
    fn on_ready(&self);

    /// A `close()` on the session has completed
    fn on_closed(&self);
}

/// A configured capture session
pub trait PlatformSession: Send + Sync {
    /// Replace the repeating request. Returns the sequence id.
    fn set_repeating_request(&self, request: CaptureRequest) -> Result<u64, PlatformError>;

    /// Queue a one-shot request alongside any repeating one
    fn capture(&self, request: CaptureRequest) -> Result<u64, PlatformError>;

    /// Stop the repeating request; in-flight captures still complete
    fn stop_repeating(&self) -> Result<(), PlatformError>;

    /// Release the session. Idempotent; `on_closed` follows once.
    fn close(&self);
}

/// Identifies one of a session's outputs within capture requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub u32);

/// Where the hardware writes frames for one session output
#[derive(Clone)]
pub enum OutputTarget {
    /// Raw planes into a session's frame pool
    Frames(FrameProducer),
    /// Directly into an external texture
    Surface(ExternalSurface),
    /// Sink that discards frames; keeps a background stream alive
    Discard,
}

impl std::fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputTarget::Frames(_) => write!(f, "OutputTarget::Frames"),
            OutputTarget::Surface(s) => write!(f, "OutputTarget::Surface({:?})", s.id()),
            OutputTarget::Discard => write!(f, "OutputTarget::Discard"),
        }
    }
}

/// An output registered with a session at creation time
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub id: TargetId,
    pub resolution: Resolution,
    pub target: OutputTarget,
}

/// A capture request: an intent plus the outputs it writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub template: CaptureTemplate,
    pub targets: Vec<TargetId>,
}

impl CaptureRequest {
    pub fn new(template: CaptureTemplate, target: TargetId) -> Self {
        Self {
            template,
            targets: vec![target],
        }
    }
}
