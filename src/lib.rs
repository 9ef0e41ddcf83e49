// SPDX-License-Identifier: GPL-3.0-only

//! ucamera - camera capture pipelines with explicit lifecycles
//!
//! This library opens camera devices, runs capture sessions on them and
//! converts their YUV frames into RGBA textures on a dedicated render thread.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Camera platform abstraction and the simulated camera
//! - [`session`]: Device handles, session controllers and pipelines
//! - [`frame`]: Triple-buffered frame pool and capture thread
//! - [`bridge`]: Compute and external-texture frame bridges
//! - [`render`]: Render command queue, texture bindings and backends
//! - [`shaders`]: GPU compute kernels
//! - [`media`]: CPU color conversion
//! - [`config`]: Pipeline configuration
//! - [`events`]: Lifecycle and frame event channels
//!
//! # Example
//!
//! ```ignore
//! let platform = Arc::new(VirtualCameraPlatform::new(VirtualCameraConfig::default())?);
//! let manager = CameraManager::new(platform, PipelineConfig::default())?;
//! let device = manager.open("0")?;
//! device.wait_for_initialization().await?;
//! let pipeline = device
//!     .create_continuous_session(Resolution::new(640, 480), CaptureTemplate::Preview)
//!     .await;
//! ```

#![recursion_limit = "256"]

pub mod backends;
pub mod bridge;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod frame;
pub mod gpu;
pub mod media;
pub mod render;
pub mod session;
pub mod shaders;

// Re-export commonly used types
pub use backends::camera::{
    CameraPlatform, CaptureTemplate, DeviceState, Resolution, SessionId, SessionMode,
    SessionState,
};
pub use backends::virtual_camera::{VirtualCameraConfig, VirtualCameraPlatform, VirtualFaults};
pub use config::{ConversionPath, PipelineConfig, RenderBackendKind};
pub use errors::{CameraError, CameraResult, PlatformError, RenderError};
pub use events::{DeviceEvent, FrameEvent, SessionEvent};
pub use session::{CameraManager, DeviceHandle, Pipeline};
