// SPDX-License-Identifier: GPL-3.0-only

//! Device and session lifecycle
//!
//! ```text
//! CameraManager ──open──▶ DeviceHandle ──create_*_session──▶ Pipeline
//!                                                          ├─ SessionController
//!                                                          └─ FrameBridge
//! ```

mod controller;
mod device;
mod manager;
mod pipeline;

pub use controller::{GraphicsTeardown, SessionController, SessionSink, SessionStats, SessionTimeouts};
pub use device::DeviceHandle;
pub use manager::CameraManager;
pub use pipeline::{Pipeline, PipelineStats};
