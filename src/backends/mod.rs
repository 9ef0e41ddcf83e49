// SPDX-License-Identifier: GPL-3.0-only

//! Camera platform layer
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Session layer (crate::session)        │
//! └────────────────────┬────────────────────────┘
//!                      │ CameraPlatform traits
//! ┌────────────────────┴────────────────────────┐
//! │  ┌──────────────────┐                        │
//! │  │  Virtual camera  │  simulated Camera2     │
//! │  └──────────────────┘                        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! - [`camera`]: platform traits and shared frame types
//! - [`virtual_camera`]: software camera stack with fault injection

pub mod camera;
pub mod virtual_camera;
