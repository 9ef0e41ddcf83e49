// SPDX-License-Identifier: GPL-3.0-only

//! GPU-accelerated YUV_420_888 to RGBA conversion
//!
//! The CPU fallback in `media::yuv` samples identically.

mod processor;

pub use processor::{YUV_TO_RGBA_SHADER, YuvConvertProcessor};
