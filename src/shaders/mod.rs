// SPDX-License-Identifier: GPL-3.0-only
//! Compute shaders and the shared GPU processor helpers

mod gpu_processor;
pub mod yuv_convert;

pub use gpu_processor::{
    CachedDimensions, compute_dispatch_size, padded_bytes_per_row, read_buffer_async,
    strip_row_padding,
};
pub use yuv_convert::{YUV_TO_RGBA_SHADER, YuvConvertProcessor};
