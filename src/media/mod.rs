// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format conversion
//!
//! Camera frames arrive as YUV 4:2:0 planes. The [`yuv`] module converts them
//! to RGBA on the CPU with the same sampling rules as the GPU kernel in
//! [`crate::shaders::yuv_convert`], so both render backends produce the same
//! output for the same frame.

pub mod yuv;
