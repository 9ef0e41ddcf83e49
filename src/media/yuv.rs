// SPDX-License-Identifier: GPL-3.0-only

//! CPU YUV_420_888 to RGBA conversion
//!
//! Mirrors the compute shader in `shaders/yuv_convert/yuv_to_rgba.wgsl`
//! sample for sample, so the headless renderer and the GPU renderer produce
//! the same image for the same frame.

use crate::backends::camera::{FrameView, Resolution, TextureTransform};

/// BT.601 full-range YUV to RGB
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;

    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Map a destination pixel to the source pixel it samples
#[inline]
pub fn source_pixel(
    x: u32,
    y: u32,
    output: Resolution,
    source: Resolution,
    transform: &TextureTransform,
) -> (u32, u32) {
    let s = (x as f32 + 0.5) / output.width as f32;
    let t = (y as f32 + 0.5) / output.height as f32;
    let (s, t) = transform.apply(s, t);
    let sx = (s.clamp(0.0, 1.0) * source.width as f32) as u32;
    let sy = (t.clamp(0.0, 1.0) * source.height as f32) as u32;
    (
        sx.min(source.width.saturating_sub(1)),
        sy.min(source.height.saturating_sub(1)),
    )
}

/// Convert a frame into an RGBA8 image of size `output`.
///
/// Sizes differing from the frame are handled by nearest-neighbour sampling.
/// Out-of-range plane reads (short buffers) sample as zero.
pub fn convert_frame_to_rgba(
    frame: &FrameView<'_>,
    transform: &TextureTransform,
    output: Resolution,
    rgba: &mut Vec<u8>,
) {
    rgba.resize(output.rgba_len(), 0);
    if output.is_empty() {
        return;
    }
    let source = frame.layout.resolution();
    if source.is_empty() {
        rgba.fill(0);
        return;
    }

    let y_stride = frame.layout.y_row_stride as usize;
    let uv_stride = frame.layout.uv_row_stride as usize;
    let uv_pixel = frame.layout.uv_pixel_stride as usize;
    let width = output.width as usize;

    for (row, out_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
        for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
            let (sx, sy) = source_pixel(col as u32, row as u32, output, source, transform);
            let (sx, sy) = (sx as usize, sy as usize);

            let luma = frame.y.get(sy * y_stride + sx).copied().unwrap_or(0);
            let uv_index = (sy / 2) * uv_stride + (sx / 2) * uv_pixel;
            let u = frame.u.get(uv_index).copied().unwrap_or(128);
            let v = frame.v.get(uv_index).copied().unwrap_or(128);

            let [r, g, b] = yuv_to_rgb(luma, u, v);
            px[0] = r;
            px[1] = g;
            px[2] = b;
            px[3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{FramePlanes, PlaneLayout};

    #[test]
    fn test_neutral_chroma_is_gray() {
        assert_eq!(yuv_to_rgb(0, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(255, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(100, 128, 128), [100, 100, 100]);
    }

    #[test]
    fn test_saturated_colors_clamp() {
        let [r, g, b] = yuv_to_rgb(255, 255, 255);
        assert_eq!(r, 255);
        assert!(g < 255);
        assert_eq!(b, 255);

        let red = yuv_to_rgb(76, 85, 255);
        assert!(red[0] > 240 && red[1] < 10 && red[2] < 10);
    }

    #[test]
    fn test_convert_uses_strides() {
        let res = Resolution::new(4, 2);
        let layout = PlaneLayout::semi_planar(res);
        let mut planes = FramePlanes::for_layout(layout);
        // Left half dark, right half bright
        for row in 0..2 {
            for col in 0..4 {
                planes.y[row * 4 + col] = if col < 2 { 16 } else { 235 };
            }
        }
        planes.u.fill(128);
        planes.v.fill(128);

        let mut rgba = Vec::new();
        convert_frame_to_rgba(
            &planes.view().unwrap(),
            &TextureTransform::IDENTITY,
            res,
            &mut rgba,
        );
        assert_eq!(rgba.len(), 4 * 2 * 4);
        assert_eq!(&rgba[0..4], &[16, 16, 16, 255]);
        assert_eq!(&rgba[12..16], &[235, 235, 235, 255]);
    }

    #[test]
    fn test_convert_scales_and_flips() {
        let res = Resolution::new(2, 2);
        let layout = PlaneLayout::planar(res);
        let mut planes = FramePlanes::for_layout(layout);
        planes.y.copy_from_slice(&[10, 10, 200, 200]);
        planes.u.fill(128);
        planes.v.fill(128);
        let view = planes.view().unwrap();

        let mut rgba = Vec::new();
        convert_frame_to_rgba(&view, &TextureTransform::IDENTITY, Resolution::new(4, 4), &mut rgba);
        assert_eq!(rgba.len(), 64);
        // Top rows sample the first source row
        assert_eq!(rgba[0], 10);
        assert_eq!(rgba[63 - 3], 200);

        convert_frame_to_rgba(&view, &TextureTransform::FLIP_VERTICAL, res, &mut rgba);
        assert_eq!(rgba[0], 200);
        assert_eq!(rgba[8], 10);
    }

    #[test]
    fn test_convert_into_empty_output_is_noop() {
        let res = Resolution::new(2, 2);
        let planes = FramePlanes::for_layout(PlaneLayout::planar(res));
        let mut rgba = vec![1; 16];
        convert_frame_to_rgba(
            &planes.view().unwrap(),
            &TextureTransform::IDENTITY,
            Resolution::new(0, 48),
            &mut rgba,
        );
        assert!(rgba.is_empty());
    }
}
