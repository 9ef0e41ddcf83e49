// SPDX-License-Identifier: GPL-3.0-only
// Shared types for the camera platform abstraction

//! Shared types for camera devices, sessions and frames

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Output resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of an RGBA8 texture at this resolution
    pub fn rgba_len(&self) -> usize {
        self.pixel_count() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w.trim().parse().map_err(|_| format!("bad width '{}'", w))?;
        let height = h.trim().parse().map_err(|_| format!("bad height '{}'", h))?;
        let res = Resolution::new(width, height);
        if res.is_empty() {
            return Err(format!("resolution must be non-zero, got '{}'", s));
        }
        Ok(res)
    }
}

/// Capture intent, mirroring Camera2's request templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CaptureTemplate {
    #[default]
    Preview,
    StillCapture,
    Record,
    VideoSnapshot,
}

impl CaptureTemplate {
    pub const ALL: [CaptureTemplate; 4] = [
        CaptureTemplate::Preview,
        CaptureTemplate::StillCapture,
        CaptureTemplate::Record,
        CaptureTemplate::VideoSnapshot,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            CaptureTemplate::Preview => "preview",
            CaptureTemplate::StillCapture => "still",
            CaptureTemplate::Record => "record",
            CaptureTemplate::VideoSnapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for CaptureTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for CaptureTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaptureTemplate::ALL
            .into_iter()
            .find(|t| t.display_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown capture template '{}'", s))
    }
}

/// How a session drives the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Every frame of the repeating request reaches the frame source
    Continuous,
    /// A background repeating request keeps the sensor warm; frames reach the
    /// frame source only through one-shot `request_capture` calls
    OnDemand,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Continuous => write!(f, "continuous"),
            SessionMode::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Lifecycle of a camera device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Initializing,
    Opened,
    Closed,
    Erred,
}

impl DeviceState {
    /// Terminal states never return to Opened
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Closed | DeviceState::Erred)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Initializing => "initializing",
            DeviceState::Opened => "opened",
            DeviceState::Closed => "closed",
            DeviceState::Erred => "erred",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Configuring,
    Opened,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Configuring => "configuring",
            SessionState::Opened => "opened",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Unique id of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First group is enough to tell sessions apart in logs
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Spatial layout of a YUV_420_888 frame
///
/// Chroma is subsampled 2x2. `uv_pixel_stride` is 1 for fully planar data
/// and 2 when U and V are interleaved in one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub y_row_stride: u32,
    pub uv_row_stride: u32,
    pub uv_pixel_stride: u32,
}

impl PlaneLayout {
    /// Semi-planar layout most sensors deliver (VU interleaved)
    pub fn semi_planar(res: Resolution) -> Self {
        Self {
            width: res.width,
            height: res.height,
            y_row_stride: res.width,
            uv_row_stride: res.width,
            uv_pixel_stride: 2,
        }
    }

    /// Fully planar I420 layout
    pub fn planar(res: Resolution) -> Self {
        Self {
            width: res.width,
            height: res.height,
            y_row_stride: res.width,
            uv_row_stride: res.width.div_ceil(2),
            uv_pixel_stride: 1,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Bytes spanned by the luma plane
    pub fn y_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        (self.height as usize - 1) * self.y_row_stride as usize + self.width as usize
    }

    /// Bytes spanned by one chroma plane
    pub fn uv_len(&self) -> usize {
        let rows = self.height.div_ceil(2) as usize;
        let cols = self.width.div_ceil(2) as usize;
        if rows == 0 || cols == 0 {
            return 0;
        }
        (rows - 1) * self.uv_row_stride as usize + (cols - 1) * self.uv_pixel_stride as usize + 1
    }
}

/// Borrowed view of a frame's planes
///
/// Only valid for the duration of the callback that delivers it; consumers
/// copy what they need before returning.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub layout: PlaneLayout,
    pub timestamp_ns: i64,
    /// Position of the frame in its producer's sequence
    pub sequence: u64,
}

impl FrameView<'_> {
    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }
}

/// Owned frame planes, used as pool slots and as bridge staging buffers
#[derive(Debug, Clone, Default)]
pub struct FramePlanes {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub layout: Option<PlaneLayout>,
    pub timestamp_ns: i64,
    pub sequence: u64,
}

impl FramePlanes {
    /// Allocate planes large enough for `layout`
    pub fn for_layout(layout: PlaneLayout) -> Self {
        Self {
            y: vec![0; layout.y_len()],
            u: vec![0; layout.uv_len()],
            v: vec![0; layout.uv_len()],
            layout: Some(layout),
            timestamp_ns: 0,
            sequence: 0,
        }
    }

    /// Copy a transient frame into buffers sized `width*height` for luma and
    /// `width*height/2` for each chroma plane, growing only when the source
    /// strides carry row padding.
    pub fn copy_from_view(&mut self, frame: &FrameView<'_>) {
        let pixels = frame.layout.resolution().pixel_count();
        copy_plane(&mut self.y, frame.y, pixels.max(frame.layout.y_len()));
        copy_plane(&mut self.u, frame.u, (pixels / 2).max(frame.layout.uv_len()));
        copy_plane(&mut self.v, frame.v, (pixels / 2).max(frame.layout.uv_len()));
        self.layout = Some(frame.layout);
        self.timestamp_ns = frame.timestamp_ns;
        self.sequence = frame.sequence;
    }

    /// Borrow as a frame view; `None` until the planes hold a frame.
    pub fn view(&self) -> Option<FrameView<'_>> {
        let layout = self.layout?;
        Some(FrameView {
            y: &self.y,
            u: &self.u,
            v: &self.v,
            layout,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
        })
    }
}

fn copy_plane(dst: &mut Vec<u8>, src: &[u8], size: usize) {
    dst.resize(size, 0);
    let n = src.len().min(size);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}

/// Column-major 4x4 texture coordinate transform
///
/// Applied to normalized destination coordinates to find the source sample,
/// the way a SurfaceTexture transform matrix is applied in a blit shader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureTransform(pub [f32; 16]);

impl TextureTransform {
    pub const IDENTITY: TextureTransform = TextureTransform([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// `t' = 1 - t`
    pub const FLIP_VERTICAL: TextureTransform = TextureTransform([
        1.0, 0.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 1.0, 0.0, 1.0,
    ]);

    /// Transform a normalized (s, t) coordinate
    pub fn apply(&self, s: f32, t: f32) -> (f32, f32) {
        let m = &self.0;
        let x = m[0] * s + m[4] * t + m[12];
        let y = m[1] * s + m[5] * t + m[13];
        let w = m[3] * s + m[7] * t + m[15];
        if w.abs() > f32::EPSILON && (w - 1.0).abs() > f32::EPSILON {
            (x / w, y / w)
        } else {
            (x, y)
        }
    }
}

impl Default for TextureTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        let res: Resolution = "640x480".parse().unwrap();
        assert_eq!(res, Resolution::new(640, 480));
        assert_eq!(res.rgba_len(), 640 * 480 * 4);
        assert!("640".parse::<Resolution>().is_err());
        assert!("0x480".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_template_parse() {
        assert_eq!(
            "still".parse::<CaptureTemplate>().unwrap(),
            CaptureTemplate::StillCapture
        );
        assert_eq!(
            "Preview".parse::<CaptureTemplate>().unwrap(),
            CaptureTemplate::Preview
        );
        assert!("burst".parse::<CaptureTemplate>().is_err());
    }

    #[test]
    fn test_semi_planar_plane_lengths() {
        let layout = PlaneLayout::semi_planar(Resolution::new(640, 480));
        assert_eq!(layout.y_len(), 640 * 480);
        // Interleaved chroma: the U view ends one byte before the VU buffer does
        assert_eq!(layout.uv_len(), 640 * 480 / 2 - 1);

        let planar = PlaneLayout::planar(Resolution::new(640, 480));
        assert_eq!(planar.uv_len(), 320 * 240);
    }

    #[test]
    fn test_copy_from_view_sizes_buffers() {
        let layout = PlaneLayout::semi_planar(Resolution::new(8, 4));
        let source = FramePlanes::for_layout(layout);
        let mut view = source.view().unwrap();
        view.timestamp_ns = 42;

        let mut staging = FramePlanes::default();
        staging.copy_from_view(&view);
        assert_eq!(staging.y.len(), 32);
        assert_eq!(staging.u.len(), 16);
        assert_eq!(staging.v.len(), 16);
        assert_eq!(staging.timestamp_ns, 42);
    }

    #[test]
    fn test_texture_transform() {
        assert_eq!(TextureTransform::IDENTITY.apply(0.25, 0.75), (0.25, 0.75));
        let (s, t) = TextureTransform::FLIP_VERTICAL.apply(0.25, 0.75);
        assert!((s - 0.25).abs() < 1e-6);
        assert!((t - 0.25).abs() < 1e-6);
    }
}
