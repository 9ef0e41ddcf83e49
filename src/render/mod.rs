// SPDX-License-Identifier: GPL-3.0-only

//! Graphics-side resources and the serialized render command queue
//!
//! Graphics contexts are thread-affine, so every texture allocation, blit,
//! compute dispatch and teardown funnels through one render thread. Other
//! threads only enqueue [`RenderCommand`]s and receive results through
//! completion continuations.
//!
//! The render thread owns a [`RenderBackend`] and a [`BindingRegistry`]; the
//! registry keeps the external-texture bindings and the reference-counted
//! shader program shared by all of them.

mod headless;
mod queue;
mod registry;
mod surface;
mod wgpu_backend;

pub use headless::{HeadlessBackend, HeadlessOptions};
pub use queue::{BackendFactory, Completion, RenderCommand, RenderQueue};
pub use registry::{BindingRegistry, NativeTextureBinding, RenderedFrame, SetupOutcome, SetupRequest};
pub use surface::{ExternalSurface, FrameAvailableListener, LatchedImage};
pub use wgpu_backend::WgpuBackend;

use crate::backends::camera::{FrameView, Resolution, TextureTransform};
use crate::errors::RenderError;
use crate::gpu::wgpu;
use std::sync::Arc;

/// Destination (RGBA) texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Hardware-fed external texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalTextureId(pub u64);

/// External texture to destination texture mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u64);

/// Compiled blit program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Snapshot of a converted output texture
#[derive(Clone)]
pub struct TextureHandle {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    /// RGBA8 pixels, when the backend renders on the CPU or reads back
    pub pixels: Option<Arc<[u8]>>,
    /// GPU texture for zero-copy consumers
    pub gpu_texture: Option<Arc<wgpu::Texture>>,
}

impl TextureHandle {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Byte size of the texture's RGBA8 contents
    pub fn byte_len(&self) -> usize {
        self.resolution().rgba_len()
    }
}

impl std::fmt::Debug for TextureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureHandle")
            .field("id", &self.id)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("pixels", &self.pixels.as_ref().map(|p| p.len()))
            .field("gpu", &self.gpu_texture.is_some())
            .finish()
    }
}

/// Graphics API used by the render thread
///
/// Implementations are created on the render thread and never leave it.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    /// Compile the external-texture blit program
    fn create_program(&mut self) -> Result<ProgramId, RenderError>;

    fn delete_program(&mut self, program: ProgramId);

    /// Allocate an RGBA destination texture
    fn create_texture(&mut self, size: Resolution) -> Result<TextureId, RenderError>;

    fn delete_texture(&mut self, texture: TextureId);

    /// Allocate an external texture the camera can write into
    fn create_external_texture(&mut self, size: Resolution)
    -> Result<ExternalTextureId, RenderError>;

    fn delete_external_texture(&mut self, texture: ExternalTextureId);

    /// Register an external texture for per-frame updates
    fn register_external(&mut self, texture: ExternalTextureId) -> Result<(), RenderError>;

    /// YUV to RGBA conversion of raw planes into `target`
    fn convert(
        &mut self,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError>;

    /// Draw a latched external image into `target` with `program`
    fn blit_external(
        &mut self,
        program: ProgramId,
        source: ExternalTextureId,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError>;
}
