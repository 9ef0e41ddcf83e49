// SPDX-License-Identifier: GPL-3.0-only

//! wgpu render backend
//!
//! Destination textures are GPU storage textures written by the YUV compute
//! kernel. Every blit program is its own compiled conversion pipeline; the
//! compute path shares one lazily created converter.

use super::{
    BackendFactory, ExternalTextureId, ProgramId, RenderBackend, TextureHandle, TextureId,
};
use crate::backends::camera::{FrameView, Resolution, TextureTransform};
use crate::errors::RenderError;
use crate::gpu::{self, GpuDeviceInfo, wgpu};
use crate::shaders::YuvConvertProcessor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

struct GpuTexture {
    texture: Arc<wgpu::Texture>,
    size: Resolution,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: GpuDeviceInfo,
    read_back: bool,
    next_id: u64,
    converter: Option<YuvConvertProcessor>,
    programs: HashMap<ProgramId, YuvConvertProcessor>,
    textures: HashMap<TextureId, GpuTexture>,
    externals: HashMap<ExternalTextureId, Resolution>,
    registered: HashSet<ExternalTextureId>,
}

impl WgpuBackend {
    /// Create the GPU device. Blocks the calling (render) thread.
    ///
    /// With `read_back` set, every conversion also copies the pixels to the
    /// CPU so `TextureHandle::pixels` is populated.
    pub fn new(read_back: bool) -> Result<Self, RenderError> {
        let (device, queue, info) = pollster::block_on(gpu::create_compute_device("ucamera render"))
            .map_err(RenderError::BackendUnavailable)?;

        info!(
            adapter = %info.adapter_name,
            backend = ?info.backend,
            read_back,
            "wgpu render backend ready"
        );

        Ok(Self {
            device,
            queue,
            info,
            read_back,
            next_id: 1,
            converter: None,
            programs: HashMap::new(),
            textures: HashMap::new(),
            externals: HashMap::new(),
            registered: HashSet::new(),
        })
    }

    /// Factory for `RenderQueue::start`
    pub fn factory(read_back: bool) -> BackendFactory {
        Box::new(move || Ok(Box::new(WgpuBackend::new(read_back)?) as Box<dyn RenderBackend>))
    }

    pub fn adapter_name(&self) -> &str {
        &self.info.adapter_name
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn target(&self, target: TextureId) -> Result<(Arc<wgpu::Texture>, Resolution), RenderError> {
        self.textures
            .get(&target)
            .map(|t| (Arc::clone(&t.texture), t.size))
            .ok_or(RenderError::UnknownTexture(target.0))
    }

    fn handle(
        &self,
        id: TextureId,
        texture: Arc<wgpu::Texture>,
        size: Resolution,
        pixels: Option<Vec<u8>>,
    ) -> TextureHandle {
        TextureHandle {
            id,
            width: size.width,
            height: size.height,
            pixels: pixels.map(Arc::from),
            gpu_texture: Some(texture),
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_program(&mut self) -> Result<ProgramId, RenderError> {
        let program = ProgramId(self.next_id());
        let processor = YuvConvertProcessor::new(Arc::clone(&self.device), Arc::clone(&self.queue));
        self.programs.insert(program, processor);
        debug!(program = program.0, "Blit pipeline compiled");
        Ok(program)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn create_texture(&mut self, size: Resolution) -> Result<TextureId, RenderError> {
        if size.is_empty() {
            return Err(RenderError::Gpu(format!("invalid texture size {}", size)));
        }
        let converter = self.converter.get_or_insert_with(|| {
            YuvConvertProcessor::new(Arc::clone(&self.device), Arc::clone(&self.queue))
        });
        let texture = converter.create_output_texture(size);
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            GpuTexture {
                texture: Arc::new(texture),
                size,
            },
        );
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn create_external_texture(
        &mut self,
        size: Resolution,
    ) -> Result<ExternalTextureId, RenderError> {
        // Images reach the blit as planes latched from the surface, so no
        // device memory is reserved for the external side
        let id = ExternalTextureId(self.next_id());
        self.externals.insert(id, size);
        Ok(id)
    }

    fn delete_external_texture(&mut self, texture: ExternalTextureId) {
        self.externals.remove(&texture);
        self.registered.remove(&texture);
    }

    fn register_external(&mut self, texture: ExternalTextureId) -> Result<(), RenderError> {
        if !self.externals.contains_key(&texture) {
            return Err(RenderError::RegistrationFailed(format!(
                "external texture {} does not exist",
                texture.0
            )));
        }
        self.registered.insert(texture);
        Ok(())
    }

    fn convert(
        &mut self,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError> {
        let (texture, size) = self.target(target)?;
        let read_back = self.read_back;
        let converter = self.converter.get_or_insert_with(|| {
            YuvConvertProcessor::new(Arc::clone(&self.device), Arc::clone(&self.queue))
        });
        let pixels = pollster::block_on(converter.convert(frame, transform, &texture, size, read_back))
            .map_err(RenderError::Gpu)?;
        Ok(self.handle(target, texture, size, pixels))
    }

    fn blit_external(
        &mut self,
        program: ProgramId,
        source: ExternalTextureId,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError> {
        if !self.registered.contains(&source) {
            return Err(RenderError::Gpu(format!(
                "external texture {} is not registered",
                source.0
            )));
        }
        let (texture, size) = self.target(target)?;
        let read_back = self.read_back;
        let processor = self
            .programs
            .get_mut(&program)
            .ok_or_else(|| RenderError::Gpu(format!("program {} not linked", program.0)))?;
        let pixels = pollster::block_on(processor.convert(frame, transform, &texture, size, read_back))
            .map_err(RenderError::Gpu)?;
        Ok(self.handle(target, texture, size, pixels))
    }
}
