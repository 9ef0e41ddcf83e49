// SPDX-License-Identifier: GPL-3.0-only

//! CPU render backend
//!
//! Used when no GPU adapter is available and by tests. Textures are plain
//! RGBA8 buffers; conversion and blits go through the CPU converter.

use super::{ExternalTextureId, ProgramId, RenderBackend, TextureHandle, TextureId};
use crate::backends::camera::{FrameView, Resolution, TextureTransform};
use crate::errors::RenderError;
use crate::media::yuv::convert_frame_to_rgba;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Failure injection for the headless backend
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessOptions {
    /// Make `register_external` fail
    pub fail_registration: bool,
    /// Make `create_external_texture` fail
    pub fail_external_textures: bool,
}

struct CpuTexture {
    size: Resolution,
    rgba: Vec<u8>,
}

pub struct HeadlessBackend {
    options: HeadlessOptions,
    next_id: u64,
    programs: HashSet<ProgramId>,
    textures: HashMap<TextureId, CpuTexture>,
    externals: HashMap<ExternalTextureId, Resolution>,
    programs_created: u64,
}

impl HeadlessBackend {
    pub fn new(options: HeadlessOptions) -> Self {
        Self {
            options,
            next_id: 1,
            programs: HashSet::new(),
            textures: HashMap::new(),
            externals: HashMap::new(),
            programs_created: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Programs compiled over the backend's lifetime
    pub fn programs_created(&self) -> u64 {
        self.programs_created
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len() + self.externals.len()
    }

    fn draw(
        &mut self,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError> {
        let texture = self
            .textures
            .get_mut(&target)
            .ok_or(RenderError::UnknownTexture(target.0))?;
        convert_frame_to_rgba(frame, transform, texture.size, &mut texture.rgba);

        Ok(TextureHandle {
            id: target,
            width: texture.size.width,
            height: texture.size.height,
            pixels: Some(Arc::from(texture.rgba.as_slice())),
            gpu_texture: None,
        })
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessOptions::default())
    }
}

impl RenderBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_program(&mut self) -> Result<ProgramId, RenderError> {
        let program = ProgramId(self.next_id());
        self.programs.insert(program);
        self.programs_created += 1;
        debug!(program = program.0, "Blit program created");
        Ok(program)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program) {
            debug!(program = program.0, "Blit program deleted");
        }
    }

    fn create_texture(&mut self, size: Resolution) -> Result<TextureId, RenderError> {
        if size.is_empty() {
            return Err(RenderError::Gpu(format!("invalid texture size {}", size)));
        }
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            CpuTexture {
                size,
                rgba: vec![0; size.rgba_len()],
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
        if self.options.fail_external_textures {
            return Err(RenderError::Gpu(
                "external texture allocation refused".to_string(),
            ));
        }
        let id = ExternalTextureId(self.next_id());
        self.externals.insert(id, size);
        Ok(id)
    }

    fn delete_external_texture(&mut self, texture: ExternalTextureId) {
        self.externals.remove(&texture);
    }

    fn register_external(&mut self, texture: ExternalTextureId) -> Result<(), RenderError> {
        if self.options.fail_registration {
            return Err(RenderError::RegistrationFailed(format!(
                "external texture {} rejected",
                texture.0
            )));
        }
        if !self.externals.contains_key(&texture) {
            return Err(RenderError::RegistrationFailed(format!(
                "external texture {} does not exist",
                texture.0
            )));
        }
        Ok(())
    }

    fn convert(
        &mut self,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError> {
        self.draw(frame, transform, target)
    }

    fn blit_external(
        &mut self,
        program: ProgramId,
        source: ExternalTextureId,
        frame: &FrameView<'_>,
        transform: &TextureTransform,
        target: TextureId,
    ) -> Result<TextureHandle, RenderError> {
        if !self.programs.contains(&program) {
            return Err(RenderError::Gpu(format!("program {} not linked", program.0)));
        }
        if !self.externals.contains_key(&source) {
            return Err(RenderError::Gpu(format!(
                "external texture {} does not exist",
                source.0
            )));
        }
        self.draw(frame, transform, target)
    }
}
