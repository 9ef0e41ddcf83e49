// SPDX-License-Identifier: GPL-3.0-only

//! External-texture bindings and the shared blit program
//!
//! Lives on the render thread. Each binding pairs a session's external
//! surface with a destination texture. The blit program is compiled when the
//! first binding is set up and deleted when the last one is cleaned up.

use super::{
    BindingId, ExternalSurface, ProgramId, RenderBackend, TextureHandle, TextureId,
};
use crate::backends::camera::{FramePlanes, Resolution, SessionId, TextureTransform};
use crate::errors::RenderError;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Reference-counted program shared by all bindings
#[derive(Debug, Default)]
struct SharedProgram {
    handle: Option<ProgramId>,
    holders: usize,
}

impl SharedProgram {
    fn acquire(&mut self, backend: &mut dyn RenderBackend) -> Result<ProgramId, RenderError> {
        let program = match self.handle {
            Some(program) => program,
            None => {
                let program = backend.create_program()?;
                info!(program = program.0, "Shared blit program compiled");
                self.handle = Some(program);
                program
            }
        };
        self.holders += 1;
        Ok(program)
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.holders = self.holders.saturating_sub(1);
        if self.holders > 0 {
            return;
        }
        if let Some(program) = self.handle.take() {
            backend.delete_program(program);
            info!(program = program.0, "Shared blit program deleted");
        }
    }
}

/// Parameters for a new binding
#[derive(Debug, Clone, Copy)]
pub struct SetupRequest {
    pub session: SessionId,
    /// Size the camera writes into the external texture
    pub source: Resolution,
    /// Size of the RGBA destination texture
    pub destination: Resolution,
}

/// What the requester needs to hand the surface to the camera
#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub binding: BindingId,
    pub surface: ExternalSurface,
    pub destination: TextureId,
    pub destination_size: Resolution,
}

/// A frame drawn into a binding's destination texture
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub texture: TextureHandle,
    pub timestamp_ns: i64,
}

/// External texture to destination texture mapping for one session
#[derive(Debug)]
pub struct NativeTextureBinding {
    pub id: BindingId,
    pub session: SessionId,
    pub surface: ExternalSurface,
    pub destination: TextureId,
    pub destination_size: Resolution,
    registered: bool,
    rendered: u64,
}

impl NativeTextureBinding {
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }
}

/// All graphics resources owned by the render thread
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: HashMap<BindingId, NativeTextureBinding>,
    sessions: HashMap<SessionId, BindingId>,
    outputs: HashMap<TextureId, Resolution>,
    program: SharedProgram,
    next_binding: u64,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the program reference, external texture and destination
    /// texture for a session.
    ///
    /// Fails with [`RenderError::AlreadyRegistered`] if the session already
    /// has a binding. Partially created resources are released on failure.
    pub fn setup(
        &mut self,
        backend: &mut dyn RenderBackend,
        request: SetupRequest,
    ) -> Result<SetupOutcome, RenderError> {
        if self.sessions.contains_key(&request.session) {
            return Err(RenderError::AlreadyRegistered);
        }

        self.program.acquire(backend)?;

        let external = match backend.create_external_texture(request.source) {
            Ok(external) => external,
            Err(e) => {
                self.program.release(backend);
                return Err(e);
            }
        };

        let destination = match backend.create_texture(request.destination) {
            Ok(texture) => texture,
            Err(e) => {
                backend.delete_external_texture(external);
                self.program.release(backend);
                return Err(e);
            }
        };

        self.next_binding += 1;
        let id = BindingId(self.next_binding);
        let surface = ExternalSurface::new(external, request.source);

        debug!(
            binding = %id,
            session = %request.session,
            source = %request.source,
            destination = %request.destination,
            "Binding set up"
        );

        self.bindings.insert(
            id,
            NativeTextureBinding {
                id,
                session: request.session,
                surface: surface.clone(),
                destination,
                destination_size: request.destination,
                registered: false,
                rendered: 0,
            },
        );
        self.sessions.insert(request.session, id);

        Ok(SetupOutcome {
            binding: id,
            surface,
            destination,
            destination_size: request.destination,
        })
    }

    /// Register the binding's external texture for per-frame updates
    pub fn register(
        &mut self,
        backend: &mut dyn RenderBackend,
        binding: BindingId,
    ) -> Result<(), RenderError> {
        let entry = self
            .bindings
            .get_mut(&binding)
            .ok_or(RenderError::UnknownBinding(binding.0))?;
        if entry.registered {
            return Ok(());
        }
        backend.register_external(entry.surface.id())?;
        entry.registered = true;
        debug!(binding = %binding, "Binding registered");
        Ok(())
    }

    /// Latch the newest surface image and draw it into the destination.
    ///
    /// `Ok(None)` when the binding is gone or nothing new was posted.
    pub fn render(
        &mut self,
        backend: &mut dyn RenderBackend,
        binding: BindingId,
    ) -> Result<Option<RenderedFrame>, RenderError> {
        let Some(entry) = self.bindings.get_mut(&binding) else {
            return Ok(None);
        };
        if !entry.registered {
            return Ok(None);
        }
        let Some(image) = entry.surface.latch() else {
            return Ok(None);
        };
        let Some(program) = self.program.handle else {
            entry.surface.recycle(image);
            return Err(RenderError::Gpu("blit program missing".to_string()));
        };

        let result = match image.planes.view() {
            Some(view) => backend
                .blit_external(
                    program,
                    entry.surface.id(),
                    &view,
                    &image.transform,
                    entry.destination,
                )
                .map(|texture| {
                    Some(RenderedFrame {
                        texture,
                        timestamp_ns: view.timestamp_ns,
                    })
                }),
            None => Ok(None),
        };

        if matches!(result, Ok(Some(_))) {
            entry.rendered += 1;
        }
        entry.surface.recycle(image);
        result
    }

    /// Release a binding's resources. Returns `false` if it was already gone.
    pub fn cleanup(&mut self, backend: &mut dyn RenderBackend, binding: BindingId) -> bool {
        let Some(entry) = self.bindings.remove(&binding) else {
            return false;
        };
        self.sessions.remove(&entry.session);
        entry.surface.release();
        backend.delete_external_texture(entry.surface.id());
        backend.delete_texture(entry.destination);
        self.program.release(backend);
        debug!(binding = %binding, rendered = entry.rendered, "Binding cleaned up");
        true
    }

    /// Allocate a destination texture for the compute path
    pub fn create_output(
        &mut self,
        backend: &mut dyn RenderBackend,
        size: Resolution,
    ) -> Result<TextureId, RenderError> {
        let texture = backend.create_texture(size)?;
        self.outputs.insert(texture, size);
        Ok(texture)
    }

    pub fn destroy_output(&mut self, backend: &mut dyn RenderBackend, texture: TextureId) {
        if self.outputs.remove(&texture).is_some() {
            backend.delete_texture(texture);
        }
    }

    /// Convert staged planes into a compute-path output texture
    pub fn convert(
        &mut self,
        backend: &mut dyn RenderBackend,
        output: TextureId,
        planes: &FramePlanes,
    ) -> Result<TextureHandle, RenderError> {
        if !self.outputs.contains_key(&output) {
            return Err(RenderError::UnknownTexture(output.0));
        }
        let view = planes
            .view()
            .ok_or_else(|| RenderError::Gpu("staging buffer holds no frame".to_string()))?;
        backend.convert(&view, &TextureTransform::IDENTITY, output)
    }

    /// Release everything; used when the render thread stops
    pub fn clear(&mut self, backend: &mut dyn RenderBackend) {
        let bindings: Vec<BindingId> = self.bindings.keys().copied().collect();
        if !bindings.is_empty() {
            warn!(count = bindings.len(), "Bindings still live at render shutdown");
        }
        for binding in bindings {
            self.cleanup(backend, binding);
        }
        for (texture, _) in self.outputs.drain() {
            backend.delete_texture(texture);
        }
    }

    pub fn binding(&self, binding: BindingId) -> Option<&NativeTextureBinding> {
        self.bindings.get(&binding)
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Current holders of the shared program
    pub fn program_holders(&self) -> usize {
        self.program.holders
    }

    pub fn has_program(&self) -> bool {
        self.program.handle.is_some()
    }
}
