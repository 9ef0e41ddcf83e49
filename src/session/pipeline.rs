// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline: one capture session plus the bridge that turns its frames into
//! an output texture, disposed as a unit.

use super::controller::{SessionController, SessionParams, SessionSink, SessionStats};
use crate::backends::camera::{
    CaptureTemplate, PlatformDevice, Resolution, SessionId, SessionMode, SessionState,
};
use crate::bridge::{BridgeStats, ComputeBridge, ExternalTextureBridge, FrameBridge};
use crate::config::ConversionPath;
use crate::constants::FRAME_EVENT_CAPACITY;
use crate::errors::{CameraError, CameraResult};
use crate::events::{EventBus, EventStream, FrameEvent, SessionEvent};
use crate::render::{RenderQueue, TextureId};
use futures::future::{AbortHandle, Abortable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Combined counters of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub session: SessionStats,
    pub bridge: BridgeStats,
}

pub(crate) struct PipelineSpec {
    pub camera_id: String,
    pub mode: SessionMode,
    pub template: CaptureTemplate,
    pub resolution: Resolution,
    pub output_size: Resolution,
    pub path: ConversionPath,
    pub timeouts: super::SessionTimeouts,
}

pub(crate) struct PipelineCore {
    session: SessionController,
    bridge: FrameBridge,
    frames: EventBus<FrameEvent>,
    registration: Mutex<Option<AbortHandle>>,
    disposed: AtomicBool,
    dispose_done: OnceCell<()>,
}

impl PipelineCore {
    pub(crate) async fn dispose(&self) {
        self.dispose_done
            .get_or_init(|| async {
                self.disposed.store(true, Ordering::Release);
                self.session.mark_disposed();
                let registration = self
                    .registration
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                if let Some(registration) = registration {
                    registration.abort();
                }

                // Session teardown already disposes the bridge; this covers a
                // teardown whose graphics step timed out
                self.session.close().await;
                if let Err(e) = self.bridge.dispose().await {
                    warn!(session = %self.session.id(), error = %e, "Bridge dispose failed");
                }

                self.session.emit_dispose_completed();
                info!(session = %self.session.id(), "Pipeline disposed");
            })
            .await;
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session.id()
    }
}

/// A running capture pipeline.
///
/// Dropping a pipeline without calling [`Pipeline::dispose`] schedules the
/// dispose on the runtime it was created on.
pub struct Pipeline {
    core: Arc<PipelineCore>,
    runtime: Handle,
}

impl Pipeline {
    /// Build the bridge, then start the session that feeds it.
    ///
    /// On failure nothing is left allocated.
    pub(crate) async fn build(
        device: Arc<dyn PlatformDevice>,
        render: RenderQueue,
        spec: PipelineSpec,
        runtime: Handle,
    ) -> CameraResult<Self> {
        let id = SessionId::new();
        let frames = EventBus::live(FRAME_EVENT_CAPACITY);

        let (bridge, sink) = match spec.path {
            ConversionPath::Compute => {
                let bridge =
                    ComputeBridge::create(id, render, spec.output_size, frames.clone()).await?;
                let sink = SessionSink::Frames(bridge.frame_callback());
                (FrameBridge::Compute(bridge), sink)
            }
            ConversionPath::ExternalTexture => {
                let bridge = ExternalTextureBridge::create(
                    id,
                    render,
                    spec.resolution,
                    spec.output_size,
                    frames.clone(),
                )
                .await?;
                let sink = SessionSink::Surface(bridge.surface().clone());
                (FrameBridge::ExternalTexture(bridge), sink)
            }
        };

        let params = SessionParams {
            id,
            camera_id: spec.camera_id,
            mode: spec.mode,
            template: spec.template,
            resolution: spec.resolution,
            sink,
            graphics_teardown: Some(bridge.teardown_hook()),
            timeouts: spec.timeouts,
        };
        let session = match SessionController::start(&device, params, runtime.clone()) {
            Ok(session) => session,
            Err(e) => {
                if let Err(cleanup) = bridge.dispose().await {
                    warn!(session = %id, error = %cleanup, "Bridge cleanup after failed start");
                }
                return Err(e);
            }
        };

        let core = Arc::new(PipelineCore {
            session,
            bridge,
            frames,
            registration: Mutex::new(None),
            disposed: AtomicBool::new(false),
            dispose_done: OnceCell::new(),
        });

        if let FrameBridge::ExternalTexture(bridge) = &core.bridge {
            let (handle, registration) = AbortHandle::new_pair();
            *core.registration.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            let session = core.session.clone();
            let bridge = bridge.clone();
            let task = Abortable::new(register_when_active(session, bridge), registration);
            runtime.spawn(task);
        }

        debug!(session = %id, path = %spec.path, "Pipeline built");
        Ok(Self { core, runtime })
    }

    pub(crate) fn core(&self) -> &Arc<PipelineCore> {
        &self.core
    }

    pub fn session_id(&self) -> SessionId {
        self.core.session.id()
    }

    pub fn session(&self) -> &SessionController {
        &self.core.session
    }

    pub fn mode(&self) -> SessionMode {
        self.core.session.mode()
    }

    pub fn state(&self) -> SessionState {
        self.core.session.state()
    }

    pub fn conversion_path(&self) -> ConversionPath {
        self.core.bridge.path()
    }

    /// Texture that processed frames are written into
    pub fn output_texture(&self) -> TextureId {
        self.core.bridge.output()
    }

    /// Frame events from now on
    pub fn subscribe_frames(&self) -> EventStream<FrameEvent> {
        self.core.frames.subscribe()
    }

    /// Session lifecycle events, including those already emitted
    pub fn subscribe_session(&self) -> EventStream<SessionEvent> {
        self.core.session.subscribe()
    }

    /// Wait until the session is opened. `false` if it closed first or the
    /// wait timed out.
    pub async fn wait_until_active(&self, timeout: Duration) -> bool {
        let state = self
            .core
            .session
            .wait_for_state(timeout, |s| {
                matches!(
                    s,
                    SessionState::Opened | SessionState::Closing | SessionState::Closed
                )
            })
            .await;
        state == Some(SessionState::Opened)
    }

    /// One-shot capture on an on-demand pipeline.
    ///
    /// `Ok(false)` while the session is not opened; `Err` after dispose.
    pub fn request_capture(&self, template: CaptureTemplate) -> CameraResult<bool> {
        if self.is_disposed() {
            return Err(CameraError::InvalidState(format!(
                "pipeline {} is disposed",
                self.session_id()
            )));
        }
        self.core.session.request_capture(template)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            session: self.core.session.stats(),
            bridge: self.core.bridge.stats(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Close the session and release the bridge; `DisposeCompleted` follows.
    ///
    /// Idempotent. Concurrent callers wait for the same dispose.
    pub async fn dispose(&self) {
        self.core.dispose().await;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.core.dispose_done.initialized() {
            return;
        }
        debug!(session = %self.session_id(), "Pipeline dropped without dispose");
        let core = Arc::clone(&self.core);
        self.runtime.spawn(async move { core.dispose().await });
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("session", &self.core.session)
            .field("bridge", &self.core.bridge)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Register the external texture binding once the session is active.
///
/// A failure tears the session down: it is producing frames nobody can draw.
async fn register_when_active(session: SessionController, bridge: ExternalTextureBridge) {
    let mut events = session.subscribe();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Active { .. } => {
                if let Err(e) = bridge.register().await {
                    session.fail_registration(e.to_string());
                }
                return;
            }
            SessionEvent::ConfigurationFailed { .. }
            | SessionEvent::RequestFailed { .. }
            | SessionEvent::Closed { .. } => return,
            _ => {}
        }
    }
}
