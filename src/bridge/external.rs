// SPDX-License-Identifier: GPL-3.0-only

//! External-texture bridge: the camera writes into a surface, the render
//! thread blits the newest image into the output texture.
//!
//! A frame-available notification queues at most one render command; more
//! notifications while it is queued fold into it. Rendering only starts once
//! the binding is registered, which happens after the session is active.

use crate::backends::camera::{Resolution, SessionId};
use crate::constants::LOG_EVERY_N_FRAMES;
use crate::errors::RenderError;
use crate::events::{EventBus, FrameEvent};
use crate::render::{
    BindingId, ExternalSurface, RenderQueue, RenderedFrame, SetupRequest, TextureId,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

struct ExternalInner {
    session: SessionId,
    render: RenderQueue,
    binding: BindingId,
    surface: ExternalSurface,
    destination: TextureId,
    destination_size: Resolution,
    frames: EventBus<FrameEvent>,
    registered: AtomicBool,
    render_queued: AtomicBool,
    closed: AtomicBool,
    processed: AtomicU64,
    disposed: OnceCell<Result<(), RenderError>>,
}

impl ExternalInner {
    fn request_render(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) || !self.registered.load(Ordering::Acquire) {
            return;
        }
        if self.render_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let submitted = self
            .render
            .render(self.binding, Box::new(move |result| this.rendered(result)));
        if let Err(e) = submitted {
            self.render_queued.store(false, Ordering::Release);
            warn!(session = %self.session, error = %e, "Could not queue render");
        }
    }

    /// Render thread
    fn rendered(self: &Arc<Self>, result: Result<Option<RenderedFrame>, RenderError>) {
        self.render_queued.store(false, Ordering::Release);
        match result {
            Ok(Some(frame)) if !self.closed.load(Ordering::Acquire) => {
                let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
                if count % LOG_EVERY_N_FRAMES == 0 {
                    debug!(
                        session = %self.session,
                        processed = count,
                        replaced = self.surface.replaced(),
                        timestamp_ns = frame.timestamp_ns,
                        "External bridge frame stats"
                    );
                }
                self.frames.emit(FrameEvent::FrameProcessed {
                    session: self.session,
                    texture: frame.texture,
                    timestamp_ns: frame.timestamp_ns,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(session = %self.session, error = %e, "Render failed"),
        }
        // An image posted while the command was queued found it already queued
        if self.surface.has_pending() {
            self.request_render();
        }
    }
}

/// Frame bridge for the external-texture path
#[derive(Clone)]
pub struct ExternalTextureBridge {
    inner: Arc<ExternalInner>,
}

impl ExternalTextureBridge {
    /// Set up the binding on the render thread and listen on its surface
    pub async fn create(
        session: SessionId,
        render: RenderQueue,
        source: Resolution,
        destination: Resolution,
        frames: EventBus<FrameEvent>,
    ) -> Result<Self, RenderError> {
        let outcome = render
            .setup(SetupRequest {
                session,
                source,
                destination,
            })
            .await?;
        debug!(
            session = %session,
            binding = outcome.binding.0,
            texture = outcome.destination.0,
            "External texture binding set up"
        );

        let inner = Arc::new(ExternalInner {
            session,
            render,
            binding: outcome.binding,
            surface: outcome.surface,
            destination: outcome.destination,
            destination_size: outcome.destination_size,
            frames,
            registered: AtomicBool::new(false),
            render_queued: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            disposed: OnceCell::new(),
        });

        let weak: Weak<ExternalInner> = Arc::downgrade(&inner);
        inner
            .surface
            .set_frame_available_listener(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.request_render();
                }
            }));

        Ok(Self { inner })
    }

    /// Surface the camera writes into
    pub fn surface(&self) -> &ExternalSurface {
        &self.inner.surface
    }

    pub fn binding(&self) -> BindingId {
        self.inner.binding
    }

    pub fn destination(&self) -> TextureId {
        self.inner.destination
    }

    pub fn destination_size(&self) -> Resolution {
        self.inner.destination_size
    }

    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    /// Images the camera posted that were replaced before a render latched them
    pub fn coalesced(&self) -> u64 {
        self.inner.surface.replaced()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register the binding for per-frame updates and render anything that
    /// arrived before registration
    pub async fn register(&self) -> Result<(), RenderError> {
        if self.is_closed() {
            return Err(RenderError::UnknownBinding(self.inner.binding.0));
        }
        self.inner.render.register(self.inner.binding).await?;
        self.inner.registered.store(true, Ordering::Release);
        info!(session = %self.inner.session, binding = self.inner.binding.0, "Texture binding registered");
        if self.inner.surface.has_pending() {
            self.inner.request_render();
        }
        Ok(())
    }

    /// Detach from the surface and release the binding. Idempotent.
    pub async fn dispose(&self) -> Result<(), RenderError> {
        let inner = &self.inner;
        inner
            .disposed
            .get_or_init(|| async {
                inner.closed.store(true, Ordering::Release);
                inner.surface.clear_frame_available_listener();
                // Ordered behind any render still queued for this binding
                let result = inner.render.cleanup(inner.binding).await.map(|released| {
                    if !released {
                        debug!(binding = inner.binding.0, "Binding was already released");
                    }
                });
                info!(
                    session = %inner.session,
                    processed = inner.processed.load(Ordering::Relaxed),
                    "External texture bridge disposed"
                );
                result
            })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::PlaneLayout;
    use crate::render::HeadlessOptions;
    use std::time::Duration;

    fn post(surface: &ExternalSurface, ts: i64) {
        let layout = PlaneLayout::semi_planar(surface.resolution());
        surface.post_with(layout, ts, ts as u64, |planes| {
            planes.y.fill(90);
            planes.u.fill(128);
            planes.v.fill(128);
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_renders_only_after_registration() {
        let render = RenderQueue::headless(HeadlessOptions::default()).unwrap();
        let frames = EventBus::live(64);
        let mut events = frames.subscribe();
        let res = Resolution::new(8, 8);
        let bridge =
            ExternalTextureBridge::create(SessionId::new(), render, res, res, frames)
                .await
                .unwrap();

        post(bridge.surface(), 10);
        assert!(events.recv_timeout(Duration::from_millis(50)).await.is_none());

        bridge.register().await.unwrap();
        match events.recv_timeout(Duration::from_secs(1)).await {
            Some(FrameEvent::FrameProcessed { timestamp_ns, texture, .. }) => {
                assert_eq!(timestamp_ns, 10);
                assert_eq!(texture.resolution(), res);
            }
            other => panic!("expected a processed frame, got {:?}", other),
        }

        post(bridge.surface(), 20);
        let next = events
            .wait_for(Duration::from_secs(1), |e| e.timestamp_ns() == 20)
            .await;
        assert!(next.is_some());

        bridge.dispose().await.unwrap();
        assert!(bridge.surface().is_released());
        assert!(!post_accepted(bridge.surface()));
    }

    fn post_accepted(surface: &ExternalSurface) -> bool {
        let layout = PlaneLayout::semi_planar(surface.resolution());
        surface.post_with(layout, 99, 99, |_| {})
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_failure_is_reported() {
        let render = RenderQueue::headless(HeadlessOptions {
            fail_registration: true,
            ..Default::default()
        })
        .unwrap();
        let res = Resolution::new(4, 4);
        let bridge = ExternalTextureBridge::create(
            SessionId::new(),
            render,
            res,
            res,
            EventBus::live(8),
        )
        .await
        .unwrap();

        assert!(matches!(
            bridge.register().await,
            Err(RenderError::RegistrationFailed(_))
        ));
        assert!(!bridge.is_registered());
        bridge.dispose().await.unwrap();
    }
}
