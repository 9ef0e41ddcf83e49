// SPDX-License-Identifier: GPL-3.0-only

//! Compute bridge: raw planes to RGBA through the render thread
//!
//! The capture thread copies each delivered frame into a staging buffer and
//! returns immediately. At most one conversion is queued on the render
//! thread at a time; frames arriving while it runs replace each other, so the
//! output always converges on the newest frame.

use crate::backends::camera::{FramePlanes, FrameView, Resolution, SessionId};
use crate::constants::LOG_EVERY_N_FRAMES;
use crate::errors::RenderError;
use crate::events::{EventBus, FrameEvent};
use crate::frame::FrameCallback;
use crate::render::{RenderQueue, TextureHandle, TextureId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Staging {
    /// Newest frame waiting for the render thread
    pending: Option<FramePlanes>,
    /// Buffer to copy the next frame into
    spare: Option<FramePlanes>,
    in_flight: bool,
}

struct ComputeInner {
    session: SessionId,
    render: RenderQueue,
    output: TextureId,
    output_size: Resolution,
    frames: EventBus<FrameEvent>,
    staging: Mutex<Staging>,
    closed: AtomicBool,
    processed: AtomicU64,
    coalesced: AtomicU64,
    failed: AtomicU64,
    disposed: OnceCell<Result<(), RenderError>>,
}

impl ComputeInner {
    fn staging(&self) -> MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture thread: copy the frame and make sure a conversion is queued
    fn stage(self: &Arc<Self>, frame: &FrameView<'_>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut staging = self.staging();
        let mut buffer = match staging.pending.take() {
            Some(stale) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                stale
            }
            None => staging.spare.take().unwrap_or_default(),
        };
        buffer.copy_from_view(frame);

        if staging.in_flight {
            staging.pending = Some(buffer);
            return;
        }
        staging.in_flight = true;
        drop(staging);
        self.dispatch(buffer);
    }

    fn dispatch(self: &Arc<Self>, planes: FramePlanes) {
        let this = Arc::clone(self);
        let submitted = self.render.convert(
            self.output,
            planes,
            Box::new(move |(planes, result)| this.converted(planes, result)),
        );
        if let Err(e) = submitted {
            // Nothing will complete; let the next frame try again
            self.staging().in_flight = false;
            warn!(session = %self.session, error = %e, "Could not queue frame conversion");
        }
    }

    /// Render thread: publish the result and start the next conversion
    fn converted(self: &Arc<Self>, planes: FramePlanes, result: Result<TextureHandle, RenderError>) {
        match result {
            Ok(texture) if !self.closed.load(Ordering::Acquire) => {
                let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
                if count % LOG_EVERY_N_FRAMES == 0 {
                    debug!(
                        session = %self.session,
                        processed = count,
                        coalesced = self.coalesced.load(Ordering::Relaxed),
                        timestamp_ns = planes.timestamp_ns,
                        "Compute bridge frame stats"
                    );
                }
                self.frames.emit(FrameEvent::FrameProcessed {
                    session: self.session,
                    texture,
                    timestamp_ns: planes.timestamp_ns,
                });
            }
            Ok(_) => {}
            Err(e) => {
                let failures = self.failed.fetch_add(1, Ordering::Relaxed);
                if failures % LOG_EVERY_N_FRAMES == 0 {
                    warn!(session = %self.session, error = %e, failures = failures + 1, "Frame conversion failed");
                }
            }
        }

        let mut staging = self.staging();
        staging.spare = Some(planes);
        let next = if self.closed.load(Ordering::Acquire) {
            staging.pending = None;
            None
        } else {
            staging.pending.take()
        };
        match next {
            Some(next) => {
                drop(staging);
                self.dispatch(next);
            }
            None => staging.in_flight = false,
        }
    }
}

/// Frame bridge for the compute conversion path
#[derive(Clone)]
pub struct ComputeBridge {
    inner: Arc<ComputeInner>,
}

impl ComputeBridge {
    /// Allocate the output texture on the render thread
    pub async fn create(
        session: SessionId,
        render: RenderQueue,
        output_size: Resolution,
        frames: EventBus<FrameEvent>,
    ) -> Result<Self, RenderError> {
        let output = render.create_output(output_size).await?;
        debug!(
            session = %session,
            texture = output.0,
            width = output_size.width,
            height = output_size.height,
            "Compute bridge output created"
        );
        Ok(Self {
            inner: Arc::new(ComputeInner {
                session,
                render,
                output,
                output_size,
                frames,
                staging: Mutex::new(Staging::default()),
                closed: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                disposed: OnceCell::new(),
            }),
        })
    }

    /// Callback for the session's frame source.
    ///
    /// Publishes `FrameReady` and stages the frame for conversion.
    pub fn frame_callback(&self) -> FrameCallback {
        let inner = Arc::clone(&self.inner);
        Box::new(move |frame: &FrameView<'_>| {
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            inner.frames.emit(FrameEvent::FrameReady {
                session: inner.session,
                sequence: frame.sequence,
                timestamp_ns: frame.timestamp_ns,
                width: frame.width(),
                height: frame.height(),
            });
            inner.stage(frame);
        })
    }

    pub fn output(&self) -> TextureId {
        self.inner.output
    }

    pub fn output_size(&self) -> Resolution {
        self.inner.output_size
    }

    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    /// Frames replaced in staging before the render thread got to them
    pub fn coalesced(&self) -> u64 {
        self.inner.coalesced.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop publishing and destroy the output texture. Idempotent.
    pub async fn dispose(&self) -> Result<(), RenderError> {
        let inner = &self.inner;
        inner
            .disposed
            .get_or_init(|| async {
                inner.closed.store(true, Ordering::Release);
                {
                    let mut staging = inner.staging();
                    staging.pending = None;
                    staging.spare = None;
                }
                // Queued after any conversion still in flight
                let result = inner.render.destroy_output(inner.output).await;
                info!(
                    session = %inner.session,
                    processed = inner.processed.load(Ordering::Relaxed),
                    coalesced = inner.coalesced.load(Ordering::Relaxed),
                    "Compute bridge disposed"
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

    fn frame(res: Resolution, timestamp_ns: i64) -> FramePlanes {
        let mut planes = FramePlanes::for_layout(PlaneLayout::semi_planar(res));
        planes.y.fill(200);
        planes.u.fill(128);
        planes.v.fill(128);
        planes.timestamp_ns = timestamp_ns;
        planes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_are_converted_in_order() {
        let render = RenderQueue::headless(HeadlessOptions::default()).unwrap();
        let frames = EventBus::live(64);
        let mut events = frames.subscribe();
        let res = Resolution::new(8, 4);
        let bridge = ComputeBridge::create(SessionId::new(), render.clone(), res, frames)
            .await
            .unwrap();

        let mut callback = bridge.frame_callback();
        for ts in 1..=5 {
            let planes = frame(res, ts * 1000);
            callback(&planes.view().unwrap());
        }

        let mut last = 0;
        let mut processed = 0;
        while let Some(event) = events.recv_timeout(Duration::from_millis(500)).await {
            if let FrameEvent::FrameProcessed { texture, timestamp_ns, .. } = event {
                assert!(timestamp_ns > last);
                last = timestamp_ns;
                processed += 1;
                assert_eq!(texture.pixels.as_ref().map(|p| p.len()), Some(res.rgba_len()));
                if timestamp_ns == 5000 {
                    break;
                }
            }
        }
        // The newest frame always makes it; older ones may be coalesced
        assert_eq!(last, 5000);
        assert_eq!(processed + bridge.coalesced(), 5);

        bridge.dispose().await.unwrap();
        assert!(bridge.is_closed());
        // Second dispose is a no-op
        bridge.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_events_after_dispose() {
        let render = RenderQueue::headless(HeadlessOptions::default()).unwrap();
        let frames = EventBus::live(64);
        let res = Resolution::new(4, 4);
        let bridge = ComputeBridge::create(SessionId::new(), render, res, frames.clone())
            .await
            .unwrap();
        let mut callback = bridge.frame_callback();
        bridge.dispose().await.unwrap();

        let mut events = frames.subscribe();
        let planes = frame(res, 42);
        callback(&planes.view().unwrap());
        let got = events.recv_timeout(Duration::from_millis(100)).await;
        assert!(got.is_none(), "unexpected event after dispose: {:?}", got);
    }
}
