// SPDX-License-Identifier: GPL-3.0-only

//! External surface: the hardware-facing end of an external texture
//!
//! The camera writes images into the surface from its own thread; the render
//! thread latches the newest one when it processes a render command. Only the
//! newest posted image is kept.

use super::ExternalTextureId;
use crate::backends::camera::{FramePlanes, PlaneLayout, Resolution, TextureTransform};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Invoked on the posting thread whenever a new image is available
pub type FrameAvailableListener = Arc<dyn Fn() + Send + Sync>;

/// An image taken off the surface by the render thread
#[derive(Debug)]
pub struct LatchedImage {
    pub planes: FramePlanes,
    pub transform: TextureTransform,
}

struct SurfaceState {
    pending: Option<FramePlanes>,
    spare: Option<FramePlanes>,
    transform: TextureTransform,
    listener: Option<FrameAvailableListener>,
    released: bool,
}

struct SurfaceInner {
    id: ExternalTextureId,
    resolution: Resolution,
    state: Mutex<SurfaceState>,
    posted: AtomicU64,
    replaced: AtomicU64,
}

impl SurfaceInner {
    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ExternalSurface {
    inner: Arc<SurfaceInner>,
}

impl ExternalSurface {
    pub fn new(id: ExternalTextureId, resolution: Resolution) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                id,
                resolution,
                state: Mutex::new(SurfaceState {
                    pending: None,
                    spare: None,
                    transform: TextureTransform::IDENTITY,
                    listener: None,
                    released: false,
                }),
                posted: AtomicU64::new(0),
                replaced: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> ExternalTextureId {
        self.inner.id
    }

    pub fn resolution(&self) -> Resolution {
        self.inner.resolution
    }

    /// Texture transform reported with every latched image
    pub fn set_transform(&self, transform: TextureTransform) {
        self.inner.lock().transform = transform;
    }

    pub fn set_frame_available_listener(&self, listener: FrameAvailableListener) {
        self.inner.lock().listener = Some(listener);
    }

    pub fn clear_frame_available_listener(&self) {
        self.inner.lock().listener = None;
    }

    /// Write the next image. `fill` runs without the surface lock held.
    ///
    /// Returns `false` once the surface is released.
    pub fn post_with(
        &self,
        layout: PlaneLayout,
        timestamp_ns: i64,
        sequence: u64,
        fill: impl FnOnce(&mut FramePlanes),
    ) -> bool {
        let mut buffer = {
            let mut state = self.inner.lock();
            if state.released {
                return false;
            }
            state.spare.take().unwrap_or_default()
        };

        buffer.y.resize(layout.y_len(), 0);
        buffer.u.resize(layout.uv_len(), 0);
        buffer.v.resize(layout.uv_len(), 0);
        buffer.layout = Some(layout);
        fill(&mut buffer);
        buffer.timestamp_ns = timestamp_ns;
        buffer.sequence = sequence;

        let listener = {
            let mut state = self.inner.lock();
            if state.released {
                return false;
            }
            if let Some(old) = state.pending.replace(buffer) {
                self.inner.replaced.fetch_add(1, Ordering::Relaxed);
                state.spare = Some(old);
            }
            state.listener.clone()
        };
        self.inner.posted.fetch_add(1, Ordering::Relaxed);

        if let Some(listener) = listener {
            listener();
        }
        true
    }

    /// Take the newest image, if one arrived since the last latch
    pub fn latch(&self) -> Option<LatchedImage> {
        let mut state = self.inner.lock();
        let planes = state.pending.take()?;
        Some(LatchedImage {
            planes,
            transform: state.transform,
        })
    }

    /// Hand a latched image's buffers back for reuse
    pub fn recycle(&self, image: LatchedImage) {
        let mut state = self.inner.lock();
        if !state.released && state.spare.is_none() {
            state.spare = Some(image.planes);
        }
    }

    /// Refuse further posts and drop all image memory
    pub fn release(&self) {
        let mut state = self.inner.lock();
        state.released = true;
        state.pending = None;
        state.spare = None;
        state.listener = None;
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    /// An image is waiting to be latched
    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    /// Images posted so far
    pub fn posted(&self) -> u64 {
        self.inner.posted.load(Ordering::Relaxed)
    }

    /// Images replaced before they were latched
    pub fn replaced(&self) -> u64 {
        self.inner.replaced.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ExternalSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSurface")
            .field("id", &self.inner.id)
            .field("resolution", &self.inner.resolution)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn surface() -> ExternalSurface {
        ExternalSurface::new(ExternalTextureId(7), Resolution::new(8, 8))
    }

    fn layout() -> PlaneLayout {
        PlaneLayout::semi_planar(Resolution::new(8, 8))
    }

    #[test]
    fn test_latch_returns_newest_image() {
        let surface = surface();
        for ts in 1..=3 {
            assert!(surface.post_with(layout(), ts, ts as u64, |p| p.y[0] = ts as u8));
        }

        let image = surface.latch().unwrap();
        assert_eq!(image.planes.timestamp_ns, 3);
        assert_eq!(image.planes.y[0], 3);
        assert_eq!(surface.replaced(), 2);
        assert!(surface.latch().is_none());
    }

    #[test]
    fn test_listener_fires_per_post() {
        let surface = surface();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        surface.set_frame_available_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        surface.post_with(layout(), 1, 0, |_| {});
        surface.post_with(layout(), 2, 1, |_| {});
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_released_surface_rejects_posts() {
        let surface = surface();
        surface.release();
        assert!(!surface.post_with(layout(), 1, 0, |_| {}));
        assert!(surface.latch().is_none());
        assert_eq!(surface.posted(), 0);
    }
}
