// SPDX-License-Identifier: GPL-3.0-only

//! Device handle: one open camera connection
//!
//! Opening is asynchronous. The handle starts in `Initializing` and moves to
//! `Opened` or `Erred` when the platform calls back. Errors and disconnects
//! cascade into a full close: every pipeline created on the device is
//! disposed before the platform connection is released, so no session
//! outlives its device.

use super::SessionTimeouts;
use super::pipeline::{Pipeline, PipelineCore, PipelineSpec};
use crate::backends::camera::{
    CameraPlatform, CaptureTemplate, DeviceCallbacks, DeviceState, PlatformDevice, Resolution,
    SessionMode,
};
use crate::config::PipelineConfig;
use crate::constants::LIFECYCLE_EVENT_HISTORY;
use crate::errors::{CameraError, CameraResult, PlatformError};
use crate::events::{DeviceEvent, EventBus, EventStream};
use crate::render::RenderQueue;
use futures::future::{AbortRegistration, Abortable, join_all};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, watch};
use tracing::{debug, error, info, warn};

enum DeviceSlot {
    Pending,
    Open(Arc<dyn PlatformDevice>),
    /// Taken by close; a late open must close itself
    Retired,
}

struct DeviceInner {
    camera_id: String,
    render: RenderQueue,
    config: PipelineConfig,
    runtime: Handle,
    state: watch::Sender<DeviceState>,
    error_code: Mutex<Option<i32>>,
    device: Mutex<DeviceSlot>,
    pipelines: Mutex<Vec<Weak<PipelineCore>>>,
    events: EventBus<DeviceEvent>,
    close_requested: AtomicBool,
    ever_opened: AtomicBool,
    platform_closed: watch::Sender<bool>,
    closed: OnceCell<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeviceInner {
    fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    fn reported_id(&self) -> Option<String> {
        self.ever_opened
            .load(Ordering::Acquire)
            .then(|| self.camera_id.clone())
    }

    fn open_device(&self) -> Option<Arc<dyn PlatformDevice>> {
        match &*lock(&self.device) {
            DeviceSlot::Open(device) => Some(Arc::clone(device)),
            _ => None,
        }
    }

    fn reject_session(&self, reason: String) {
        warn!(camera = %self.camera_id, reason = %reason, "Session not created");
        self.events.emit(DeviceEvent::SessionRejected {
            camera_id: self.camera_id.clone(),
            reason,
        });
    }

    /// Record a terminal error. Erred survives the close that follows.
    fn fail(&self, error: &PlatformError) {
        *lock(&self.error_code) = Some(error.code());
        let erred = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = DeviceState::Erred;
                true
            }
        });
        if erred {
            error!(camera = %self.camera_id, error = %error, code = error.code(), "Camera error");
            self.events.emit(DeviceEvent::Erred {
                camera_id: self.reported_id(),
                code: error.code(),
            });
        }
    }

    fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            configure: self.config.init_timeout(),
            close_drain: self.config.close_drain_timeout(),
            graphics_teardown: self.config.graphics_teardown_timeout(),
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let slot = std::mem::replace(
            self.device.get_mut().unwrap_or_else(|e| e.into_inner()),
            DeviceSlot::Retired,
        );
        if let DeviceSlot::Open(device) = slot {
            debug!(camera = %self.camera_id, "Device handle dropped while open, closing");
            device.close();
        }
    }
}

/// Handle to an opened (or opening) camera
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    /// Start opening `camera_id`. Returns immediately in `Initializing`.
    ///
    /// Must be called within a tokio runtime; callbacks from the platform
    /// schedule their follow-up work on it.
    pub fn open(
        platform: &dyn CameraPlatform,
        camera_id: &str,
        render: RenderQueue,
        config: PipelineConfig,
    ) -> CameraResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            CameraError::InvalidState("opening a camera needs a tokio runtime".to_string())
        })?;

        let handle = Self {
            inner: Arc::new(DeviceInner {
                camera_id: camera_id.to_string(),
                render,
                config,
                runtime,
                state: watch::Sender::new(DeviceState::Initializing),
                error_code: Mutex::new(None),
                device: Mutex::new(DeviceSlot::Pending),
                pipelines: Mutex::new(Vec::new()),
                events: EventBus::with_history(LIFECYCLE_EVENT_HISTORY),
                close_requested: AtomicBool::new(false),
                ever_opened: AtomicBool::new(false),
                platform_closed: watch::Sender::new(false),
                closed: OnceCell::new(),
            }),
        };

        info!(camera = %camera_id, platform = platform.name(), "Opening camera");
        let listener = Arc::new(DeviceListener {
            inner: Arc::downgrade(&handle.inner),
        });
        if let Err(e) = platform.open_device(camera_id, listener) {
            handle.inner.fail(&e);
            handle.spawn_close();
        }

        Ok(handle)
    }

    pub fn id(&self) -> &str {
        &self.inner.camera_id
    }

    pub fn state(&self) -> DeviceState {
        self.inner.state()
    }

    /// Platform error code of the failure that erred the device
    pub fn error_code(&self) -> Option<i32> {
        *lock(&self.inner.error_code)
    }

    /// Lifecycle events, starting with any already emitted
    pub fn subscribe(&self) -> EventStream<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    /// Pipelines created on this device that are still alive
    pub fn pipeline_count(&self) -> usize {
        lock(&self.inner.pipelines)
            .iter()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Wait until opening resolves, bounded by the configured init timeout.
    pub async fn wait_for_initialization(&self) -> CameraResult<DeviceState> {
        let mut rx = self.inner.state.subscribe();
        let timeout = self.inner.config.init_timeout();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s != DeviceState::Initializing))
            .await
        {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Ok(self.state()),
            Err(_) => {
                warn!(camera = %self.inner.camera_id, ?timeout, "Timed out waiting for camera to open");
                Err(CameraError::Timeout(format!(
                    "camera {} to open",
                    self.inner.camera_id
                )))
            }
        }
    }

    /// `wait_for_initialization` that the caller can abandon.
    ///
    /// Aborting only ends the wait; the open itself carries on.
    pub async fn wait_for_initialization_with(
        &self,
        registration: AbortRegistration,
    ) -> CameraResult<DeviceState> {
        Abortable::new(self.wait_for_initialization(), registration)
            .await
            .map_err(|_| CameraError::Cancelled)?
    }

    /// Pipeline streaming every frame with `template`.
    ///
    /// `None` if the device is not opened or is closing; the reason is
    /// published as `DeviceEvent::SessionRejected`.
    pub async fn create_continuous_session(
        &self,
        resolution: Resolution,
        template: CaptureTemplate,
    ) -> Option<Pipeline> {
        self.create_pipeline(SessionMode::Continuous, resolution, template)
            .await
    }

    /// Pipeline that delivers frames only for `request_capture` calls
    pub async fn create_on_demand_session(&self, resolution: Resolution) -> Option<Pipeline> {
        self.create_pipeline(
            SessionMode::OnDemand,
            resolution,
            CaptureTemplate::StillCapture,
        )
        .await
    }

    async fn create_pipeline(
        &self,
        mode: SessionMode,
        resolution: Resolution,
        template: CaptureTemplate,
    ) -> Option<Pipeline> {
        let inner = &self.inner;
        if inner.close_requested.load(Ordering::Acquire) {
            inner.reject_session("device is closing".to_string());
            return None;
        }
        let state = inner.state();
        if state != DeviceState::Opened {
            inner.reject_session(format!("device is {}", state));
            return None;
        }
        if resolution.is_empty() {
            inner.reject_session(format!("invalid resolution {}", resolution));
            return None;
        }
        let output_size = inner.config.output_size_for(resolution);
        if output_size.is_empty() {
            inner.reject_session(format!("invalid output size {}", output_size));
            return None;
        }
        let Some(device) = inner.open_device() else {
            inner.reject_session("device connection is gone".to_string());
            return None;
        };

        let spec = PipelineSpec {
            camera_id: inner.camera_id.clone(),
            mode,
            template,
            resolution,
            output_size,
            path: inner.config.conversion_path,
            timeouts: inner.session_timeouts(),
        };
        let pipeline =
            match Pipeline::build(device, inner.render.clone(), spec, inner.runtime.clone()).await
            {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    inner.reject_session(e.to_string());
                    return None;
                }
            };

        {
            let mut pipelines = lock(&inner.pipelines);
            pipelines.retain(|p| p.strong_count() > 0);
            pipelines.push(Arc::downgrade(pipeline.core()));
        }
        // A close that started while the pipeline was being built
        if inner.close_requested.load(Ordering::Acquire) {
            pipeline.dispose().await;
            inner.reject_session("device closed during session creation".to_string());
            return None;
        }

        info!(
            camera = %inner.camera_id,
            session = %pipeline.session_id(),
            mode = %mode,
            "Pipeline created"
        );
        Some(pipeline)
    }

    /// Dispose every pipeline on the device, then release the connection.
    ///
    /// Idempotent; concurrent callers wait for the same close and `Closed`
    /// is emitted once.
    pub async fn close(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.closed.get_or_init(|| teardown(inner)).await;
    }

    fn spawn_close(&self) {
        let this = self.clone();
        self.inner.runtime.spawn(async move { this.close().await });
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("camera", &self.inner.camera_id)
            .field("state", &self.state())
            .field("error_code", &self.error_code())
            .finish()
    }
}

async fn teardown(inner: Arc<DeviceInner>) {
    inner.close_requested.store(true, Ordering::Release);
    info!(camera = %inner.camera_id, state = %inner.state(), "Closing camera");

    let pipelines: Vec<Arc<PipelineCore>> = lock(&inner.pipelines)
        .drain(..)
        .filter_map(|p| p.upgrade())
        .collect();
    if !pipelines.is_empty() {
        debug!(camera = %inner.camera_id, count = pipelines.len(), "Disposing pipelines");
        join_all(pipelines.iter().map(|p| p.dispose())).await;
    }

    // An open in flight has to land before there is anything to close
    if inner.state() == DeviceState::Initializing {
        let mut rx = inner.state.subscribe();
        let wait = tokio::time::timeout(
            inner.config.init_timeout(),
            rx.wait_for(|s| *s != DeviceState::Initializing),
        );
        if wait.await.is_err() {
            warn!(camera = %inner.camera_id, "Camera still opening at close");
        }
    }

    let slot = std::mem::replace(&mut *lock(&inner.device), DeviceSlot::Retired);
    if let DeviceSlot::Open(device) = slot {
        let mut closed = inner.platform_closed.subscribe();
        if let Err(e) = tokio::task::spawn_blocking(move || device.close()).await {
            warn!(camera = %inner.camera_id, error = %e, "Device close task failed");
        }
        let wait = tokio::time::timeout(
            inner.config.close_drain_timeout(),
            closed.wait_for(|c| *c),
        );
        if wait.await.is_err() {
            warn!(camera = %inner.camera_id, "Timed out waiting for the platform to close the camera");
        }
    }

    inner.state.send_if_modified(|state| {
        if *state == DeviceState::Erred {
            false
        } else {
            *state = DeviceState::Closed;
            true
        }
    });
    inner.events.emit(DeviceEvent::Closed {
        camera_id: inner.reported_id(),
    });
    info!(camera = %inner.camera_id, "Camera closed");
}

/// Platform-facing callbacks; holds the device weakly
struct DeviceListener {
    inner: Weak<DeviceInner>,
}

impl DeviceListener {
    fn cascade_close(inner: Arc<DeviceInner>) {
        let runtime = inner.runtime.clone();
        let handle = DeviceHandle { inner };
        runtime.spawn(async move { handle.close().await });
    }
}

impl DeviceCallbacks for DeviceListener {
    fn on_opened(&self, device: Arc<dyn PlatformDevice>) {
        let Some(inner) = self.inner.upgrade() else {
            device.close();
            return;
        };

        {
            let mut slot = lock(&inner.device);
            if matches!(*slot, DeviceSlot::Retired) {
                drop(slot);
                debug!(camera = %inner.camera_id, "Opened after close, releasing");
                device.close();
                return;
            }
            *slot = DeviceSlot::Open(device);
        }
        inner.ever_opened.store(true, Ordering::Release);

        let opened = inner.state.send_if_modified(|state| {
            if *state == DeviceState::Initializing {
                *state = DeviceState::Opened;
                true
            } else {
                false
            }
        });
        if opened && !inner.close_requested.load(Ordering::Acquire) {
            info!(camera = %inner.camera_id, "Camera opened");
            inner.events.emit(DeviceEvent::Opened {
                camera_id: inner.camera_id.clone(),
            });
        }
    }

    fn on_disconnected(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        warn!(camera = %inner.camera_id, "Camera disconnected");
        inner.events.emit(DeviceEvent::Disconnected {
            camera_id: inner.camera_id.clone(),
        });
        Self::cascade_close(inner);
    }

    fn on_error(&self, error: PlatformError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.fail(&error);
        Self::cascade_close(inner);
    }

    fn on_closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.platform_closed.send_replace(true);
        }
    }
}
