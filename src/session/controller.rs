// SPDX-License-Identifier: GPL-3.0-only

//! Capture session lifecycle
//!
//! A `SessionController` owns one platform capture session, the frame source
//! its main output feeds, and the graphics teardown hook of the bridge that
//! consumes those frames. State moves strictly forward:
//! Initializing → Configuring → Opened → Closing → Closed.
//!
//! A single-slot token is held while the platform configures the session.
//! `close()` takes the same token, so a close requested mid-configuration
//! waits for configuration to resolve before it tears anything down. Teardown
//! then runs in a fixed order: stop the repeating request and wait for the
//! sensor to go idle, drain deliveries in flight, close the platform session
//! and wait for its confirmation, stop the capture thread, release the frame
//! buffers, and finally run the graphics teardown.

use crate::backends::camera::{
    CaptureRequest, CaptureTemplate, OutputTarget, PlatformDevice, PlatformSession, Resolution,
    SessionCallbacks, SessionId, SessionMode, SessionOutput, SessionState, TargetId,
};
use crate::constants::LIFECYCLE_EVENT_HISTORY;
use crate::errors::{CameraError, CameraResult, RenderError};
use crate::events::{EventBus, EventStream, SessionEvent};
use crate::frame::{DeliveryGate, FrameCallback, FrameSource, FrameSourceStats};
use crate::render::ExternalSurface;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, trace, warn};

/// Output that receives client-visible frames
const MAIN_TARGET: TargetId = TargetId(1);
/// Discarding output that keeps an on-demand session's sensor running
const BACKGROUND_TARGET: TargetId = TargetId(2);

/// Releases the graphics resources of a session's bridge.
///
/// Runs once, after the platform has confirmed the session closed.
pub type GraphicsTeardown =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), RenderError>> + Send>;

/// Where the session's main output goes
pub enum SessionSink {
    /// Raw planes, delivered on the capture thread
    Frames(FrameCallback),
    /// An external texture surface the camera writes into
    Surface(ExternalSurface),
}

/// Bounds on the waits inside `close()`
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Pending configuration
    pub configure: Duration,
    /// Sensor idle, delivery drain and platform close confirmation, each
    pub close_drain: Duration,
    /// Graphics teardown confirmation
    pub graphics_teardown: Duration,
}

pub(crate) struct SessionParams {
    pub id: SessionId,
    pub camera_id: String,
    pub mode: SessionMode,
    pub template: CaptureTemplate,
    pub resolution: Resolution,
    pub sink: SessionSink,
    pub graphics_teardown: Option<GraphicsTeardown>,
    pub timeouts: SessionTimeouts,
}

/// Session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    /// Raw frame counters; zero for sessions that feed a surface
    pub frames: FrameSourceStats,
    pub captures_requested: u64,
}

enum PlatformSlot {
    /// Configuration has not completed
    Pending,
    Live(Arc<dyn PlatformSession>),
    /// Taken by teardown; a late session must close itself
    Retired,
}

struct SessionInner {
    id: SessionId,
    camera_id: String,
    mode: SessionMode,
    template: CaptureTemplate,
    resolution: Resolution,
    timeouts: SessionTimeouts,
    runtime: Handle,
    state: watch::Sender<SessionState>,
    events: EventBus<SessionEvent>,
    token: Arc<Semaphore>,
    config_permit: Mutex<Option<OwnedSemaphorePermit>>,
    platform: Mutex<PlatformSlot>,
    close_requested: AtomicBool,
    configure_failed: AtomicBool,
    disposed: AtomicBool,
    repeating: AtomicBool,
    idle: watch::Sender<bool>,
    platform_closed: watch::Sender<bool>,
    gate: Arc<DeliveryGate>,
    frame_source: Mutex<Option<FrameSource>>,
    final_frames: Mutex<FrameSourceStats>,
    graphics_teardown: Mutex<Option<GraphicsTeardown>>,
    captures_requested: AtomicU64,
    teardown: OnceCell<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionInner {
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(session = %self.id, from = %previous, to = %next, "Session state");
        }
    }

    fn release_config_token(&self) {
        lock(&self.config_permit).take();
    }

    fn live_session(&self) -> Option<Arc<dyn PlatformSession>> {
        match &*lock(&self.platform) {
            PlatformSlot::Live(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }
}

/// Lifecycle owner of one capture session
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

impl SessionController {
    /// Allocate the session's outputs and ask `device` to configure them.
    ///
    /// Returns as soon as configuration is requested; progress is reported
    /// through `subscribe()`. Must be called within a tokio runtime.
    pub(crate) fn start(
        device: &Arc<dyn PlatformDevice>,
        params: SessionParams,
        runtime: Handle,
    ) -> CameraResult<Self> {
        let SessionParams {
            id,
            camera_id,
            mode,
            template,
            resolution,
            sink,
            graphics_teardown,
            timeouts,
        } = params;

        let gate = Arc::new(DeliveryGate::new());
        let (frame_source, main_target) = match sink {
            SessionSink::Frames(callback) => {
                let source =
                    FrameSource::start(format!("session-{}", id), Arc::clone(&gate), callback)?;
                let producer = source.producer();
                (Some(source), OutputTarget::Frames(producer))
            }
            SessionSink::Surface(surface) => (None, OutputTarget::Surface(surface)),
        };

        let mut outputs = vec![SessionOutput {
            id: MAIN_TARGET,
            resolution,
            target: main_target,
        }];
        if mode == SessionMode::OnDemand {
            outputs.push(SessionOutput {
                id: BACKGROUND_TARGET,
                resolution,
                target: OutputTarget::Discard,
            });
        }

        let token = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&token)
            .try_acquire_owned()
            .map_err(|e| CameraError::InvalidState(format!("session token: {}", e)))?;

        let inner = Arc::new(SessionInner {
            id,
            camera_id,
            mode,
            template,
            resolution,
            timeouts,
            runtime,
            state: watch::Sender::new(SessionState::Initializing),
            events: EventBus::with_history(LIFECYCLE_EVENT_HISTORY),
            token,
            config_permit: Mutex::new(Some(permit)),
            platform: Mutex::new(PlatformSlot::Pending),
            close_requested: AtomicBool::new(false),
            configure_failed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            repeating: AtomicBool::new(false),
            idle: watch::Sender::new(false),
            platform_closed: watch::Sender::new(false),
            gate,
            frame_source: Mutex::new(frame_source),
            final_frames: Mutex::new(FrameSourceStats::default()),
            graphics_teardown: Mutex::new(graphics_teardown),
            captures_requested: AtomicU64::new(0),
            teardown: OnceCell::new(),
        });
        let controller = Self { inner };

        info!(
            camera = %controller.inner.camera_id,
            session = %id,
            mode = %mode,
            width = resolution.width,
            height = resolution.height,
            "Configuring capture session"
        );
        controller.inner.set_state(SessionState::Configuring);

        let listener = Arc::new(SessionListener {
            inner: Arc::downgrade(&controller.inner),
        });
        if let Err(e) = device.create_capture_session(outputs, listener) {
            warn!(session = %id, error = %e, "Session configuration refused");
            controller.inner.configure_failed.store(true, Ordering::Release);
            controller.inner.events.emit(SessionEvent::ConfigurationFailed {
                session: id,
                is_access_or_security_error: e.is_access_or_security(),
            });
            controller.inner.release_config_token();
            controller.spawn_close();
        }

        Ok(controller)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn camera_id(&self) -> &str {
        &self.inner.camera_id
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode
    }

    pub fn template(&self) -> CaptureTemplate {
        self.inner.template
    }

    pub fn resolution(&self) -> Resolution {
        self.inner.resolution
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Lifecycle events, starting with any already emitted
    pub fn subscribe(&self) -> EventStream<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the state satisfies `pred`. `None` on timeout.
    pub async fn wait_for_state(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(SessionState) -> bool,
    ) -> Option<SessionState> {
        let mut rx = self.inner.state.subscribe();
        let wait = async {
            rx.wait_for(|s| pred(*s)).await.ok().map(|s| *s)
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub fn is_close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    /// Queue a one-shot capture into the main output.
    ///
    /// Returns `Ok(false)` while the session is not (or no longer) opened.
    /// Calling this on a disposed or continuous session is a caller bug.
    pub fn request_capture(&self, template: CaptureTemplate) -> CameraResult<bool> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Err(CameraError::InvalidState(format!(
                "session {} is disposed",
                inner.id
            )));
        }
        if inner.mode != SessionMode::OnDemand {
            return Err(CameraError::InvalidState(format!(
                "session {} is {}, one-shot captures need an on-demand session",
                inner.id, inner.mode
            )));
        }
        if inner.close_requested.load(Ordering::Acquire) || self.state() != SessionState::Opened {
            debug!(session = %inner.id, state = %self.state(), "Capture request ignored");
            return Ok(false);
        }
        let Some(session) = inner.live_session() else {
            return Ok(false);
        };

        match session.capture(CaptureRequest::new(template, MAIN_TARGET)) {
            Ok(sequence_id) => {
                inner.captures_requested.fetch_add(1, Ordering::Relaxed);
                trace!(session = %inner.id, sequence_id, template = %template, "One-shot capture");
                Ok(true)
            }
            Err(e) => {
                warn!(session = %inner.id, error = %e, "One-shot capture rejected");
                inner.events.emit(SessionEvent::RequestFailed {
                    session: inner.id,
                    code: e.code(),
                });
                Ok(false)
            }
        }
    }

    pub fn stats(&self) -> SessionStats {
        let frames = match &*lock(&self.inner.frame_source) {
            Some(source) => source.stats(),
            None => *lock(&self.inner.final_frames),
        };
        SessionStats {
            state: self.state(),
            frames,
            captures_requested: self.inner.captures_requested.load(Ordering::Relaxed),
        }
    }

    /// Tear the session down. Idempotent; concurrent callers all wait for
    /// the same teardown and `Closed` is emitted once.
    pub async fn close(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .teardown
            .get_or_init(|| teardown(inner))
            .await;
    }

    pub(crate) fn spawn_close(&self) {
        let this = self.clone();
        self.inner.runtime.spawn(async move { this.close().await });
    }

    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// The graphics side could not be wired up; the session cannot render
    pub(crate) fn fail_registration(&self, reason: String) {
        warn!(session = %self.inner.id, reason = %reason, "Texture registration failed");
        self.inner.events.emit(SessionEvent::RegistrationFailed {
            session: self.inner.id,
            reason,
        });
        self.spawn_close();
    }

    pub(crate) fn emit_dispose_completed(&self) {
        self.inner.events.emit(SessionEvent::DisposeCompleted {
            session: self.inner.id,
        });
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.inner.id)
            .field("camera", &self.inner.camera_id)
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .finish()
    }
}

async fn teardown(inner: Arc<SessionInner>) {
    let id = inner.id;
    let timeouts = inner.timeouts;
    inner.close_requested.store(true, Ordering::Release);
    if !inner.configure_failed.load(Ordering::Acquire) {
        inner.set_state(SessionState::Closing);
    }
    info!(camera = %inner.camera_id, session = %id, "Closing capture session");

    // Configuration in progress finishes (or fails) first
    let permit = match tokio::time::timeout(
        timeouts.configure,
        Arc::clone(&inner.token).acquire_owned(),
    )
    .await
    {
        Ok(Ok(permit)) => Some(permit),
        Ok(Err(_)) => None,
        Err(_) => {
            warn!(session = %id, "Timed out waiting for configuration, closing anyway");
            None
        }
    };

    let session = match std::mem::replace(&mut *lock(&inner.platform), PlatformSlot::Retired) {
        PlatformSlot::Live(session) => Some(session),
        _ => None,
    };

    let platform_closed = *inner.platform_closed.borrow();
    if let Some(session) = &session
        && inner.repeating.swap(false, Ordering::AcqRel)
        && !platform_closed
    {
        inner.idle.send_replace(false);
        let mut idle = inner.idle.subscribe();
        match session.stop_repeating() {
            Ok(()) => {
                let wait = tokio::time::timeout(timeouts.close_drain, idle.wait_for(|i| *i));
                if wait.await.is_err() {
                    warn!(session = %id, "Timed out waiting for in-flight captures");
                }
            }
            Err(e) => warn!(session = %id, error = %e, "Stopping the repeating request failed"),
        }
    }

    let gate = Arc::clone(&inner.gate);
    match tokio::task::spawn_blocking(move || gate.close_and_drain(timeouts.close_drain)).await {
        Ok(true) => {}
        Ok(false) => warn!(session = %id, "Timed out draining frame deliveries"),
        Err(e) => warn!(session = %id, error = %e, "Delivery drain task failed"),
    }

    if let Some(session) = session {
        let mut closed = inner.platform_closed.subscribe();
        if let Err(e) = tokio::task::spawn_blocking(move || session.close()).await {
            warn!(session = %id, error = %e, "Platform session close task failed");
        }
        let wait = tokio::time::timeout(timeouts.close_drain, closed.wait_for(|c| *c));
        if wait.await.is_err() {
            warn!(session = %id, "Timed out waiting for the platform to close the session");
        }
    }

    let source = lock(&inner.frame_source).take();
    if let Some(mut source) = source {
        let stopped = tokio::task::spawn_blocking(move || {
            source.shutdown();
            source.release_buffers();
            source.stats()
        })
        .await;
        match stopped {
            Ok(stats) => {
                debug!(
                    session = %id,
                    delivered = stats.delivered,
                    dropped = stats.dropped,
                    "Capture thread stopped"
                );
                *lock(&inner.final_frames) = stats;
            }
            Err(e) => warn!(session = %id, error = %e, "Capture thread shutdown failed"),
        }
    }

    // Graphics resources go last: nothing can write into them any more
    let hook = lock(&inner.graphics_teardown).take();
    if let Some(hook) = hook {
        match tokio::time::timeout(timeouts.graphics_teardown, hook()).await {
            Ok(Ok(())) => debug!(session = %id, "Graphics resources released"),
            Ok(Err(e)) => warn!(session = %id, error = %e, "Graphics teardown failed"),
            Err(_) => warn!(session = %id, "Timed out waiting for graphics teardown"),
        }
    }

    drop(permit);
    inner.set_state(SessionState::Closed);
    inner.events.emit(SessionEvent::Closed { session: id });
    info!(camera = %inner.camera_id, session = %id, "Capture session closed");
}

/// Platform-facing callbacks; holds the session weakly
struct SessionListener {
    inner: Weak<SessionInner>,
}

impl SessionCallbacks for SessionListener {
    fn on_configured(&self, session: Arc<dyn PlatformSession>) {
        let Some(inner) = self.inner.upgrade() else {
            session.close();
            return;
        };

        {
            let mut slot = lock(&inner.platform);
            if matches!(*slot, PlatformSlot::Retired) {
                drop(slot);
                debug!(session = %inner.id, "Configured after teardown, closing");
                session.close();
                inner.release_config_token();
                return;
            }
            *slot = PlatformSlot::Live(Arc::clone(&session));
        }

        if inner.close_requested.load(Ordering::Acquire) {
            // Teardown is waiting on the token and will close it
            debug!(session = %inner.id, "Configured after close was requested, not activating");
            inner.release_config_token();
            return;
        }

        inner.events.emit(SessionEvent::Configured { session: inner.id });

        let request = match inner.mode {
            SessionMode::Continuous => CaptureRequest::new(inner.template, MAIN_TARGET),
            SessionMode::OnDemand => {
                CaptureRequest::new(CaptureTemplate::Preview, BACKGROUND_TARGET)
            }
        };
        match session.set_repeating_request(request) {
            Ok(sequence_id) => {
                inner.repeating.store(true, Ordering::Release);
                debug!(session = %inner.id, sequence_id, "Repeating request set");
                inner.events.emit(SessionEvent::RequestSet {
                    session: inner.id,
                    sequence_id,
                });
                inner.release_config_token();
            }
            Err(e) => {
                warn!(session = %inner.id, error = %e, "Repeating request rejected");
                inner.events.emit(SessionEvent::RequestFailed {
                    session: inner.id,
                    code: e.code(),
                });
                inner.release_config_token();
                SessionController { inner }.spawn_close();
            }
        }
    }

    fn on_configure_failed(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        warn!(session = %inner.id, "Session configuration failed");
        inner.configure_failed.store(true, Ordering::Release);
        inner.events.emit(SessionEvent::ConfigurationFailed {
            session: inner.id,
            is_access_or_security_error: false,
        });
        inner.release_config_token();
        SessionController { inner }.spawn_close();
    }

    fn on_active(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.close_requested.load(Ordering::Acquire) {
            return;
        }
        let activated = inner.state.send_if_modified(|state| {
            if *state == SessionState::Configuring {
                *state = SessionState::Opened;
                true
            } else {
                false
            }
        });
        if activated {
            info!(session = %inner.id, "Capture session active");
            inner.events.emit(SessionEvent::Active { session: inner.id });
        }
    }

    fn on_ready(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.idle.send_replace(true);
        }
    }

    fn on_closed(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.platform_closed.send_replace(true);
        // No configure callback follows a session closed while pending
        if matches!(*lock(&inner.platform), PlatformSlot::Pending) {
            inner.release_config_token();
        }
        // Closed underneath us, e.g. replaced by a newer session on the device
        if !inner.close_requested.load(Ordering::Acquire) {
            warn!(session = %inner.id, "Capture session closed by the platform");
            SessionController { inner }.spawn_close();
        }
    }
}
