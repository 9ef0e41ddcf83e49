// SPDX-License-Identifier: GPL-3.0-only

//! Virtual camera platform
//!
//! A software camera stack with Camera2 semantics: opening a device and
//! configuring a session complete asynchronously on a callback thread, each
//! session runs a sensor thread that writes synthetic YUV_420_888 frames into
//! its outputs, and closes are confirmed by `on_closed` callbacks.
//!
//! Faults can be injected at runtime through [`VirtualFaults`] to exercise
//! error, disconnect and rejection paths.
//!
//! # Architecture
//!
//! ```text
//! open_device ──► camera-callbacks thread ──► on_opened / on_error
//!                        ▲
//! create_capture_session │ on_configured / on_active / on_ready / on_closed
//!        │               │
//!        ▼               │
//!   camera-sensor thread ┘ ──► FrameProducer / ExternalSurface / Discard
//! ```

mod dispatcher;
mod session;

use crate::backends::camera::{
    CameraPlatform, DeviceCallbacks, PlatformDevice, PlatformSession, SessionCallbacks,
    SessionOutput,
};
use crate::constants::DEFAULT_FRAME_INTERVAL;
use crate::errors::PlatformError;
use dispatcher::CallbackDispatcher;
use session::VirtualSession;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static behaviour of the simulated stack
#[derive(Debug, Clone)]
pub struct VirtualCameraConfig {
    pub camera_ids: Vec<String>,
    pub frame_interval: Duration,
    /// Time between `open_device` and `on_opened`
    pub open_delay: Duration,
    /// Time between `create_capture_session` and `on_configured`
    pub configure_delay: Duration,
    /// Devices that may be open at once
    pub max_open: usize,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            camera_ids: vec!["0".to_string(), "1".to_string()],
            frame_interval: DEFAULT_FRAME_INTERVAL,
            open_delay: Duration::from_millis(5),
            configure_delay: Duration::from_millis(5),
            max_open: 2,
        }
    }
}

/// Runtime fault injection
#[derive(Debug, Clone, Default)]
pub struct VirtualFaults {
    /// `open_device` fails synchronously
    pub reject_open: Option<PlatformError>,
    /// `on_error` instead of `on_opened`
    pub open_error: Option<PlatformError>,
    /// `on_disconnected` this long after `on_opened`
    pub disconnect_after: Option<Duration>,
    /// `create_capture_session` fails synchronously
    pub reject_session: Option<PlatformError>,
    /// `on_configure_failed` instead of `on_configured`
    pub fail_configure: bool,
    /// `set_repeating_request` fails
    pub reject_repeating: Option<PlatformError>,
}

/// Counters for what the stack was asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualCameraStats {
    pub devices_opened: u64,
    pub devices_closed: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub repeating_requests: u64,
    pub capture_requests: u64,
    pub frames_produced: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    devices_opened: AtomicU64,
    devices_closed: AtomicU64,
    sessions_created: AtomicU64,
    pub(crate) sessions_closed: AtomicU64,
    pub(crate) repeating_requests: AtomicU64,
    pub(crate) capture_requests: AtomicU64,
    pub(crate) frames_produced: AtomicU64,
    sequence_ids: AtomicU64,
}

impl Counters {
    pub(crate) fn next_sequence_id(&self) -> u64 {
        self.sequence_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// State shared by the platform, its devices and sessions
pub(crate) struct PlatformShared {
    pub(crate) config: VirtualCameraConfig,
    faults: Mutex<VirtualFaults>,
    pub(crate) dispatcher: CallbackDispatcher,
    open_devices: Mutex<HashSet<String>>,
    pub(crate) counters: Counters,
}

impl PlatformShared {
    pub(crate) fn faults(&self) -> VirtualFaults {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn open_devices(&self) -> MutexGuard<'_, HashSet<String>> {
        self.open_devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Simulated camera stack
pub struct VirtualCameraPlatform {
    shared: Arc<PlatformShared>,
}

impl VirtualCameraPlatform {
    pub fn new(config: VirtualCameraConfig) -> std::io::Result<Self> {
        let dispatcher = CallbackDispatcher::start()?;
        info!(
            cameras = config.camera_ids.len(),
            frame_interval_ms = config.frame_interval.as_millis() as u64,
            "Virtual camera platform started"
        );
        Ok(Self {
            shared: Arc::new(PlatformShared {
                config,
                faults: Mutex::new(VirtualFaults::default()),
                dispatcher,
                open_devices: Mutex::new(HashSet::new()),
                counters: Counters::default(),
            }),
        })
    }

    /// Replace the injected faults; applies to subsequent operations
    pub fn set_faults(&self, faults: VirtualFaults) {
        *self.shared.faults.lock().unwrap_or_else(|e| e.into_inner()) = faults;
    }

    /// Adjust the injected faults in place
    pub fn update_faults(&self, update: impl FnOnce(&mut VirtualFaults)) {
        update(&mut self.shared.faults.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn stats(&self) -> VirtualCameraStats {
        let c = &self.shared.counters;
        VirtualCameraStats {
            devices_opened: c.devices_opened.load(Ordering::Relaxed),
            devices_closed: c.devices_closed.load(Ordering::Relaxed),
            sessions_created: c.sessions_created.load(Ordering::Relaxed),
            sessions_closed: c.sessions_closed.load(Ordering::Relaxed),
            repeating_requests: c.repeating_requests.load(Ordering::Relaxed),
            capture_requests: c.capture_requests.load(Ordering::Relaxed),
            frames_produced: c.frames_produced.load(Ordering::Relaxed),
        }
    }

    /// Devices currently open
    pub fn open_count(&self) -> usize {
        self.shared.open_devices().len()
    }
}

impl CameraPlatform for VirtualCameraPlatform {
    fn name(&self) -> &str {
        "virtual"
    }

    fn camera_ids(&self) -> Vec<String> {
        self.shared.config.camera_ids.clone()
    }

    fn open_device(
        &self,
        camera_id: &str,
        callbacks: Arc<dyn DeviceCallbacks>,
    ) -> Result<(), PlatformError> {
        if !self.shared.config.camera_ids.iter().any(|id| id == camera_id) {
            return Err(PlatformError::UnknownCamera(camera_id.to_string()));
        }
        let faults = self.shared.faults();
        if let Some(e) = faults.reject_open.clone() {
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let camera_id = camera_id.to_string();
        debug!(camera = %camera_id, "Opening virtual camera");

        self.shared
            .dispatcher
            .post_after(self.shared.config.open_delay, move || {
                let refused = {
                    let mut open = shared.open_devices();
                    if open.contains(&camera_id) {
                        Some(PlatformError::CameraInUse)
                    } else if open.len() >= shared.config.max_open {
                        Some(PlatformError::MaxCamerasInUse)
                    } else if let Some(e) = faults.open_error {
                        Some(e)
                    } else {
                        open.insert(camera_id.clone());
                        None
                    }
                };
                if let Some(e) = refused {
                    warn!(camera = %camera_id, error = %e, "Virtual camera open failed");
                    callbacks.on_error(e);
                    return;
                }

                shared.counters.devices_opened.fetch_add(1, Ordering::Relaxed);
                let device = Arc::new(VirtualDevice {
                    id: camera_id.clone(),
                    shared: Arc::clone(&shared),
                    callbacks: Arc::clone(&callbacks),
                    closed: AtomicBool::new(false),
                    sessions: Mutex::new(Vec::new()),
                });

                if let Some(delay) = faults.disconnect_after {
                    let weak = Arc::downgrade(&device);
                    shared.dispatcher.post_after(delay, move || {
                        if let Some(device) = weak.upgrade() {
                            device.disconnect();
                        }
                    });
                }

                callbacks.on_opened(device);
            });

        Ok(())
    }
}

/// An open virtual camera
struct VirtualDevice {
    id: String,
    shared: Arc<PlatformShared>,
    callbacks: Arc<dyn DeviceCallbacks>,
    closed: AtomicBool,
    sessions: Mutex<Vec<Arc<VirtualSession>>>,
}

impl VirtualDevice {
    fn close_sessions(&self) {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for session in sessions {
            session.close();
        }
    }

    fn disconnect(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        warn!(camera = %self.id, "Virtual camera disconnected");
        self.close_sessions();
        self.callbacks.on_disconnected();
    }
}

impl PlatformDevice for VirtualDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_capture_session(
        &self,
        outputs: Vec<SessionOutput>,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<(), PlatformError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlatformError::InvalidRequest("device is closed".to_string()));
        }
        if outputs.is_empty() {
            return Err(PlatformError::InvalidRequest("session has no outputs".to_string()));
        }
        let faults = self.shared.faults();
        if let Some(e) = faults.reject_session.clone() {
            return Err(e);
        }

        // A new session replaces the previous one
        self.close_sessions();

        let session = VirtualSession::start(
            &self.id,
            outputs,
            Arc::clone(&callbacks),
            Arc::clone(&self.shared),
        )?;
        self.shared
            .counters
            .sessions_created
            .fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&session));

        let fail = faults.fail_configure;
        let camera_id = self.id.clone();
        self.shared
            .dispatcher
            .post_after(self.shared.config.configure_delay, move || {
                if session.is_closed() {
                    debug!(camera = %camera_id, "Session closed before configuration finished");
                    return;
                }
                if fail {
                    warn!(camera = %camera_id, "Session configuration failed");
                    session.close();
                    callbacks.on_configure_failed();
                } else {
                    callbacks.on_configured(session);
                }
            });
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_sessions();
        self.shared.open_devices().remove(&self.id);
        self.shared
            .counters
            .devices_closed
            .fetch_add(1, Ordering::Relaxed);
        debug!(camera = %self.id, "Virtual camera closed");

        let callbacks = Arc::clone(&self.callbacks);
        self.shared.dispatcher.post(move || callbacks.on_closed());
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        // Dropped without close: free the slot
        if !self.closed.load(Ordering::Acquire) {
            self.shared.open_devices().remove(&self.id);
        }
    }
}
