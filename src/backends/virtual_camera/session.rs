// SPDX-License-Identifier: GPL-3.0-only

//! Simulated capture session and its sensor thread
//!
//! The sensor thread serves one-shot requests first, then the repeating
//! request, producing one synthetic frame per frame interval into every
//! output the request names. Frame timestamps are strictly increasing.

use super::PlatformShared;
use crate::backends::camera::{
    CaptureRequest, FramePlanes, OutputTarget, PlaneLayout, PlatformSession, SessionCallbacks,
    SessionOutput, TargetId,
};
use crate::constants::LOG_EVERY_N_FRAMES;
use crate::errors::PlatformError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, trace};

#[derive(Default)]
struct SensorState {
    repeating: Option<CaptureRequest>,
    oneshots: VecDeque<CaptureRequest>,
    stop: bool,
    /// A frame is being produced right now
    busy: bool,
    /// Requests have been flowing since the last idle notification
    active: bool,
}

impl SensorState {
    fn has_work(&self) -> bool {
        self.repeating.is_some() || !self.oneshots.is_empty()
    }
}

struct SensorShared {
    state: Mutex<SensorState>,
    wake: Condvar,
}

impl SensorShared {
    fn lock(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct VirtualSession {
    device_id: String,
    outputs: Arc<HashMap<TargetId, SessionOutput>>,
    callbacks: Arc<dyn SessionCallbacks>,
    platform: Arc<PlatformShared>,
    sensor: Arc<SensorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl VirtualSession {
    pub(crate) fn start(
        device_id: &str,
        outputs: Vec<SessionOutput>,
        callbacks: Arc<dyn SessionCallbacks>,
        platform: Arc<PlatformShared>,
    ) -> Result<Arc<Self>, PlatformError> {
        let outputs: Arc<HashMap<TargetId, SessionOutput>> =
            Arc::new(outputs.into_iter().map(|o| (o.id, o)).collect());
        let sensor = Arc::new(SensorShared {
            state: Mutex::new(SensorState::default()),
            wake: Condvar::new(),
        });

        let params = SensorParams {
            device_id: device_id.to_string(),
            outputs: Arc::clone(&outputs),
            callbacks: Arc::clone(&callbacks),
            platform: Arc::clone(&platform),
            sensor: Arc::clone(&sensor),
        };
        let thread = std::thread::Builder::new()
            .name("camera-sensor".to_string())
            .spawn(move || sensor_thread_main(params))
            .map_err(|_| PlatformError::CameraService)?;

        Ok(Arc::new(Self {
            device_id: device_id.to_string(),
            outputs,
            callbacks,
            platform,
            sensor,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn validate(&self, request: &CaptureRequest) -> Result<(), PlatformError> {
        if self.is_closed() {
            return Err(PlatformError::InvalidRequest("session is closed".to_string()));
        }
        if request.targets.is_empty() {
            return Err(PlatformError::InvalidRequest("request has no targets".to_string()));
        }
        if let Some(missing) = request
            .targets
            .iter()
            .find(|t| !self.outputs.contains_key(t))
        {
            return Err(PlatformError::InvalidRequest(format!(
                "target {} is not a session output",
                missing.0
            )));
        }
        Ok(())
    }
}

impl PlatformSession for VirtualSession {
    fn set_repeating_request(&self, request: CaptureRequest) -> Result<u64, PlatformError> {
        self.validate(&request)?;
        if let Some(e) = self.platform.faults().reject_repeating {
            return Err(e);
        }

        let sequence_id = self.platform.counters.next_sequence_id();
        self.platform.counters.repeating_requests.fetch_add(1, Ordering::Relaxed);
        debug!(
            camera = %self.device_id,
            sequence_id,
            template = %request.template,
            "Repeating request set"
        );

        let mut state = self.sensor.lock();
        state.repeating = Some(request);
        drop(state);
        self.sensor.wake.notify_all();
        Ok(sequence_id)
    }

    fn capture(&self, request: CaptureRequest) -> Result<u64, PlatformError> {
        self.validate(&request)?;

        let sequence_id = self.platform.counters.next_sequence_id();
        self.platform.counters.capture_requests.fetch_add(1, Ordering::Relaxed);
        trace!(camera = %self.device_id, sequence_id, "One-shot capture queued");

        let mut state = self.sensor.lock();
        state.oneshots.push_back(request);
        drop(state);
        self.sensor.wake.notify_all();
        Ok(sequence_id)
    }

    fn stop_repeating(&self) -> Result<(), PlatformError> {
        if self.is_closed() {
            return Err(PlatformError::InvalidRequest("session is closed".to_string()));
        }

        let mut state = self.sensor.lock();
        state.repeating = None;
        // A busy sensor reports idle itself once the frame in flight lands
        let notify_now = !state.busy && state.oneshots.is_empty();
        if notify_now {
            state.active = false;
        }
        drop(state);
        self.sensor.wake.notify_all();

        if notify_now {
            let callbacks = Arc::clone(&self.callbacks);
            self.platform.dispatcher.post(move || callbacks.on_ready());
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = self.sensor.lock();
            state.stop = true;
            state.repeating = None;
            state.oneshots.clear();
        }
        self.sensor.wake.notify_all();

        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread
            && thread.thread().id() != std::thread::current().id()
            && let Err(e) = thread.join()
        {
            error!(camera = %self.device_id, "Sensor thread panicked: {:?}", e);
        }

        self.platform.counters.sessions_closed.fetch_add(1, Ordering::Relaxed);
        debug!(camera = %self.device_id, "Session closed");

        // The sensor thread has exited, so no frame can follow on_closed
        let callbacks = Arc::clone(&self.callbacks);
        self.platform.dispatcher.post(move || callbacks.on_closed());
    }
}

impl Drop for VirtualSession {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

struct SensorParams {
    device_id: String,
    outputs: Arc<HashMap<TargetId, SessionOutput>>,
    callbacks: Arc<dyn SessionCallbacks>,
    platform: Arc<PlatformShared>,
    sensor: Arc<SensorShared>,
}

fn sensor_thread_main(params: SensorParams) {
    let SensorParams {
        device_id,
        outputs,
        callbacks,
        platform,
        sensor,
    } = params;
    let interval = platform.config.frame_interval;
    let epoch = Instant::now();
    let mut last_timestamp: i64 = 0;
    let mut frames: u64 = 0;

    loop {
        let request = {
            let mut state = sensor.lock();
            while !state.stop && !state.has_work() {
                state = sensor
                    .wake
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if state.stop {
                break;
            }
            let request = match state.oneshots.pop_front() {
                Some(request) => request,
                None => match state.repeating.clone() {
                    Some(request) => request,
                    None => continue,
                },
            };
            state.busy = true;
            if !state.active {
                state.active = true;
                let callbacks = Arc::clone(&callbacks);
                platform.dispatcher.post(move || callbacks.on_active());
            }
            request
        };

        let now = epoch.elapsed().as_nanos() as i64;
        last_timestamp = now.max(last_timestamp + 1);
        for target in &request.targets {
            if let Some(output) = outputs.get(target) {
                produce_frame(output, frames, last_timestamp);
            }
        }
        frames += 1;
        platform.counters.frames_produced.fetch_add(1, Ordering::Relaxed);
        if frames % LOG_EVERY_N_FRAMES == 0 {
            debug!(camera = %device_id, frames, template = %request.template, "Sensor frame");
        }

        let mut state = sensor.lock();
        state.busy = false;
        if state.active && !state.has_work() {
            state.active = false;
            let callbacks = Arc::clone(&callbacks);
            platform.dispatcher.post(move || callbacks.on_ready());
        }
        if state.stop {
            break;
        }
        // Frame interval, cut short by close
        let _ = sensor
            .wake
            .wait_timeout_while(state, interval, |s| !s.stop)
            .unwrap_or_else(|e| e.into_inner());
    }

    debug!(camera = %device_id, frames, "Sensor thread stopped");
}

fn produce_frame(output: &SessionOutput, sequence: u64, timestamp_ns: i64) {
    let layout = PlaneLayout::semi_planar(output.resolution);
    match &output.target {
        OutputTarget::Frames(producer) => {
            if let Some(mut frame) = producer.begin_frame(layout) {
                fill_test_pattern(&mut frame, sequence);
                frame.commit(timestamp_ns);
            }
        }
        OutputTarget::Surface(surface) => {
            surface.post_with(layout, timestamp_ns, sequence, |planes| {
                fill_test_pattern(planes, sequence)
            });
        }
        OutputTarget::Discard => {}
    }
}

/// Diagonal luma gradient that scrolls one step per frame, neutral chroma
fn fill_test_pattern(planes: &mut FramePlanes, sequence: u64) {
    let Some(layout) = planes.layout else {
        return;
    };
    let stride = layout.y_row_stride as usize;
    let shift = sequence as usize;
    for (row, line) in planes.y.chunks_mut(stride.max(1)).enumerate() {
        for (col, px) in line.iter_mut().take(layout.width as usize).enumerate() {
            *px = ((row + col + shift) & 0xFF) as u8;
        }
    }
    planes.u.fill(128);
    planes.v.fill(128);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::Resolution;

    #[test]
    fn test_pattern_scrolls() {
        let layout = PlaneLayout::semi_planar(Resolution::new(4, 2));
        let mut planes = FramePlanes::for_layout(layout);
        fill_test_pattern(&mut planes, 0);
        assert_eq!(&planes.y[..4], &[0, 1, 2, 3]);
        assert_eq!(&planes.y[4..8], &[1, 2, 3, 4]);

        fill_test_pattern(&mut planes, 10);
        assert_eq!(planes.y[0], 10);
        assert!(planes.u.iter().all(|&b| b == 128));
    }
}
