// SPDX-License-Identifier: GPL-3.0-only

//! Capture thread: drains the frame pool and runs the frame callback.
//!
//! The thread owns the consumer side of the pool. It takes the newest frame,
//! delivers it synchronously through the delivery gate, and hands the buffer
//! back as soon as the callback returns.

use super::gate::DeliveryGate;
use super::pool::{FramePool, FrameProducer, PoolStats};
use crate::backends::camera::FrameView;
use crate::constants::{CAPTURE_POLL_INTERVAL, FRAME_POOL_SIZE, LOG_EVERY_N_FRAMES};
use crate::errors::{CameraError, CameraResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Called on the capture thread for every delivered frame.
///
/// The view is only valid for the duration of the call; copy what is needed
/// and return quickly.
pub type FrameCallback = Box<dyn FnMut(&FrameView<'_>) + Send>;

/// Frame counters for one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSourceStats {
    pub committed: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Frame pool plus the dedicated thread that drains it
pub struct FrameSource {
    label: String,
    pool: FramePool,
    gate: Arc<DeliveryGate>,
    stop_flag: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    capture_thread: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Allocate the pool and spawn the capture thread.
    ///
    /// `gate` decides whether a frame may still be delivered; the owner closes
    /// it to stop callbacks before tearing the source down.
    pub fn start(
        label: impl Into<String>,
        gate: Arc<DeliveryGate>,
        callback: FrameCallback,
    ) -> CameraResult<Self> {
        let label = label.into();
        let pool = FramePool::new(FRAME_POOL_SIZE);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicU64::new(0));
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);

        let params = CaptureThreadParams {
            label: label.clone(),
            pool: pool.clone(),
            gate: Arc::clone(&gate),
            stop_flag: Arc::clone(&stop_flag),
            delivered: Arc::clone(&delivered),
            callback,
        };

        let capture_thread = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture_thread_main(params, init_tx))
            .map_err(|e| CameraError::Io(format!("spawn capture thread: {}", e)))?;

        init_rx.recv().map_err(|_| {
            CameraError::InvalidState("capture thread died during startup".to_string())
        })?;

        debug!(source = %label, pool_size = FRAME_POOL_SIZE, "Frame source started");

        Ok(Self {
            label,
            pool,
            gate,
            stop_flag,
            delivered,
            capture_thread: Some(capture_thread),
        })
    }

    /// Output target for the hardware
    pub fn producer(&self) -> FrameProducer {
        self.pool.producer()
    }

    pub fn gate(&self) -> &Arc<DeliveryGate> {
        &self.gate
    }

    pub fn stats(&self) -> FrameSourceStats {
        let PoolStats { committed, dropped } = self.pool.stats();
        FrameSourceStats {
            committed,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped,
        }
    }

    /// Stop the capture thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        self.pool.close();

        if let Some(thread) = self.capture_thread.take()
            && let Err(e) = thread.join()
        {
            error!(source = %self.label, "Capture thread panicked: {:?}", e);
        }
    }

    /// Free the pool's buffer memory
    pub fn release_buffers(&self) {
        self.pool.release_buffers();
    }

    pub fn is_running(&self) -> bool {
        self.capture_thread.is_some()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if self.capture_thread.is_none() {
            return;
        }
        self.shutdown();
        self.release_buffers();

        let stats = self.stats();
        info!(
            source = %self.label,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Frame source dropped"
        );
    }
}

struct CaptureThreadParams {
    label: String,
    pool: FramePool,
    gate: Arc<DeliveryGate>,
    stop_flag: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    callback: FrameCallback,
}

fn capture_thread_main(params: CaptureThreadParams, init_tx: std::sync::mpsc::SyncSender<()>) {
    let CaptureThreadParams {
        label,
        pool,
        gate,
        stop_flag,
        delivered,
        mut callback,
    } = params;

    // Main thread is blocked in start() until this arrives
    if init_tx.send(()).is_err() {
        return;
    }

    while !stop_flag.load(Ordering::Acquire) {
        let Some(frame) = pool.acquire_latest(CAPTURE_POLL_INTERVAL) else {
            continue;
        };
        let Some(view) = frame.view() else {
            continue;
        };

        let Some(_permit) = gate.enter() else {
            // Owner is closing; the buffer goes back unread
            continue;
        };

        callback(&view);
        let count = delivered.fetch_add(1, Ordering::Relaxed) + 1;

        if count % LOG_EVERY_N_FRAMES == 0 {
            let stats = pool.stats();
            debug!(
                source = %label,
                delivered = count,
                dropped = stats.dropped,
                timestamp_ns = view.timestamp_ns,
                "Capture thread frame stats"
            );
        }
    }

    debug!(source = %label, "Capture thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{PlaneLayout, Resolution};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn push(producer: &FrameProducer, ts: i64) {
        let layout = PlaneLayout::semi_planar(Resolution::new(8, 8));
        if let Some(guard) = producer.begin_frame(layout) {
            guard.commit(ts);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_frames_reach_callback_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let gate = Arc::new(DeliveryGate::new());
        let mut source = FrameSource::start(
            "test",
            gate,
            Box::new(move |frame| sink.lock().unwrap().push(frame.timestamp_ns)),
        )
        .unwrap();

        let producer = source.producer();
        for ts in 1..=5 {
            push(&producer, ts * 1000);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(wait_until(|| seen.lock().unwrap().last() == Some(&5000)));
        let seen = seen.lock().unwrap().clone();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        source.shutdown();
        assert!(!source.is_running());
    }

    #[test]
    fn test_closed_gate_stops_delivery() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let gate = Arc::new(DeliveryGate::new());
        let source = FrameSource::start(
            "gated",
            Arc::clone(&gate),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let producer = source.producer();
        push(&producer, 1);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));

        assert!(gate.close_and_drain(Duration::from_secs(1)));
        for ts in 2..10 {
            push(&producer, ts);
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(source.stats().delivered, 1);
    }
}
