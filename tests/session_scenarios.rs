#![recursion_limit = "256"]
// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end lifecycle tests against the simulated camera and the CPU renderer

use futures::future::AbortHandle;
use std::sync::Arc;
use std::time::Duration;
use ucamera::events::EventStream;
use ucamera::render::{HeadlessOptions, RenderQueue};
use ucamera::{
    CameraError, CameraManager, CameraPlatform, CaptureTemplate, ConversionPath, DeviceEvent,
    DeviceHandle, DeviceState, FrameEvent, PipelineConfig, PlatformError, RenderBackendKind,
    Resolution, SessionEvent, SessionState, VirtualCameraConfig, VirtualCameraPlatform,
    VirtualFaults,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);
const VGA: Resolution = Resolution::new(64, 48);

fn fast_camera() -> VirtualCameraConfig {
    VirtualCameraConfig {
        frame_interval: Duration::from_millis(5),
        open_delay: Duration::from_millis(2),
        configure_delay: Duration::from_millis(2),
        ..Default::default()
    }
}

fn test_config(path: ConversionPath) -> PipelineConfig {
    PipelineConfig {
        conversion_path: path,
        render_backend: RenderBackendKind::Headless,
        init_timeout_ms: 2000,
        close_drain_timeout_ms: 1000,
        graphics_teardown_timeout_ms: 1000,
        ..Default::default()
    }
}

struct Harness {
    camera: Arc<VirtualCameraPlatform>,
    manager: CameraManager,
}

impl Harness {
    fn new(camera: VirtualCameraConfig, config: PipelineConfig) -> Self {
        Self::with_render(camera, config, HeadlessOptions::default())
    }

    fn with_render(
        camera: VirtualCameraConfig,
        config: PipelineConfig,
        options: HeadlessOptions,
    ) -> Self {
        let camera = Arc::new(VirtualCameraPlatform::new(camera).unwrap());
        let platform: Arc<dyn CameraPlatform> = camera.clone();
        let render = RenderQueue::headless(options).unwrap();
        let manager = CameraManager::with_render_queue(platform, render, config).unwrap();
        Self { camera, manager }
    }

    fn faults(&self, faults: VirtualFaults) {
        self.camera.set_faults(faults);
    }

    async fn open(&self, id: &str) -> DeviceHandle {
        let device = self.manager.open(id).unwrap();
        assert_eq!(
            device.wait_for_initialization().await.unwrap(),
            DeviceState::Opened
        );
        device
    }
}

fn drain<E: Clone + std::fmt::Debug>(stream: &mut EventStream<E>) -> Vec<E> {
    std::iter::from_fn(|| stream.try_recv()).collect()
}

fn count<E>(events: &[E], pred: impl Fn(&E) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn is_processed(event: &FrameEvent) -> bool {
    matches!(event, FrameEvent::FrameProcessed { .. })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_continuous_stream_then_dispose() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    let mut frames = pipeline.subscribe_frames();
    let mut session = pipeline.subscribe_session();

    let mut last = i64::MIN;
    for _ in 0..10 {
        let event = frames.wait_for(WAIT, is_processed).await.expect("frame");
        let FrameEvent::FrameProcessed { texture, timestamp_ns, .. } = event else {
            unreachable!()
        };
        assert!(timestamp_ns > last, "timestamps must increase");
        last = timestamp_ns;
        assert_eq!(texture.resolution(), VGA);
        assert_eq!(texture.byte_len(), VGA.rgba_len());
    }
    assert_eq!(pipeline.state(), SessionState::Opened);

    pipeline.dispose().await;
    assert_eq!(pipeline.state(), SessionState::Closed);

    let events = drain(&mut session);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Active { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Closed { .. })), 1);
    assert!(matches!(
        events.last(),
        Some(SessionEvent::DisposeCompleted { .. })
    ));

    let stats = h.camera.stats();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.sessions_closed, 1);
    assert!(pipeline.stats().session.frames.delivered >= 10);

    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_on_demand_single_capture() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let pipeline = device.create_on_demand_session(VGA).await.expect("pipeline");

    // Not opened yet: refused without error
    assert!(!pipeline.request_capture(CaptureTemplate::StillCapture).unwrap());

    assert!(pipeline.wait_until_active(WAIT).await);
    let mut frames = pipeline.subscribe_frames();

    // The background stream alone produces nothing for the client
    assert!(frames.wait_for(QUIET, is_processed).await.is_none());

    assert!(pipeline.request_capture(CaptureTemplate::StillCapture).unwrap());
    let event = frames.wait_for(WAIT, is_processed).await.expect("capture");
    if let FrameEvent::FrameProcessed { texture, .. } = event {
        assert_eq!(texture.pixels.map(|p| p.len()), Some(VGA.rgba_len()));
    }
    assert!(frames.wait_for(QUIET, is_processed).await.is_none());
    assert_eq!(h.camera.stats().capture_requests, 1);

    pipeline.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_configuration_failure() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    h.faults(VirtualFaults {
        fail_configure: true,
        ..Default::default()
    });

    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    let mut session = pipeline.subscribe_session();
    let closed = session
        .wait_for(WAIT, |e| matches!(e, SessionEvent::Closed { .. }))
        .await;
    assert!(closed.is_some());
    assert_eq!(pipeline.state(), SessionState::Closed);

    let mut replay = pipeline.subscribe_session();
    let events = drain(&mut replay);
    assert_eq!(
        count(&events, |e| matches!(
            e,
            SessionEvent::ConfigurationFailed {
                is_access_or_security_error: false,
                ..
            }
        )),
        1
    );
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Active { .. })), 0);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Closed { .. })), 1);

    pipeline.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_close_while_configuring() {
    let camera = VirtualCameraConfig {
        configure_delay: Duration::from_millis(150),
        ..fast_camera()
    };
    let h = Harness::new(camera, test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    assert_eq!(pipeline.state(), SessionState::Configuring);

    let mut session = pipeline.subscribe_session();
    pipeline.dispose().await;

    let events = drain(&mut session);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Active { .. })), 0);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Closed { .. })), 1);
    assert_eq!(pipeline.state(), SessionState::Closed);

    // The late configuration was torn down instead of activated
    let stats = h.camera.stats();
    assert_eq!(stats.repeating_requests, 0);
    assert_eq!(stats.sessions_closed, 1);

    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_frames_after_close() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    let mut frames = pipeline.subscribe_frames();
    assert!(frames.wait_for(WAIT, is_processed).await.is_some());

    pipeline.session().close().await;
    drain(&mut frames);
    assert!(frames.recv_timeout(QUIET).await.is_none());

    pipeline.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_close_is_idempotent() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    assert!(pipeline.wait_until_active(WAIT).await);
    let mut session = pipeline.subscribe_session();
    let mut device_events = device.subscribe();

    tokio::join!(
        pipeline.dispose(),
        pipeline.dispose(),
        pipeline.session().close()
    );
    pipeline.dispose().await;

    let events = drain(&mut session);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Closed { .. })), 1);
    assert_eq!(
        count(&events, |e| matches!(e, SessionEvent::DisposeCompleted { .. })),
        1
    );

    tokio::join!(device.close(), device.close());
    device.close().await;
    let events = drain(&mut device_events);
    assert_eq!(
        count(&events, |e| matches!(e, DeviceEvent::Closed { .. })),
        1
    );
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_close_disposes_its_pipelines() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let pipeline = device.create_on_demand_session(VGA).await.expect("pipeline");
    assert!(pipeline.wait_until_active(WAIT).await);
    assert_eq!(device.pipeline_count(), 1);

    device.close().await;

    assert!(pipeline.is_disposed());
    assert_eq!(pipeline.state(), SessionState::Closed);
    assert!(matches!(
        pipeline.request_capture(CaptureTemplate::StillCapture),
        Err(CameraError::InvalidState(_))
    ));
    assert_eq!(device.state(), DeviceState::Closed);

    let mut events = device.subscribe();
    let events = drain(&mut events);
    assert!(events.contains(&DeviceEvent::Closed {
        camera_id: Some("0".to_string())
    }));

    let stats = h.camera.stats();
    assert_eq!(stats.sessions_closed, stats.sessions_created);
    assert_eq!(stats.devices_closed, 1);
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_session_on_closed_device() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    device.close().await;

    let before = h.camera.stats().sessions_created;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await;
    assert!(pipeline.is_none());
    assert_eq!(h.camera.stats().sessions_created, before);

    let mut events = device.subscribe();
    let events = drain(&mut events);
    assert_eq!(
        count(&events, |e| matches!(e, DeviceEvent::SessionRejected { .. })),
        1
    );
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_error_reports_code_and_closes() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    h.faults(VirtualFaults {
        open_error: Some(PlatformError::CameraInUse),
        ..Default::default()
    });

    let device = h.manager.open("0").unwrap();
    assert_eq!(
        device.wait_for_initialization().await.unwrap(),
        DeviceState::Erred
    );
    assert_eq!(device.error_code(), Some(1));

    let mut events = device.subscribe();
    let closed = events
        .wait_for(WAIT, |e| matches!(e, DeviceEvent::Closed { .. }))
        .await;
    assert_eq!(closed, Some(DeviceEvent::Closed { camera_id: None }));
    assert_eq!(device.state(), DeviceState::Erred);

    let mut replay = device.subscribe();
    assert_eq!(
        replay.try_recv(),
        Some(DeviceEvent::Erred {
            camera_id: None,
            code: 1
        })
    );
    assert!(
        device
            .create_continuous_session(VGA, CaptureTemplate::Preview)
            .await
            .is_none()
    );
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn access_denied_fails_synchronously() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    h.faults(VirtualFaults {
        reject_open: Some(PlatformError::AccessDenied("revoked".to_string())),
        ..Default::default()
    });

    let device = h.manager.open("0").unwrap();
    assert_eq!(device.state(), DeviceState::Erred);
    assert_eq!(
        device.error_code(),
        Some(ucamera::constants::device_error::ACCESS_DENIED)
    );
    device.close().await;
    assert_eq!(h.camera.stats().devices_opened, 0);
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_cascades_to_sessions() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    h.faults(VirtualFaults {
        disconnect_after: Some(Duration::from_millis(150)),
        ..Default::default()
    });
    let device = h.open("0").await;
    let mut device_events = device.subscribe();
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");

    let disconnected = device_events
        .wait_for(WAIT, |e| matches!(e, DeviceEvent::Disconnected { .. }))
        .await;
    assert!(disconnected.is_some());
    let closed = device_events
        .wait_for(WAIT, |e| matches!(e, DeviceEvent::Closed { .. }))
        .await;
    assert!(closed.is_some());

    assert_eq!(device.state(), DeviceState::Closed);
    assert_eq!(pipeline.state(), SessionState::Closed);
    assert!(pipeline.is_disposed());
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_texture_path_streams() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::ExternalTexture));
    let device = h.open("0").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Record)
        .await
        .expect("pipeline");
    assert_eq!(pipeline.conversion_path(), ConversionPath::ExternalTexture);
    let mut frames = pipeline.subscribe_frames();

    let mut last = i64::MIN;
    for _ in 0..5 {
        let event = frames.wait_for(WAIT, is_processed).await.expect("frame");
        assert!(event.timestamp_ns() > last);
        last = event.timestamp_ns();
    }

    pipeline.dispose().await;
    drain(&mut frames);
    assert!(frames.recv_timeout(QUIET).await.is_none());
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_failure_closes_session() {
    let h = Harness::with_render(
        fast_camera(),
        test_config(ConversionPath::ExternalTexture),
        HeadlessOptions {
            fail_registration: true,
            ..Default::default()
        },
    );
    let device = h.open("0").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    let mut session = pipeline.subscribe_session();

    let failed = session
        .wait_for(WAIT, |e| matches!(e, SessionEvent::RegistrationFailed { .. }))
        .await;
    assert!(failed.is_some());
    let closed = session
        .wait_for(WAIT, |e| matches!(e, SessionEvent::Closed { .. }))
        .await;
    assert!(closed.is_some());
    assert_eq!(pipeline.state(), SessionState::Closed);

    pipeline.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeating_rejection_closes_session() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    h.faults(VirtualFaults {
        reject_repeating: Some(PlatformError::CameraDevice),
        ..Default::default()
    });

    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    let mut session = pipeline.subscribe_session();
    let failed = session
        .wait_for(WAIT, |e| matches!(e, SessionEvent::RequestFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        Some(SessionEvent::RequestFailed { code: 4, .. })
    ));
    assert!(
        session
            .wait_for(WAIT, |e| matches!(e, SessionEvent::Closed { .. }))
            .await
            .is_some()
    );

    pipeline.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_wait_leaves_open_running() {
    let camera = VirtualCameraConfig {
        open_delay: Duration::from_millis(300),
        ..fast_camera()
    };
    let h = Harness::new(camera, test_config(ConversionPath::Compute));
    let device = h.manager.open("0").unwrap();

    let (abort, registration) = AbortHandle::new_pair();
    let waiter = device.clone();
    let wait = tokio::spawn(async move { waiter.wait_for_initialization_with(registration).await });
    abort.abort();
    assert!(matches!(wait.await.unwrap(), Err(CameraError::Cancelled)));

    assert_eq!(
        device.wait_for_initialization().await.unwrap(),
        DeviceState::Opened
    );
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialization_wait_is_bounded() {
    let camera = VirtualCameraConfig {
        open_delay: Duration::from_millis(500),
        ..fast_camera()
    };
    let config = PipelineConfig {
        init_timeout_ms: 50,
        ..test_config(ConversionPath::Compute)
    };
    let h = Harness::new(camera, config);
    let device = h.manager.open("0").unwrap();

    assert!(matches!(
        device.wait_for_initialization().await,
        Err(CameraError::Timeout(_))
    ));
    assert_eq!(device.state(), DeviceState::Initializing);
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fixed_output_size_scales_frames() {
    let config = PipelineConfig {
        output_size: Some(Resolution::new(32, 24)),
        ..test_config(ConversionPath::Compute)
    };
    let h = Harness::new(fast_camera(), config);
    let device = h.open("1").await;
    let pipeline = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("pipeline");
    let mut frames = pipeline.subscribe_frames();

    let event = frames.wait_for(WAIT, is_processed).await.expect("frame");
    if let FrameEvent::FrameProcessed { texture, .. } = event {
        assert_eq!(texture.resolution(), Resolution::new(32, 24));
    }

    pipeline.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replaced_session_closes_once() {
    let h = Harness::new(fast_camera(), test_config(ConversionPath::Compute));
    let device = h.open("0").await;
    let first = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("first pipeline");
    let mut first_events = first.subscribe_session();
    assert!(first.wait_until_active(WAIT).await);

    let second = device
        .create_continuous_session(VGA, CaptureTemplate::Preview)
        .await
        .expect("second pipeline");

    // The platform closes the first session when the second is created
    let closed = first_events
        .wait_for(WAIT, |e| matches!(e, SessionEvent::Closed { .. }))
        .await;
    assert!(closed.is_some());
    assert_eq!(first.state(), SessionState::Closed);
    assert_eq!(h.camera.stats().sessions_closed, 1);

    let mut frames = first.subscribe_frames();
    assert!(second.wait_until_active(WAIT).await);
    assert!(frames.recv_timeout(QUIET).await.is_none());

    first.dispose().await;
    let events = drain(&mut first.subscribe_session());
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Closed { .. })), 1);
    assert!(matches!(
        events.last(),
        Some(SessionEvent::DisposeCompleted { .. })
    ));
    assert_eq!(second.state(), SessionState::Opened);

    second.dispose().await;
    device.close().await;
    h.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_output_size_is_rejected() {
    let camera: Arc<dyn CameraPlatform> =
        Arc::new(VirtualCameraPlatform::new(fast_camera()).unwrap());
    let render = RenderQueue::headless(HeadlessOptions::default()).unwrap();
    let config = PipelineConfig {
        output_size: Some(Resolution::new(0, 48)),
        ..test_config(ConversionPath::Compute)
    };

    let result = CameraManager::with_render_queue(camera.clone(), render.clone(), config.clone());
    assert!(matches!(result, Err(CameraError::Config(_))));

    // Opening a device directly still refuses the session
    let device = DeviceHandle::open(camera.as_ref(), "0", render.clone(), config).unwrap();
    assert_eq!(
        device.wait_for_initialization().await.unwrap(),
        DeviceState::Opened
    );
    let mut events = device.subscribe();
    assert!(
        device
            .create_continuous_session(VGA, CaptureTemplate::Preview)
            .await
            .is_none()
    );
    let rejected = events
        .wait_for(WAIT, |e| matches!(e, DeviceEvent::SessionRejected { .. }))
        .await;
    assert!(rejected.is_some());
    assert!(render.is_running());

    device.close().await;
    render.shutdown();
}
