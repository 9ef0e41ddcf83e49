// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for camera operations
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Streaming processed frames from a continuous session
//! - Taking one-shot captures from an on-demand session

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ucamera::{
    CameraManager, CaptureTemplate, ConversionPath, DeviceHandle, DeviceState, FrameEvent,
    PipelineConfig, Resolution, VirtualCameraConfig, VirtualCameraPlatform,
};

/// How long to wait for the next processed frame before giving up
const FRAME_WAIT: Duration = Duration::from_secs(3);

/// Load the pipeline configuration, or the defaults without a file
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn start_manager(config: PipelineConfig) -> Result<CameraManager, Box<dyn std::error::Error>> {
    let platform = Arc::new(VirtualCameraPlatform::new(VirtualCameraConfig::default())?);
    let manager = CameraManager::new(platform, config)?;
    println!("Render backend: {}", manager.render_backend());
    Ok(manager)
}

async fn open_camera(
    manager: &CameraManager,
    camera: &str,
) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    let device = manager.open(camera)?;
    match device.wait_for_initialization().await? {
        DeviceState::Opened => {
            println!("Using camera: {}", camera);
            Ok(device)
        }
        state => {
            let code = device
                .error_code()
                .map(|c| format!(" (error {})", c))
                .unwrap_or_default();
            device.close().await;
            Err(format!("camera {} is {}{}", camera, state, code).into())
        }
    }
}

/// List all available cameras
pub fn list_cameras() -> Result<(), Box<dyn std::error::Error>> {
    let platform = VirtualCameraPlatform::new(VirtualCameraConfig::default())?;
    let cameras = ucamera::CameraPlatform::camera_ids(&platform);

    if cameras.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras:");
    println!();
    for id in cameras {
        println!("  [{}] simulated camera", id);
    }
    Ok(())
}

/// Stream `frames` processed frames from a continuous session
pub fn stream(
    mut config: PipelineConfig,
    camera: &str,
    width: u32,
    height: u32,
    frames: u32,
    path: Option<ConversionPath>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = path {
        config.conversion_path = path;
    }
    let resolution = Resolution::new(width, height);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = start_manager(config)?;
        let device = open_camera(&manager, camera).await?;

        let Some(pipeline) = device
            .create_continuous_session(resolution, CaptureTemplate::Preview)
            .await
        else {
            manager.shutdown().await;
            return Err("session could not be created".into());
        };
        println!(
            "Streaming {} at {} ({} path)",
            camera,
            resolution,
            pipeline.conversion_path()
        );

        let mut events = pipeline.subscribe_frames();
        let start = Instant::now();
        let mut received = 0;
        while received < frames {
            match events.recv_timeout(FRAME_WAIT).await {
                Some(FrameEvent::FrameProcessed {
                    texture,
                    timestamp_ns,
                    ..
                }) => {
                    received += 1;
                    println!(
                        "  frame {:>3}  ts={} ns  {}",
                        received,
                        timestamp_ns,
                        texture.resolution()
                    );
                }
                Some(FrameEvent::FrameReady { .. }) => {}
                None => {
                    eprintln!("No frame within {:?}, stopping", FRAME_WAIT);
                    break;
                }
            }
        }
        let elapsed = start.elapsed();

        let stats = pipeline.stats();
        pipeline.dispose().await;
        device.close().await;
        manager.shutdown().await;

        println!(
            "Processed {} frames in {:.2}s (delivered {}, dropped {}, coalesced {})",
            stats.bridge.processed,
            elapsed.as_secs_f64(),
            stats.session.frames.delivered,
            stats.session.frames.dropped,
            stats.bridge.coalesced
        );
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Issue `count` one-shot captures on an on-demand session
pub fn capture(
    config: PipelineConfig,
    camera: &str,
    template: CaptureTemplate,
    count: u32,
    width: u32,
    height: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let resolution = Resolution::new(width, height);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = start_manager(config)?;
        let device = open_camera(&manager, camera).await?;

        let Some(pipeline) = device.create_on_demand_session(resolution).await else {
            manager.shutdown().await;
            return Err("session could not be created".into());
        };
        if !pipeline.wait_until_active(FRAME_WAIT).await {
            pipeline.dispose().await;
            manager.shutdown().await;
            return Err(format!("session on camera {} did not become active", camera).into());
        }

        let mut events = pipeline.subscribe_frames();
        let mut captured = 0;
        for _ in 0..count {
            if !pipeline.request_capture(template)? {
                eprintln!("Capture request was not accepted");
                break;
            }
            let frame = events
                .wait_for(FRAME_WAIT, |e| matches!(e, FrameEvent::FrameProcessed { .. }))
                .await;
            match frame {
                Some(FrameEvent::FrameProcessed {
                    texture,
                    timestamp_ns,
                    ..
                }) => {
                    captured += 1;
                    println!(
                        "Captured {} frame: ts={} ns  {} ({} bytes)",
                        template,
                        timestamp_ns,
                        texture.resolution(),
                        texture.byte_len()
                    );
                }
                _ => {
                    eprintln!("Capture timed out");
                    break;
                }
            }
        }

        pipeline.dispose().await;
        device.close().await;
        manager.shutdown().await;
        println!("{} of {} captures completed", captured, count);
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
