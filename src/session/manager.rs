// SPDX-License-Identifier: GPL-3.0-only

//! Camera manager: owns the platform, the render thread and the pipeline
//! configuration shared by every device it opens.

use super::device::DeviceHandle;
use crate::backends::camera::CameraPlatform;
use crate::config::{PipelineConfig, RenderBackendKind};
use crate::errors::{CameraError, CameraResult};
use crate::render::{HeadlessOptions, RenderQueue, WgpuBackend};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct CameraManager {
    platform: Arc<dyn CameraPlatform>,
    render: RenderQueue,
    config: PipelineConfig,
    devices: Mutex<Vec<DeviceHandle>>,
}

impl CameraManager {
    /// Start the render thread selected by `config.render_backend`
    pub fn new(platform: Arc<dyn CameraPlatform>, config: PipelineConfig) -> CameraResult<Self> {
        config.validate()?;
        let render = match config.render_backend {
            RenderBackendKind::Headless => RenderQueue::headless(HeadlessOptions::default())?,
            RenderBackendKind::Wgpu => RenderQueue::start(WgpuBackend::factory(config.read_back))?,
            RenderBackendKind::Auto => {
                match RenderQueue::start(WgpuBackend::factory(config.read_back)) {
                    Ok(render) => render,
                    Err(e) => {
                        warn!(error = %e, "GPU backend unavailable, using the CPU renderer");
                        RenderQueue::headless(HeadlessOptions::default())?
                    }
                }
            }
        };
        Self::with_render_queue(platform, render, config)
    }

    /// Use an already running render thread
    pub fn with_render_queue(
        platform: Arc<dyn CameraPlatform>,
        render: RenderQueue,
        config: PipelineConfig,
    ) -> CameraResult<Self> {
        config.validate()?;
        info!(
            platform = platform.name(),
            backend = render.backend_name(),
            path = %config.conversion_path,
            "Camera manager ready"
        );
        Ok(Self {
            platform,
            render,
            config,
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.platform.camera_ids()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn render_queue(&self) -> &RenderQueue {
        &self.render
    }

    pub fn render_backend(&self) -> &'static str {
        self.render.backend_name()
    }

    /// Begin opening `camera_id`; see [`DeviceHandle::wait_for_initialization`]
    pub fn open(&self, camera_id: &str) -> CameraResult<DeviceHandle> {
        if !self.render.is_running() {
            return Err(CameraError::InvalidState(
                "camera manager is shut down".to_string(),
            ));
        }
        let device = DeviceHandle::open(
            self.platform.as_ref(),
            camera_id,
            self.render.clone(),
            self.config.clone(),
        )?;
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.retain(|d| !d.state().is_terminal());
        devices.push(device.clone());
        Ok(device)
    }

    /// Close every device, then stop the render thread
    pub async fn shutdown(&self) {
        let devices: Vec<DeviceHandle> = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        join_all(devices.iter().map(|d| d.close())).await;

        let render = self.render.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || render.shutdown()).await {
            warn!(error = %e, "Render thread shutdown task failed");
        }
        info!(processed = self.render.processed(), "Camera manager shut down");
    }
}
