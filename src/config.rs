// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::camera::Resolution;
use crate::constants::{
    DEFAULT_CLOSE_DRAIN_TIMEOUT, DEFAULT_GRAPHICS_TEARDOWN_TIMEOUT, DEFAULT_INIT_TIMEOUT,
};
use crate::errors::{CameraError, CameraResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How frames reach the output texture
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ConversionPath {
    /// Copy raw planes off the capture thread and convert them with a
    /// compute pass on the render thread
    #[default]
    Compute,
    /// Let the camera write into an external texture and blit it into the
    /// output on the render thread
    ExternalTexture,
}

impl std::fmt::Display for ConversionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionPath::Compute => write!(f, "compute"),
            ConversionPath::ExternalTexture => write!(f, "external-texture"),
        }
    }
}

impl std::str::FromStr for ConversionPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compute" | "a" => Ok(ConversionPath::Compute),
            "external" | "external-texture" | "texture" | "b" => {
                Ok(ConversionPath::ExternalTexture)
            }
            other => Err(format!("unknown conversion path '{}'", other)),
        }
    }
}

/// Graphics backend driving the render thread
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum RenderBackendKind {
    /// GPU when an adapter is available, CPU renderer otherwise
    #[default]
    Auto,
    /// GPU only; fail if no adapter exists
    Wgpu,
    /// CPU renderer
    Headless,
}

/// Pipeline settings, loadable from JSON
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Conversion strategy for new pipelines
    pub conversion_path: ConversionPath,
    /// Render thread backend
    pub render_backend: RenderBackendKind,
    /// Fixed output texture size; the session resolution when unset
    pub output_size: Option<Resolution>,
    /// Bound on waiting for a device to finish opening
    pub init_timeout_ms: u64,
    /// Bound on draining in-flight captures during close
    pub close_drain_timeout_ms: u64,
    /// Bound on graphics cleanup confirmation during close
    pub graphics_teardown_timeout_ms: u64,
    /// Copy GPU output back so texture handles carry pixels
    pub read_back: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conversion_path: ConversionPath::default(),
            render_backend: RenderBackendKind::default(),
            output_size: None,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT.as_millis() as u64,
            close_drain_timeout_ms: DEFAULT_CLOSE_DRAIN_TIMEOUT.as_millis() as u64,
            graphics_teardown_timeout_ms: DEFAULT_GRAPHICS_TEARDOWN_TIMEOUT.as_millis() as u64,
            read_back: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> CameraResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> CameraResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> CameraResult<()> {
        if let Some(size) = self.output_size
            && size.is_empty()
        {
            return Err(CameraError::Config(format!(
                "output_size {} has a zero dimension",
                size
            )));
        }
        if self.init_timeout_ms == 0 {
            return Err(CameraError::Config(
                "init_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Output texture size for a session at `resolution`
    pub fn output_size_for(&self, resolution: Resolution) -> Resolution {
        self.output_size.unwrap_or(resolution)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }

    pub fn graphics_teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.graphics_teardown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_path_parse() {
        assert_eq!("compute".parse(), Ok(ConversionPath::Compute));
        assert_eq!("External".parse(), Ok(ConversionPath::ExternalTexture));
        assert!("opengl".parse::<ConversionPath>().is_err());
    }

    #[test]
    fn test_output_size_defaults_to_session() {
        let mut config = PipelineConfig::default();
        let res = Resolution::new(640, 480);
        assert_eq!(config.output_size_for(res), res);

        config.output_size = Some(Resolution::new(320, 240));
        assert_eq!(config.output_size_for(res), Resolution::new(320, 240));
    }

    #[test]
    fn test_validate_rejects_empty_output() {
        let config = PipelineConfig {
            output_size: Some(Resolution::new(0, 240)),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CameraError::Config(_))));
    }
}
