// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use std::time::Duration;
use ucamera::{CameraError, ConversionPath, PipelineConfig, RenderBackendKind, Resolution};

#[test]
fn test_config_default() {
    // Test that default config can be created
    let config = PipelineConfig::default();

    // Check sensible defaults
    assert_eq!(config.conversion_path, ConversionPath::Compute);
    assert_eq!(config.render_backend, RenderBackendKind::Auto);
    assert_eq!(config.output_size, None);
    assert!(!config.read_back);
    assert_eq!(config.init_timeout(), Duration::from_secs(5));
    assert_eq!(config.close_drain_timeout(), Duration::from_secs(3));
    assert_eq!(config.graphics_teardown_timeout(), Duration::from_secs(2));
}

#[test]
fn test_config_roundtrip_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.json");

    let config = PipelineConfig {
        conversion_path: ConversionPath::ExternalTexture,
        render_backend: RenderBackendKind::Headless,
        output_size: Some(Resolution::new(1280, 720)),
        init_timeout_ms: 750,
        ..Default::default()
    };
    config.save(&path).unwrap();

    let loaded = PipelineConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_config_partial_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.json");
    std::fs::write(&path, r#"{ "conversion_path": "ExternalTexture" }"#).unwrap();

    let loaded = PipelineConfig::load(&path).unwrap();
    assert_eq!(loaded.conversion_path, ConversionPath::ExternalTexture);
    assert_eq!(loaded.close_drain_timeout_ms, 3000);
}

#[test]
fn test_config_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        PipelineConfig::load(&path),
        Err(CameraError::Config(_))
    ));

    let missing = dir.path().join("missing.json");
    assert!(matches!(
        PipelineConfig::load(&missing),
        Err(CameraError::Io(_))
    ));
}

#[test]
fn test_config_rejects_zero_init_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.json");
    std::fs::write(&path, r#"{ "init_timeout_ms": 0 }"#).unwrap();
    assert!(PipelineConfig::load(&path).is_err());
}
