//! E2E tests for persistent configuration
//!
//! Round-trip through a real file, fallback to defaults, and the range checks
//! applied when the file is parsed.

use aecsync::config::AppConfig;
use aecsync_core::audio::latency::ExplicitMs;
use aecsync_core::NoiseSuppressionLevel;

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let mut config = AppConfig::default();
    config.probe.name = "speakers".to_string();
    config.probe.explicit_latency = ExplicitMs::Fixed(35);
    config.processor.probe_name = "speakers".to_string();
    config.processor.noise_suppression = true;
    config.processor.noise_suppression_level = NoiseSuppressionLevel::High;
    config.simulation.echo_delay_ms = 120;
    config.save(&path).unwrap();

    let loaded = AppConfig::load_from(&path);
    assert_eq!(loaded, config);
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_file_uses_kebab_case_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    AppConfig::default().save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"echo-cancel\": true"));
    assert!(text.contains("\"explicit-latency\": -1"));
    assert!(text.contains("\"echo-delay-ms\": 40"));
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_from(&dir.path().join("absent.json"));
    assert_eq!(config, AppConfig::default());
}

#[test]
fn test_invalid_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"processor": {"explicit-delay": 9000}}"#).unwrap();

    assert_eq!(AppConfig::load_from(&path), AppConfig::default());
}

#[test]
fn test_partial_file_merges_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"processor": {"echo-cancel": false, "logging-severity": "error"}, "simulation": {"rate": 48000}}"#,
    )
    .unwrap();

    let config = AppConfig::load_from(&path);
    assert!(!config.processor.echo_cancel);
    assert_eq!(config.processor.processing_rate, 32000);
    assert_eq!(config.simulation.rate, 48000);
    assert_eq!(config.simulation.channels, 1);
    assert_eq!(config.probe.name, "probe0");
}

#[test]
fn test_default_path_under_app_dir() {
    let path = AppConfig::path();
    assert!(path.ends_with("aecsync/config.json"));
}
