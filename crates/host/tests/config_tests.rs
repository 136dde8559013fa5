//! Integration tests for host configuration files
//!
//! Tests loading, saving and rejecting configuration files on disk:
//! - Full config with every section
//! - Save followed by load
//! - Invalid values and malformed files

use host::HostConfig;
use std::fs;

const FULL_CONFIG: &str = r#"
log_level = "debug"

[usb]
vendor_id = 0x04b4
product_stream = 0x00f1
product_boot = 0x00f3
rescan_attempts = 3
rescan_delay_ms = 250

[stream]
ppx = 32
queue_size = 32
timeout_ms = 2000
verify_pattern = true
forward_samples = false

[thresholds]
bandwidth_period_ms = 500
failure_window = 64
failure_ratio = 0.25
integrity_window = 128
integrity_gap_ratio = 0.05

[processing]
fill_enabled = true
fft_enabled = true
fft_skip_frames = 4
fft_channels = [true, true, false, false]
dump_path = "/tmp/fx3.bin"
dump_limit = 1048576

[processing.pipeline]
fill_threshold = 65536
fft_window = 4096
"#;

// ============================================================================
// Loading Tests
// ============================================================================

#[test]
fn test_load_full_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.usb.vendor_id, 0x04b4);
    assert_eq!(config.usb.product_stream, 0x00f1);
    assert_eq!(config.usb.rescan_attempts, 3);
    assert_eq!(config.stream.ppx, Some(32));
    assert_eq!(config.stream.queue_size, 32);
    assert!(config.stream.verify_pattern);
    assert_eq!(config.thresholds.bandwidth_period_ms, 500);
    assert_eq!(config.thresholds.integrity_window, 128);
    assert!(config.processing.fill_enabled);
    assert_eq!(config.processing.fft_skip_frames, 4);
    assert_eq!(config.processing.fft_channels, [true, true, false, false]);
    assert_eq!(config.processing.dump_limit, 1 << 20);
    assert_eq!(config.processing.pipeline.fill_threshold, 65536);
    assert_eq!(config.processing.pipeline.fft_window, 4096);

    let options = config.stream.options();
    assert!(options.verify_pattern);
    assert!(!options.forward_samples);
}

#[test]
fn test_load_empty_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, "").unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config, HostConfig::default());
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(HostConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.stream.queue_size = 8;
    config.stream.ppx = Some(4);
    config.processing.dump_path = Some("/tmp/capture.bin".into());
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

// ============================================================================
// Invalid Configuration Tests
// ============================================================================

#[test]
fn test_reject_out_of_range_queue_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, "[stream]\nqueue_size = 65\n").unwrap();

    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("queue_size"));
}

#[test]
fn test_reject_bad_fft_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, "[processing.pipeline]\nfft_window = 3000\n").unwrap();

    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_reject_malformed_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, "[stream\nqueue_size = ").unwrap();

    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse"));
}
