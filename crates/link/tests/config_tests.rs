//! Integration tests for configuration parsing
//!
//! Run with: `cargo test -p link --test config_tests`

use link::LinkConfig;
use link::config::load_config;
use std::io::Write;
use std::time::Duration;

const MINIMAL_CONFIG: &str = r#"
[general]
log_level = "info"

[usb]
"#;

const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"

[usb]
filters = ["0x04f9:*", "0x1234:0x5678"]
poll_interval_ms = 250
auto_request_permission = true
skip_root_hubs = false

[transfer]
default_timeout_ms = 5000
receive_buffer_size = 4096
permission_timeout_ms = 10000
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_minimal_config_uses_defaults() {
    let file = write_config(MINIMAL_CONFIG);
    let config = LinkConfig::load(Some(file.path().to_path_buf())).unwrap();

    assert!(config.usb.filters.is_empty());
    assert_eq!(config.usb.poll_interval(), Duration::from_millis(500));
    assert!(config.usb.skip_root_hubs);
    assert_eq!(config.transfer.default_timeout_ms, 1000);
    assert_eq!(config.transfer.receive_buffer_size, 1024);
    assert_eq!(config.transfer.permission_timeout(), Duration::from_secs(30));
}

#[test]
fn test_full_config() {
    let file = write_config(FULL_CONFIG);
    let config = load_config(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.general.log_level, "debug");
    assert_eq!(config.usb.filters.len(), 2);
    assert!(config.usb.auto_request_permission);
    assert!(!config.usb.skip_root_hubs);
    assert_eq!(config.transfer.transfer_timeout(), Duration::from_secs(5));
    assert_eq!(config.transfer.receive_buffer_size, 4096);
}

#[test]
fn test_invalid_filter_rejected() {
    let file = write_config(
        r#"
[general]
log_level = "info"

[usb]
filters = ["1234:5678"]
"#,
    );
    assert!(LinkConfig::load(Some(file.path().to_path_buf())).is_err());
}

#[test]
fn test_missing_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(LinkConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("link.toml");

    let mut config = LinkConfig::default();
    config.usb.filters = vec!["0xabcd:*".to_string()];
    config.transfer.default_timeout_ms = 2500;
    config.save(&path).unwrap();

    let reloaded = LinkConfig::load(Some(path)).unwrap();
    assert_eq!(reloaded.usb.filters, config.usb.filters);
    assert_eq!(reloaded.transfer.default_timeout_ms, 2500);
}
