//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use std::time::Duration;
use tictoc_net::config::{NetworkConfig, DEFAULT_PORT, MAX_BODY_SIZE};
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert_eq!(config.server.address, format!("0.0.0.0:{DEFAULT_PORT}"));
    assert_eq!(config.server.io_threads, 1);
    assert_eq!(config.transport.max_body_size, MAX_BODY_SIZE);
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_max_connections() {
    let config = NetworkConfig::default_with_overrides(|c| c.server.max_connections = 0);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let config = NetworkConfig::default_with_overrides(|c| c.server.max_connections = 200_000);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("very high")));
}

#[test]
fn test_io_thread_bounds() {
    let none = NetworkConfig::default_with_overrides(|c| c.server.io_threads = 0);
    assert!(none
        .validate()
        .iter()
        .any(|e| e.contains("I/O threads must be greater than 0")));

    let many = NetworkConfig::default_with_overrides(|c| c.server.io_threads = 1000);
    assert!(many.validate().iter().any(|e| e.contains("Too many I/O threads")));
}

#[test]
fn test_poll_interval_bounds() {
    let zero = NetworkConfig::default_with_overrides(|c| c.server.poll_interval = Duration::ZERO);
    assert!(zero
        .validate()
        .iter()
        .any(|e| e.contains("Poll interval must be greater than 0")));

    let long =
        NetworkConfig::default_with_overrides(|c| c.server.poll_interval = Duration::from_secs(30));
    assert!(long.validate().iter().any(|e| e.contains("Poll interval too long")));
}

#[test]
fn test_short_shutdown_timeout() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.shutdown_timeout = Duration::from_millis(10)
    });
    assert!(config.validate().iter().any(|e| e.contains("Shutdown timeout too short")));
}

#[test]
fn test_zero_max_body_size() {
    let config = NetworkConfig::default_with_overrides(|c| c.transport.max_body_size = 0);
    assert!(config.validate().iter().any(|e| e.contains("Max body size cannot be 0")));
}

#[test]
fn test_empty_app_name() {
    let config = NetworkConfig::default_with_overrides(|c| c.logging.app_name = String::new());
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    assert!(NetworkConfig::default().validate_strict().is_ok());
}

#[test]
fn test_multiple_validation_errors() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "nowhere".to_string();
        c.server.max_connections = 0;
        c.transport.max_body_size = 0;
    });

    assert_eq!(config.validate().len(), 3);
    let err = config.validate_strict().expect_err("invalid config");
    let text = err.to_string();
    assert!(text.contains("Configuration validation failed"));
    assert!(text.contains("Invalid server address"));
    assert!(text.contains("Max body size cannot be 0"));
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "127.0.0.1:4000"
        poll_interval = 25

        [logging]
        log_level = "debug"
        json_format = true
        "#,
    )
    .expect("valid TOML");

    assert_eq!(config.server.address, "127.0.0.1:4000");
    assert_eq!(config.server.poll_interval, Duration::from_millis(25));
    assert_eq!(config.server.max_connections, 1000);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.logging.json_format);
    assert!(config.transport.nodelay);
}

#[test]
fn test_bad_toml_is_a_config_error() {
    let err = NetworkConfig::from_toml("[logging]\nlog_level = \"loud\"").expect_err("bad level");
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_example_config_parses_back() {
    let text = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&text).expect("example config should parse");
    assert_eq!(parsed.server.address, NetworkConfig::default().server.address);
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_missing_config_file() {
    let err = NetworkConfig::from_file("/definitely/not/here.toml").expect_err("missing file");
    assert!(err.to_string().contains("Failed to open config file"));
}

// Environment variables are process-wide, so every env case lives in this one test
#[test]
fn test_env_overrides() {
    std::env::set_var("TICTOC_SERVER_ADDRESS", "127.0.0.1:31000");
    std::env::set_var("TICTOC_MAX_CONNECTIONS", "8");
    std::env::set_var("TICTOC_POLL_INTERVAL_MS", "40");
    std::env::set_var("TICTOC_LOG_LEVEL", "warn");

    let config = NetworkConfig::from_env().expect("valid env");
    assert_eq!(config.server.address, "127.0.0.1:31000");
    assert_eq!(config.server.max_connections, 8);
    assert_eq!(config.server.poll_interval, Duration::from_millis(40));
    assert_eq!(config.logging.log_level, Level::WARN);

    std::env::set_var("TICTOC_MAX_CONNECTIONS", "lots");
    let err = NetworkConfig::from_env().expect_err("unparseable count");
    assert!(err.to_string().contains("TICTOC_MAX_CONNECTIONS"));

    for name in [
        "TICTOC_SERVER_ADDRESS",
        "TICTOC_MAX_CONNECTIONS",
        "TICTOC_POLL_INTERVAL_MS",
        "TICTOC_LOG_LEVEL",
    ] {
        std::env::remove_var(name);
    }
}
