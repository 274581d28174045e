//! Integration tests for configuration loading and validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use interlink::config::{
    LoggingConfig, MessagingConfig, PeerConfig, ReconnectMode, DEFAULT_CHANNEL,
};
use interlink::core::serialization::SerializationFormat;
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = MessagingConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert_eq!(config.pubsub.channel, DEFAULT_CHANNEL);
    assert_eq!(config.dispatch.format, SerializationFormat::Json);
    assert!(!config.pubsub.filter_self);
}

#[test]
fn test_empty_server_name() {
    let mut config = MessagingConfig::default();
    config.identity.server_name = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Server name cannot be empty")));
}

#[test]
fn test_broadcast_server_name() {
    let mut config = MessagingConfig::default();
    config.identity.server_name = "*".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("broadcast")));
}

#[test]
fn test_short_shared_secret() {
    let mut config = MessagingConfig::default();
    config.identity.shared_secret = Some("short".to_string());

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Shared secret too short")));
}

#[test]
fn test_zero_dedup_capacity() {
    let mut config = MessagingConfig::default();
    config.dispatch.dedup_capacity = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Dedup capacity must be greater than 0")));
}

#[test]
fn test_empty_pubsub_channel() {
    let mut config = MessagingConfig::default();
    config.pubsub.channel = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("channel cannot be empty")));
}

#[test]
fn test_peer_expiry_must_exceed_heartbeat() {
    let mut config = MessagingConfig::default();
    config.pubsub.heartbeat_interval = Duration::from_secs(10);
    config.pubsub.peer_expiry = Duration::from_secs(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Peer expiry must be longer than the heartbeat interval")));
}

#[test]
fn test_invalid_bind_host() {
    let mut config = MessagingConfig::default();
    config.socket.bind_host = "not an address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid bind address")));
}

#[test]
fn test_short_connect_timeout() {
    let mut config = MessagingConfig::default();
    config.socket.connect_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_small_max_frame_size() {
    let mut config = MessagingConfig::default();
    config.socket.max_frame_size = 100;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max frame size too small")));
}

#[test]
fn test_peer_table_rejects_own_name_and_bad_addresses() {
    let mut config = MessagingConfig::default();
    config.identity.server_name = "lobby-1".to_string();
    config
        .socket
        .peers
        .insert("lobby-1".to_string(), PeerConfig::new("10.0.0.1", 25590));
    config
        .socket
        .peers
        .insert("survival".to_string(), PeerConfig::new("", 25590));

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("own name")));
    assert!(errors.iter().any(|e| e.contains("Invalid address for peer 'survival'")));
}

#[test]
fn test_reconnect_delays_must_be_ordered() {
    let mut config = MessagingConfig::default();
    config.socket.reconnect.initial_delay = Duration::from_secs(5);
    config.socket.reconnect.max_delay = Duration::from_secs(1);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Reconnect max delay cannot be shorter")));
}

#[test]
fn test_logging_requires_an_output() {
    let config = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_logging_file_needs_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_validate_strict_lists_every_problem() {
    let mut config = MessagingConfig::default();
    config.identity.server_name = String::new();
    config.pubsub.publish_queue = 0;

    let err = config.validate_strict().unwrap_err().to_string();
    assert!(err.contains("Server name cannot be empty"));
    assert!(err.contains("Publish queue must be greater than 0"));
}

#[test]
fn test_partial_toml_fills_in_defaults() {
    let config = MessagingConfig::from_toml(
        r#"
        [identity]
        server_name = "lobby-1"
        shared_secret = "change-me-to-a-long-random-value"

        [dispatch]
        format = "messagepack"

        [pubsub]
        channel = "network"
        filter_self = true
        heartbeat_interval = 2000

        [socket]
        port = 30000
        response_timeout = 1500

        [socket.reconnect]
        mode = "manual"

        [socket.peers.survival]
        host = "10.0.0.2"
        port = 30001

        [logging]
        log_level = "debug"
        "#,
    )
    .unwrap();

    assert_eq!(config.identity.server_name, "lobby-1");
    assert_eq!(config.dispatch.format, SerializationFormat::MessagePack);
    assert_eq!(config.dispatch.dedup_capacity, 10_000);
    assert_eq!(config.pubsub.channel, "network");
    assert!(config.pubsub.filter_self);
    assert_eq!(config.pubsub.heartbeat_interval, Duration::from_millis(2000));
    assert_eq!(config.pubsub.port, 6379);
    assert_eq!(config.socket.port, 30000);
    assert_eq!(config.socket.response_timeout, Duration::from_millis(1500));
    assert_eq!(config.socket.reconnect.mode, ReconnectMode::Manual);
    assert_eq!(
        config.socket.peers.get("survival"),
        Some(&PeerConfig::new("10.0.0.2", 30001))
    );
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty());
}

#[test]
fn test_malformed_toml_is_a_config_error() {
    let result = MessagingConfig::from_toml("[identity\nserver_name = ");
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Failed to parse TOML"));
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interlink.toml");

    let config = MessagingConfig::default_with_overrides(|c| {
        c.identity.server_name = "hub".to_string();
        c.socket
            .peers
            .insert("edge-1".to_string(), PeerConfig::new("192.168.1.20", 25591));
        c.pubsub.password = Some("hunter2".to_string());
    });
    config.save_to_file(&path).unwrap();

    let loaded = MessagingConfig::from_file(&path).unwrap();
    assert_eq!(loaded.identity.server_name, "hub");
    assert_eq!(loaded.socket.peers.len(), 1);
    assert_eq!(loaded.pubsub.url(), "redis://:hunter2@127.0.0.1:6379/");
    assert_eq!(loaded.socket.connect_timeout, config.socket.connect_timeout);
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = MessagingConfig::from_file(dir.path().join("absent.toml"));
    assert!(result.unwrap_err().to_string().contains("Failed to open"));
}

#[test]
fn test_example_config_parses() {
    let example = MessagingConfig::example_config();
    let parsed = MessagingConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("INTERLINK_SERVER_NAME", "from-env");
    std::env::set_var("INTERLINK_PUBSUB_PORT", "6380");
    std::env::set_var("INTERLINK_RESPONSE_TIMEOUT_MS", "750");

    let config = MessagingConfig::from_env().unwrap();

    std::env::remove_var("INTERLINK_SERVER_NAME");
    std::env::remove_var("INTERLINK_PUBSUB_PORT");
    std::env::remove_var("INTERLINK_RESPONSE_TIMEOUT_MS");

    assert_eq!(config.identity.server_name, "from-env");
    assert_eq!(config.pubsub.port, 6380);
    assert_eq!(config.socket.response_timeout, Duration::from_millis(750));
}

#[test]
#[serial]
fn test_env_bad_port_is_rejected() {
    std::env::set_var("INTERLINK_SOCKET_PORT", "not-a-port");
    let result = MessagingConfig::from_env();
    std::env::remove_var("INTERLINK_SOCKET_PORT");

    assert!(result.is_err());
}
