//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bedrock_wire::config::{
    CodecConfig, FrameConfig, LoggingConfig, SessionConfig, WireConfig, DEFAULT_COMPRESSION_LEVEL,
    MAX_PAYLOAD_SIZE,
};
use bedrock_wire::error::ProtocolError;
use bedrock_wire::utils::crypto::CipherBackend;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = WireConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_frame_defaults() {
    let frame = FrameConfig::default();
    assert_eq!(frame.compression_level, DEFAULT_COMPRESSION_LEVEL);
    assert_eq!(frame.compression_level, 7);
    assert_eq!(frame.max_decompressed_size, MAX_PAYLOAD_SIZE);
    assert_eq!(frame.cipher_backend, CipherBackend::Auto);
}

#[test]
fn test_compression_level_out_of_range() {
    let config = WireConfig::default_with_overrides(|c| c.frame.compression_level = 12);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid compression level")));
    assert!(matches!(
        config.validate_strict(),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_decompressed_size_bounds() {
    let mut config = WireConfig::default();
    config.frame.max_decompressed_size = 100;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max decompressed size too small")));

    config.frame.max_decompressed_size = 1024 * 1024 * 1024;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max decompressed size too large")));
}

#[test]
fn test_session_timeouts() {
    let session = SessionConfig {
        send_timeout: Duration::from_millis(1),
        recv_timeout: Duration::from_secs(7200),
        ..SessionConfig::default()
    };
    let errors = session.validate();
    assert!(errors.iter().any(|e| e.contains("Send timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Receive timeout too long")));
}

#[test]
fn test_zero_offload_threshold() {
    let session = SessionConfig {
        offload_threshold_bytes: 0,
        ..SessionConfig::default()
    };
    assert!(session
        .validate()
        .iter()
        .any(|e| e.contains("Offload threshold")));
}

#[test]
fn test_codec_limits() {
    let codec = CodecConfig {
        max_nesting_depth: 0,
        max_type_depth: 0,
        max_collection_length: 0,
        verify_roundtrip: false,
    };
    let errors = codec.validate();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().any(|e| e.contains("Max type depth")));

    let deep = CodecConfig {
        max_nesting_depth: 10_000,
        ..CodecConfig::default()
    };
    assert!(deep.validate()[0].contains("Max nesting depth too large"));

    let long_chain = CodecConfig {
        max_type_depth: 5_000,
        ..CodecConfig::default()
    };
    assert!(long_chain.validate()[0].contains("Max type depth too large"));
}

#[test]
fn test_logging_app_name() {
    let logging = LoggingConfig {
        app_name: String::new(),
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_toml_roundtrip_through_file() {
    let mut config = WireConfig::default();
    config.frame.compression_level = 3;
    config.frame.cipher_backend = CipherBackend::Software;
    config.session.batching = true;
    config.session.recv_timeout = Duration::from_millis(2500);
    config.codec.verify_roundtrip = true;
    config.logging.log_level = Level::DEBUG;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wire.toml");
    config.save_to_file(&path).unwrap();

    let loaded = WireConfig::from_file(&path).unwrap();
    assert_eq!(loaded.frame.compression_level, 3);
    assert_eq!(loaded.frame.cipher_backend, CipherBackend::Software);
    assert!(loaded.session.batching);
    assert_eq!(loaded.session.recv_timeout, Duration::from_millis(2500));
    assert!(loaded.codec.verify_roundtrip);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_example_config_parses() {
    let example = WireConfig::example_config();
    assert!(example.contains("compression_level"));
    let parsed = WireConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_partial_toml_uses_section_defaults() {
    let parsed = WireConfig::from_toml(
        r#"
        [frame]
        compression_level = 9
        max_decompressed_size = 65536
        cipher_backend = "native"
        "#,
    )
    .unwrap();
    assert_eq!(parsed.frame.compression_level, 9);
    assert_eq!(parsed.frame.cipher_backend, CipherBackend::Native);
    assert_eq!(parsed.session.offload_threshold_bytes, 64 * 1024);
}

#[test]
fn test_bad_toml_is_config_error() {
    assert!(matches!(
        WireConfig::from_toml("[frame]\ncompression_level = \"high\""),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(WireConfig::from_file("/nonexistent/wire.toml").is_err());
}
