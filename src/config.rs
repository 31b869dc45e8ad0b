//! # Configuration Management
//!
//! Centralized configuration for the wire layer.
//!
//! This module provides structured configuration for the frame pipeline, the secure
//! session wrapper, the schema codecs and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Security Considerations
//! - `max_decompressed_size` caps inflate output so a small frame cannot expand without bound
//! - `cipher_backend = "software"` is behaviorally identical to the library backend
//! - Collection and nesting limits bound the work a single packet can demand

use crate::error::{ProtocolError, Result};
use crate::utils::crypto::CipherBackend;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Oldest protocol version whose definitions this crate accepts
pub const MIN_PROTOCOL_VERSION: u32 = 354;

/// Max allowed plaintext size after decompression (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Length of the truncated SHA-256 frame checksum
pub const CHECKSUM_LEN: usize = 8;

/// AES-256 key length
pub const KEY_LEN: usize = 32;

/// CFB-8 initialization vector length
pub const IV_LEN: usize = 16;

/// Raw deflate level applied on the send path
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 7;

/// Highest deflate level
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Deepest tagged-tree nesting accepted on read
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 512;

/// Deepest chain of type references one codec walk may follow
pub const DEFAULT_MAX_TYPE_DEPTH: usize = 64;

/// Most elements of one array that may decode from zero bytes
pub const MAX_EMPTY_ELEMENTS: usize = 4096;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WireConfig {
    /// Frame pipeline configuration
    #[serde(default)]
    pub frame: FrameConfig,

    /// Secure session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Schema codec configuration
    #[serde(default)]
    pub codec: CodecConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WireConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("BEDROCK_WIRE_COMPRESSION_LEVEL") {
            if let Ok(val) = level.parse::<u32>() {
                config.frame.compression_level = val;
            }
        }

        if let Ok(backend) = std::env::var("BEDROCK_WIRE_CIPHER_BACKEND") {
            config.frame.cipher_backend = match backend.to_ascii_lowercase().as_str() {
                "auto" => CipherBackend::Auto,
                "native" => CipherBackend::Native,
                "software" => CipherBackend::Software,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown cipher backend: {other}"
                    )))
                }
            };
        }

        if let Ok(timeout) = std::env::var("BEDROCK_WIRE_RECV_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.recv_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("BEDROCK_WIRE_SEND_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.send_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(flag) = std::env::var("BEDROCK_WIRE_VERIFY_ROUNDTRIP") {
            config.codec.verify_roundtrip = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.frame.validate());
        errors.extend(self.session.validate());
        errors.extend(self.codec.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Frame pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameConfig {
    /// Raw deflate level (0-9)
    pub compression_level: u32,

    /// Upper bound on inflated plaintext size in bytes
    pub max_decompressed_size: usize,

    /// Which AES-256-CFB8 implementation to use
    pub cipher_backend: CipherBackend,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_decompressed_size: MAX_PAYLOAD_SIZE,
            cipher_backend: CipherBackend::Auto,
        }
    }
}

impl FrameConfig {
    /// Validate frame configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.compression_level > MAX_COMPRESSION_LEVEL {
            errors.push(format!(
                "Invalid compression level: {} (valid range: 0-9)",
                self.compression_level
            ));
        }

        if self.max_decompressed_size < 1024 {
            errors.push("Max decompressed size too small (minimum: 1 KB)".to_string());
        } else if self.max_decompressed_size > 256 * 1024 * 1024 {
            errors.push(format!(
                "Max decompressed size too large: {} bytes (maximum: 256 MB)",
                self.max_decompressed_size
            ));
        }

        if self.cipher_backend == CipherBackend::Native && !cfg!(feature = "native-cipher") {
            errors.push(
                "Cipher backend 'native' requires the native-cipher feature".to_string(),
            );
        }

        errors
    }
}

/// Secure session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Timeout for handing a frame to the transport
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Timeout for waiting on the next inbound frame
    #[serde(with = "duration_serde")]
    pub recv_timeout: Duration,

    /// Payloads at or above this size are (de)compressed on the blocking pool
    pub offload_threshold_bytes: usize,

    /// Pack queued packets into one frame as length-prefixed batches
    pub batching: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_timeout: timeout::DEFAULT_TIMEOUT,
            recv_timeout: timeout::RECV_TIMEOUT,
            offload_threshold_bytes: 64 * 1024,
            batching: false,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.send_timeout.as_millis() < 10 {
            errors.push("Send timeout too short (minimum: 10ms)".to_string());
        } else if self.send_timeout.as_secs() > 300 {
            errors.push("Send timeout too long (maximum: 300s)".to_string());
        }

        if self.recv_timeout.as_millis() < 100 {
            errors.push("Receive timeout too short (minimum: 100ms)".to_string());
        } else if self.recv_timeout.as_secs() > 3600 {
            errors.push("Receive timeout too long (maximum: 1 hour)".to_string());
        }

        if self.offload_threshold_bytes == 0 {
            errors.push("Offload threshold must be greater than 0".to_string());
        }

        errors
    }
}

/// Schema codec configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodecConfig {
    /// Deepest tagged-tree nesting accepted on read
    pub max_nesting_depth: usize,

    /// Deepest chain of named-type references, counted across extension re-entry
    pub max_type_depth: usize,

    /// Largest element count any array, string or buffer may declare
    pub max_collection_length: usize,

    /// Re-encode every decoded packet and compare against the received bytes
    pub verify_roundtrip: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            max_type_depth: DEFAULT_MAX_TYPE_DEPTH,
            max_collection_length: MAX_PAYLOAD_SIZE,
            verify_roundtrip: false,
        }
    }
}

impl CodecConfig {
    /// Validate codec configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_nesting_depth == 0 {
            errors.push("Max nesting depth must be greater than 0".to_string());
        } else if self.max_nesting_depth > 4096 {
            errors.push(format!(
                "Max nesting depth too large: {} (maximum: 4096)",
                self.max_nesting_depth
            ));
        }

        if self.max_type_depth == 0 {
            errors.push("Max type depth must be greater than 0".to_string());
        } else if self.max_type_depth > 1024 {
            errors.push(format!(
                "Max type depth too large: {} (maximum: 1024)",
                self.max_type_depth
            ));
        }

        if self.max_collection_length == 0 {
            errors.push("Max collection length must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("bedrock-wire"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
