//! Configuration management for termgate.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termgate/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Geometry;

/// Default backend URL.
pub const DEFAULT_TRANSPORT_URL: &str = "ws://127.0.0.1:8022/ws";

/// Default upload chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest accepted chunk size. Must stay well under the frame limit.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("transport url must start with ws:// or wss://, got {0}")]
    InvalidTransportUrl(String),

    #[error("chunk_size must be between 1024 and 8388608 bytes, got {0}")]
    InvalidChunkSize(usize),

    #[error("{name} must be between 1 and 3600 seconds, got {value}")]
    InvalidTimeout { name: &'static str, value: u64 },

    #[error("default terminal geometry must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for termgate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Backend connection settings.
    pub transport: TransportConfig,

    /// Session lifecycle settings.
    pub session: SessionConfig,

    /// Chunked upload settings.
    pub upload: UploadConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket URL of the backend.
    pub url: String,

    /// Compress large frames with LZ4.
    pub compression: bool,
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for `ready` after `connect`.
    pub connect_timeout_secs: u64,

    /// Seconds to wait for the response to a file command.
    pub request_timeout_secs: u64,

    /// Terminal columns used when none are known.
    pub default_cols: u16,

    /// Terminal rows used when none are known.
    pub default_rows: u16,
}

/// Chunked upload settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,

    /// Seconds to wait for each acknowledgement.
    pub ack_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TRANSPORT_URL.to_string(),
            compression: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            request_timeout_secs: 30,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout_secs: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - TERMGATE_URL: Override the backend URL
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TERMGATE_URL") {
            if !url.is_empty() {
                tracing::info!(url = %url, "Overriding transport url from environment");
                self.transport.url = url;
            }
        }

        if let Ok(level) = std::env::var("TERMGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(level = %level, "Overriding log level from environment");
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.transport.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidTransportUrl(url.clone()));
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.upload.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.upload.chunk_size));
        }

        for (name, value) in [
            ("connect_timeout_secs", self.session.connect_timeout_secs),
            ("request_timeout_secs", self.session.request_timeout_secs),
            ("ack_timeout_secs", self.upload.ack_timeout_secs),
        ] {
            if !(1..=3600).contains(&value) {
                return Err(ConfigError::InvalidTimeout { name, value });
            }
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Runtime options derived from this configuration.
    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions::from(self)
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

/// Timeouts and sizes the gateway runtime works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub ack_timeout: Duration,
    pub chunk_size: usize,
    pub default_geometry: Geometry,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        GatewayOptions::from(&Config::default())
    }
}

impl From<&Config> for GatewayOptions {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.session.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.session.request_timeout_secs),
            ack_timeout: Duration::from_secs(config.upload.ack_timeout_secs),
            chunk_size: config.upload.chunk_size,
            default_geometry: Geometry {
                cols: config.session.default_cols,
                rows: config.session.default_rows,
            },
        }
    }
}
