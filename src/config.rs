//! # Configuration Management
//!
//! Centralized configuration for sessions.
//!
//! This module provides structured configuration for the listening side,
//! the connecting side, the transport itself, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`DUALNET_*`)
//!
//! Durations are written as integer milliseconds in TOML.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Upper bound on bytes buffered for one reliable connection without a
/// complete frame (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Receive buffer for one datagram. Larger datagrams are truncated by the OS.
pub const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of candidate ids a client proposes before giving up
pub const MAX_ID_RETRIES: u32 = 16;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Listening-side configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Connecting-side configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
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

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DUALNET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(port) = std::env::var("DUALNET_SERVER_UNRELIABLE_PORT") {
            config.server.unreliable_port = port.parse::<u16>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid DUALNET_SERVER_UNRELIABLE_PORT: {e}"))
            })?;
        }

        if let Ok(addr) = std::env::var("DUALNET_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(timeout) = std::env::var("DUALNET_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(retries) = std::env::var("DUALNET_MAX_ID_RETRIES") {
            if let Ok(val) = retries.parse::<u32>() {
                config.client.max_id_retries = val;
            }
        }

        if let Ok(interval) = std::env::var("DUALNET_HOLE_PUNCH_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.transport.hole_punch_interval = Duration::from_millis(val);
            }
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
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
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

/// Listening-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Reliable channel listen address (e.g., "0.0.0.0:31426")
    pub address: String,

    /// Unreliable channel port, bound on the same IP as `address`.
    /// 0 picks an ephemeral port; clients learn it during the handshake.
    pub unreliable_port: u16,

    /// Maximum number of registered connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:31426"),
            unreliable_port: 31427,
            max_connections: 64,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:31426')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Connecting-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default server address
    pub address: String,

    /// Timeout for opening the reliable connection
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout for the identity handshake after the socket is open
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Candidate ids proposed before `connect` fails with `TooManyRetries`
    pub max_id_retries: u32,

    /// Local bind address of the unreliable socket
    pub unreliable_bind: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:31426"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            max_id_retries: MAX_ID_RETRIES,
            unreliable_bind: String::from("0.0.0.0:0"),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '192.168.0.10:31426')",
                self.address
            ));
        }

        if self.unreliable_bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid unreliable bind address: '{}'",
                self.unreliable_bind
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.max_id_retries == 0 {
            errors.push("Max id retries must be greater than 0".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between hole-punching keep-alives
    #[serde(with = "duration_serde")]
    pub hole_punch_interval: Duration,

    /// Maximum bytes buffered on a reliable connection without a complete frame
    pub max_frame_size: usize,

    /// Receive buffer size for one datagram
    pub datagram_buffer_size: usize,

    /// Tell the peer its new unreliable port (`newudpport`) after a NAT re-binding
    pub announce_rebinding: bool,

    /// Disable Nagle's algorithm on reliable connections
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hole_punch_interval: timeout::KEEPALIVE_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
            datagram_buffer_size: DATAGRAM_BUFFER_SIZE,
            announce_rebinding: true,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.hole_punch_interval.as_millis() < 10 {
            errors.push("Hole punch interval too short (minimum: 10ms)".to_string());
        } else if self.hole_punch_interval.as_secs() > 60 {
            errors.push(
                "Hole punch interval too long (maximum: 60s, NAT mappings expire)".to_string(),
            );
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        if self.datagram_buffer_size < 512 {
            errors.push("Datagram buffer too small (minimum: 512 bytes)".to_string());
        } else if self.datagram_buffer_size > 65_536 {
            errors.push(format!(
                "Datagram buffer larger than a UDP datagram: {} bytes (maximum: 65536)",
                self.datagram_buffer_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for console logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("dualnet"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
