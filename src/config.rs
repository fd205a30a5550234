//! # Configuration Management
//!
//! Centralized configuration for the RPC runtime.
//!
//! This module provides structured configuration for servers and clients:
//! fragment sizes offered during bind negotiation, worker pool limits, timeouts,
//! transport limits, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Security Considerations
//! - `max_packet_size` bounds reassembly buffers regardless of alloc hints
//! - The worker pool is capped so a flood of requests cannot spawn without limit

use crate::core::header::{DEFAULT_MAX_FRAG, MUST_RECV_FRAG_SIZE};
use crate::error::{Result, RpcError};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed reassembled packet size (16 MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Hard upper bound on server worker tasks
pub const MAX_WORKERS: usize = 128;

/// Smallest usable fragment: a request header plus four stub bytes
pub const MIN_FRAG_SIZE: u16 = 28;

/// Main runtime configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RuntimeConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| RpcError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| RpcError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| RpcError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RPC_RUNTIME_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }

        if let Ok(workers) = std::env::var("RPC_RUNTIME_MAX_WORKERS") {
            if let Ok(val) = workers.parse::<usize>() {
                config.server.max_workers = val;
            }
        }

        if let Ok(frag) = std::env::var("RPC_RUNTIME_MAX_FRAG") {
            if let Ok(val) = frag.parse::<u16>() {
                config.server.max_transmit_frag = val;
                config.server.max_receive_frag = val;
                config.client.max_transmit_frag = val;
                config.client.max_receive_frag = val;
            }
        }

        if let Ok(timeout) = std::env::var("RPC_RUNTIME_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("RPC_RUNTIME_CALL_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.call_timeout = Some(Duration::from_millis(val));
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
            .map_err(|e| RpcError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| RpcError::Config(format!("Failed to write config file: {e}")))?;

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
            Err(RpcError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn validate_frag(errors: &mut Vec<String>, side: &str, name: &str, value: u16) {
    if value < MIN_FRAG_SIZE {
        errors.push(format!(
            "{side} {name} too small: {value} (minimum: {MIN_FRAG_SIZE})"
        ));
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address listeners bind to for network protocol sequences
    pub bind_address: String,

    /// Largest fragment the server sends after negotiation
    pub max_transmit_frag: u16,

    /// Largest fragment the server accepts after negotiation
    pub max_receive_frag: u16,

    /// Upper bound on worker tasks (never above 128)
    pub max_workers: usize,

    /// How long an idle worker waits before it may retire
    #[serde(with = "duration_serde")]
    pub worker_idle_timeout: Duration,

    /// Default per-endpoint cap on concurrently served connections
    pub max_calls: usize,

    /// Grace period for in-flight calls when the server stops
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0"),
            max_transmit_frag: DEFAULT_MAX_FRAG,
            max_receive_frag: DEFAULT_MAX_FRAG,
            max_workers: MAX_WORKERS,
            worker_idle_timeout: timeout::WORKER_IDLE_TIMEOUT,
            max_calls: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Server bind address cannot be empty".to_string());
        } else if self.bind_address.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "Invalid server bind address: '{}' (expected an IP address such as '0.0.0.0')",
                self.bind_address
            ));
        }

        validate_frag(&mut errors, "Server", "max_transmit_frag", self.max_transmit_frag);
        validate_frag(&mut errors, "Server", "max_receive_frag", self.max_receive_frag);

        if self.max_workers == 0 {
            errors.push("Max workers must be greater than 0".to_string());
        } else if self.max_workers > MAX_WORKERS {
            errors.push(format!(
                "Max workers too large: {} (maximum: {MAX_WORKERS})",
                self.max_workers
            ));
        }

        if self.worker_idle_timeout.as_millis() < 10 {
            errors.push("Worker idle timeout too short (minimum: 10ms)".to_string());
        } else if self.worker_idle_timeout.as_secs() > 3600 {
            errors.push("Worker idle timeout too long (maximum: 1 hour)".to_string());
        }

        if self.max_calls == 0 {
            errors.push("Max calls must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest fragment the client asks to send
    pub max_transmit_frag: u16,

    /// Largest fragment the client accepts
    pub max_receive_frag: u16,

    /// Timeout for opening a channel
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Deadline for one request/response exchange; unbounded when absent
    #[serde(
        default,
        with = "option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_transmit_frag: DEFAULT_MAX_FRAG,
            max_receive_frag: DEFAULT_MAX_FRAG,
            connect_timeout: timeout::DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_frag(&mut errors, "Client", "max_transmit_frag", self.max_transmit_frag);
        validate_frag(&mut errors, "Client", "max_receive_frag", self.max_receive_frag);

        if self.max_receive_frag < MUST_RECV_FRAG_SIZE {
            errors.push(format!(
                "WARNING: Client max_receive_frag {} is below the {MUST_RECV_FRAG_SIZE}-byte size peers may send before negotiation",
                self.max_receive_frag
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if let Some(call_timeout) = self.call_timeout {
            if call_timeout.as_millis() < 10 {
                errors.push("Call timeout too short (minimum: 10ms)".to_string());
            }
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum reassembled packet size in bytes
    pub max_packet_size: usize,

    /// Disable Nagle's algorithm on TCP channels
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_packet_size == 0 {
            errors.push("Max packet size cannot be 0".to_string());
        } else if self.max_packet_size < 1024 {
            errors.push("Max packet size too small (minimum: 1 KB)".to_string());
        } else if self.max_packet_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max packet size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_packet_size
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("rpc-runtime"),
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
                if let Some(parent) = std::path::Path::new(path).parent() {
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

/// Optional durations, as milliseconds
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
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
