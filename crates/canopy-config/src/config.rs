use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// On-disk gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            gateway: GatewayConfig::default(),
            queue: QueueConfig::default(),
            session: SessionConfig::default(),
            processor: ProcessorConfig::default(),
            status: StatusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Read a value by dotted key, e.g. `queue.max_queue_size`
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["gateway", "bind"] => Some(self.gateway.bind.clone()),
            ["gateway", "max_connections"] => Some(self.gateway.max_connections.to_string()),
            ["gateway", "max_sessions"] => Some(self.gateway.max_sessions.to_string()),
            ["gateway", "close_grace_ms"] => Some(self.gateway.close_grace_ms.to_string()),
            ["gateway", "handshake_timeout_ms"] => {
                Some(self.gateway.handshake_timeout_ms.to_string())
            }
            ["queue", "max_queue_size"] => Some(self.queue.max_queue_size.to_string()),
            ["queue", "warning_ratio"] => Some(self.queue.warning_ratio.to_string()),
            ["queue", "critical_ratio"] => Some(self.queue.critical_ratio.to_string()),
            ["session", "grace_ttl_secs"] => Some(self.session.grace_ttl_secs.to_string()),
            ["session", "cleanup_interval_secs"] => {
                Some(self.session.cleanup_interval_secs.to_string())
            }
            ["session", "max_inflight_per_session"] => {
                Some(self.session.max_inflight_per_session.to_string())
            }
            ["processor", "pipeline_timeout_secs"] => {
                Some(self.processor.pipeline_timeout_secs.to_string())
            }
            ["processor", "max_message_bytes"] => Some(self.processor.max_message_bytes.to_string()),
            ["status", "enabled"] => Some(self.status.enabled.to_string()),
            ["status", "bind"] => Some(self.status.bind.clone()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            ["logging", "file"] => self.logging.file.clone(),
            _ => None,
        }
    }

    /// Set a value by dotted key, parsing it to the field's type
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["gateway", "bind"] => self.gateway.bind = value.to_string(),
            ["gateway", "max_connections"] => self.gateway.max_connections = parse(key, value)?,
            ["gateway", "max_sessions"] => self.gateway.max_sessions = parse(key, value)?,
            ["gateway", "close_grace_ms"] => self.gateway.close_grace_ms = parse(key, value)?,
            ["gateway", "handshake_timeout_ms"] => {
                self.gateway.handshake_timeout_ms = parse(key, value)?
            }
            ["queue", "max_queue_size"] => self.queue.max_queue_size = parse(key, value)?,
            ["queue", "warning_ratio"] => self.queue.warning_ratio = parse(key, value)?,
            ["queue", "critical_ratio"] => self.queue.critical_ratio = parse(key, value)?,
            ["session", "grace_ttl_secs"] => self.session.grace_ttl_secs = parse(key, value)?,
            ["session", "cleanup_interval_secs"] => {
                self.session.cleanup_interval_secs = parse(key, value)?
            }
            ["session", "max_inflight_per_session"] => {
                self.session.max_inflight_per_session = parse(key, value)?
            }
            ["processor", "pipeline_timeout_secs"] => {
                self.processor.pipeline_timeout_secs = parse(key, value)?
            }
            ["processor", "max_message_bytes"] => {
                self.processor.max_message_bytes = parse(key, value)?
            }
            ["status", "enabled"] => self.status.enabled = parse(key, value)?,
            ["status", "bind"] => self.status.bind = value.to_string(),
            ["logging", "level"] => self.logging.level = value.parse()?,
            ["logging", "json_format"] => self.logging.json_format = parse(key, value)?,
            ["logging", "file"] => {
                self.logging.file = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid value for {}: {}", key, value)))
}

/// Listener and capacity limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket listen address (e.g. "127.0.0.1:18790")
    pub bind: String,
    /// Concurrently attached connections
    pub max_connections: usize,
    /// Live sessions held by the registry
    pub max_sessions: usize,
    /// How long an explicit close waits for queued terminal messages
    pub close_grace_ms: u64,
    /// Time a client gets to complete the WebSocket upgrade
    pub handshake_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
            max_connections: 1000,
            max_sessions: 10_000,
            close_grace_ms: 2000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Per-session outbound queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            warning_ratio: 0.5,
            critical_ratio: 0.8,
        }
    }
}

/// Session lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Disconnected sessions older than this are reaped
    pub grace_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_inflight_per_session: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_ttl_secs: 300,
            cleanup_interval_secs: 60,
            max_inflight_per_session: 4,
        }
    }
}

impl SessionConfig {
    pub fn grace_ttl(&self) -> Duration {
        Duration::from_secs(self.grace_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Inbound message processing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub pipeline_timeout_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout_secs: 120,
            max_message_bytes: 65_536,
        }
    }
}

impl ProcessorConfig {
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }
}

/// Operator HTTP endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:18791".to_string(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json_format: bool,
    /// Optional log file; `~` expands to the home directory
    pub file: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Check a listen address parses as `host:port`
pub(crate) fn check_bind(key: &str, bind: &str) -> ConfigResult<()> {
    bind.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|e| ConfigError::Validation(format!("{} '{}' is not a socket address: {}", key, bind, e)))
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
