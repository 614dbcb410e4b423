pub mod config;
pub mod manager;

pub use config::{
    Config, ConfigError, ConfigResult, GatewayConfig, LogLevel, LoggingConfig, ProcessorConfig,
    QueueConfig, SessionConfig, StatusConfig,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// `~/.canopy`
pub fn canopy_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".canopy"))
}

pub fn default_config_path() -> Option<PathBuf> {
    canopy_dir().map(|dir| dir.join("config.json"))
}

pub fn default_log_path() -> Option<PathBuf> {
    canopy_dir().map(|dir| dir.join("logs").join("canopy.log"))
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}
