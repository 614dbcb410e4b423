//! Logging and metrics settings
//!
//! The server builds this from its own configuration file; every field has a
//! serde default so partial documents deserialize.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Observability settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    pub fn with_json_format(mut self, json: bool) -> Self {
        self.logging.json_format = json;
        self
    }

    /// Also write logs to a daily-rolling file next to `path`
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.logging.file = Some(path.into());
        self
    }

    /// Per-module level, e.g. `("canopy_gateway::queue", "debug")`
    pub fn with_module_level(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.logging.module_levels.insert(module.into(), level.into());
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics.enabled = enabled;
        self
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string (trace, debug, info, warn, error or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,

    /// Log file path; the file name becomes the rolling prefix
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub module_levels: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    #[serde(default = "default_true")]
    pub include_target: bool,

    #[serde(default)]
    pub include_thread_id: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file: None,
            module_levels: BTreeMap::new(),
            ansi_colors: true,
            include_target: true,
            include_thread_id: false,
        }
    }
}

/// Metrics recorder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Labels attached to every exported series
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = Config::default()
            .with_log_level("debug")
            .with_json_format(true)
            .with_log_file("/var/log/canopy/gateway.log")
            .with_metrics_enabled(false);

        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(
            config.logging.file,
            Some(PathBuf::from("/var/log/canopy/gateway.log"))
        );
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_module_levels() {
        let config = Config::default()
            .with_module_level("canopy_gateway::queue", "debug")
            .with_module_level("tokio_tungstenite", "warn");

        assert_eq!(
            config.logging.module_levels.get("canopy_gateway::queue"),
            Some(&"debug".to_string())
        );
        assert_eq!(config.logging.module_levels.len(), 2);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"logging": {"json_format": true}}"#).unwrap();
        assert!(config.logging.json_format);
        assert!(config.logging.ansi_colors);
        assert!(config.logging.file.is_none());
        assert!(config.metrics.enabled);
    }
}
