//! Mapping from the on-disk configuration to runtime settings

use std::path::PathBuf;

use canopy_config::{Config, ConfigManager, ConfigResult};
use canopy_gateway::{GatewayConfig, ProcessorConfig, QueueConfig, RegistryConfig};

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub status_bind: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
    pub max_queue_size: Option<usize>,
}

/// Apply `overrides` through the dotted-key setters and re-validate
pub fn apply_overrides(config: &mut Config, overrides: &Overrides) -> ConfigResult<()> {
    if let Some(bind) = &overrides.bind {
        config.set_value("gateway.bind", bind)?;
    }
    if let Some(bind) = &overrides.status_bind {
        config.set_value("status.bind", bind)?;
    }
    if let Some(level) = &overrides.log_level {
        config.set_value("logging.level", level)?;
    }
    if overrides.json_logs {
        config.logging.json_format = true;
    }
    if let Some(size) = overrides.max_queue_size {
        config.set_value("queue.max_queue_size", &size.to_string())?;
    }
    ConfigManager::validate(config)
}

pub fn gateway_config(config: &Config) -> GatewayConfig {
    GatewayConfig {
        registry: RegistryConfig {
            max_sessions: config.gateway.max_sessions,
            max_connections: config.gateway.max_connections,
            grace_ttl: config.session.grace_ttl(),
            cleanup_interval: config.session.cleanup_interval(),
            queue: QueueConfig {
                max_queue_size: config.queue.max_queue_size,
                warning_ratio: config.queue.warning_ratio,
                critical_ratio: config.queue.critical_ratio,
                ..QueueConfig::default()
            },
            max_inflight_per_session: config.session.max_inflight_per_session,
        },
        processor: ProcessorConfig {
            pipeline_timeout: config.processor.pipeline_timeout(),
            max_message_bytes: config.processor.max_message_bytes,
        },
        close_grace: config.gateway.close_grace(),
        handshake_timeout: config.gateway.handshake_timeout(),
    }
}

pub fn observability_config(config: &Config) -> canopy_observability::Config {
    let mut observability = canopy_observability::Config::default()
        .with_log_level(config.logging.level.as_str())
        .with_json_format(config.logging.json_format)
        .with_metrics_enabled(config.status.enabled);
    if let Some(file) = &config.logging.file {
        let path = canopy_config::expand_tilde(file).unwrap_or_else(|| PathBuf::from(file));
        observability = observability.with_log_file(path);
    }
    observability
}
