//! Structured logging
//!
//! Installs a `tracing` subscriber with a reloadable level filter, plain or JSON
//! output on stdout and an optional daily-rolling log file.

use std::path::Path;

use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::{Layered, SubscriberExt},
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{ObservabilityError, Result};

type ReloadHandle = Handle<EnvFilter, Registry>;
type Base = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync + 'static>;

/// Owns the installed subscriber's reload handle and file writer guard
pub struct LogManager {
    config: Mutex<LoggingConfig>,
    reload_handle: ReloadHandle,
    // Flushes the file writer on drop.
    _file_guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("config", &*self.config.lock())
            .field("file_output", &self._file_guard.is_some())
            .finish()
    }
}

impl LogManager {
    /// Install the global subscriber
    ///
    /// Fails if the level string does not parse, the log directory cannot be
    /// created, or a global subscriber is already set.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let filter = build_filter(&config.level, config)?;
        let (filter, reload_handle) = reload::Layer::new(filter);

        let mut layers: Vec<BoxedLayer> = Vec::new();
        if config.json_format {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.include_target)
                    .with_thread_ids(config.include_thread_id)
                    .with_current_span(true)
                    .boxed(),
            );
        } else {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_target(config.include_target)
                    .with_thread_ids(config.include_thread_id)
                    .with_ansi(config.ansi_colors)
                    .boxed(),
            );
        }

        let file_guard = match &config.file {
            Some(path) => {
                let (layer, guard) = file_layer(path, config.json_format)?;
                layers.push(layer);
                Some(guard)
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(layers)
            .try_init()
            .map_err(|e| ObservabilityError::logging(format!("Failed to install subscriber: {}", e)))?;

        tracing::info!(
            target: "canopy_observability",
            level = %config.level,
            json = config.json_format,
            file = ?config.file,
            "Log manager initialized"
        );

        Ok(Self {
            config: Mutex::new(config.clone()),
            reload_handle,
            _file_guard: file_guard,
        })
    }

    /// Swap the level filter at runtime, keeping per-module directives
    pub fn update_level(&self, level: &str) -> Result<()> {
        let mut config = self.config.lock();
        let new_filter = build_filter(level, &config)?;

        self.reload_handle
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;
        config.level = level.to_string();

        tracing::info!(target: "canopy_observability", level, "Log level updated");
        Ok(())
    }

    pub fn level(&self) -> String {
        self.config.lock().level.clone()
    }
}

fn build_filter(level: &str, config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level)
        .map_err(|e| ObservabilityError::logging(format!("Invalid log level: {}", e)))?;

    for (module, module_level) in &config.module_levels {
        let directive = format!("{}={}", module, module_level)
            .parse()
            .map_err(|e| ObservabilityError::logging(format!("Invalid directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

fn file_layer(path: &Path, json: bool) -> Result<(BoxedLayer, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .ok_or_else(|| ObservabilityError::config(format!("Log file has no name: {}", path.display())))?;
    std::fs::create_dir_all(directory)?;

    let appender = tracing_appender::rolling::daily(directory, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    };
    Ok((layer, guard))
}

/// Span wrapping the handling of one inbound message
pub fn create_request_span(tenant_id: &str, session_id: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        tenant_id = %tenant_id,
        session_id = %session_id,
        request_id = %request_id,
    )
}

/// Span wrapping one client connection
pub fn create_connection_span(tenant_id: &str, session_id: &str, connection_id: &str) -> tracing::Span {
    tracing::info_span!(
        "connection",
        tenant_id = %tenant_id,
        session_id = %session_id,
        connection_id = %connection_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_with_module_levels() {
        let mut config = LoggingConfig::default();
        config
            .module_levels
            .insert("canopy_gateway::queue".to_string(), "trace".to_string());

        let filter = build_filter("warn", &config).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("warn"));
        assert!(rendered.contains("canopy_gateway::queue=trace"));
    }

    #[test]
    fn test_invalid_directive_is_rejected() {
        let mut config = LoggingConfig::default();
        config
            .module_levels
            .insert("canopy_gateway".to_string(), "loud".to_string());

        let err = build_filter("info", &config).unwrap_err();
        assert_eq!(err.category(), "logging");
    }

    #[test]
    fn test_create_spans() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let request = create_request_span("t1", "s1", "req-1");
            let meta = request.metadata().unwrap();
            assert_eq!(meta.name(), "request");
            assert!(meta.fields().field("tenant_id").is_some());
            assert!(meta.fields().field("request_id").is_some());

            let connection = create_connection_span("t1", "s1", "conn_1");
            assert_eq!(connection.metadata().unwrap().name(), "connection");
        });
    }

    // The only test in this crate that installs the global subscriber.
    #[test]
    fn test_init_and_reload() {
        let manager = LogManager::init(&LoggingConfig {
            level: "info".to_string(),
            ansi_colors: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(manager.level(), "info");

        manager.update_level("debug").unwrap();
        assert_eq!(manager.level(), "debug");
        assert!(manager.update_level("canopy=loud").is_err());
        assert_eq!(manager.level(), "debug");

        assert!(LogManager::init(&LoggingConfig::default()).is_err());
    }
}
