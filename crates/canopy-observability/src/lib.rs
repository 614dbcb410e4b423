//! Canopy Observability
//!
//! Logging and metrics for the gateway: a reloadable `tracing` subscriber, a
//! Prometheus recorder and the recorder helpers the gateway calls on its hot paths.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{Config, LoggingConfig, MetricsConfig};
pub use error::{ObservabilityError, Result};
pub use logging::{create_connection_span, create_request_span, LogManager};
pub use crate::metrics::{GatewayMetrics, MetricsCollector, PipelineMetrics, QueueMetrics, SessionMetrics};

use std::sync::Arc;

/// Installed logging and metrics, kept alive for the life of the process
#[derive(Debug, Clone)]
pub struct Observability {
    log_manager: Arc<LogManager>,
    metrics: Arc<MetricsCollector>,
}

impl Observability {
    /// Install the global subscriber and recorder
    pub fn init(config: &Config) -> Result<Self> {
        let log_manager = Arc::new(LogManager::init(&config.logging)?);
        let metrics = Arc::new(MetricsCollector::init(&config.metrics)?);
        Ok(Self {
            log_manager,
            metrics,
        })
    }

    pub fn log_manager(&self) -> Arc<LogManager> {
        Arc::clone(&self.log_manager)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }
}

/// Common imports
pub mod prelude {
    pub use crate::{Config, Observability, Result};
    pub use tracing::{debug, error, info, instrument, trace, warn, Span};
}
