//! Metrics collection
//!
//! `MetricsCollector` installs the process-wide recorder. The recorder helpers
//! below are thin wrappers over the `metrics` macros, so they are no-ops until a
//! recorder is installed.

use std::time::Duration;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;
#[cfg(feature = "prometheus")]
use crate::error::ObservabilityError;
use crate::error::Result;

pub const CONNECTIONS_OPENED: &str = "canopy_connections_opened_total";
pub const CONNECTIONS_CLOSED: &str = "canopy_connections_closed_total";
pub const CONNECTIONS_REJECTED: &str = "canopy_connections_rejected_total";
pub const CONNECTIONS_ATTACHED: &str = "canopy_connections_attached";
pub const MESSAGES_ENQUEUED: &str = "canopy_messages_enqueued_total";
pub const MESSAGES_SENT: &str = "canopy_messages_sent_total";
pub const MESSAGES_DROPPED: &str = "canopy_messages_dropped_total";
pub const QUEUE_STATUS_CHANGES: &str = "canopy_queue_status_changes_total";
pub const SESSIONS_CREATED: &str = "canopy_sessions_created_total";
pub const SESSIONS_RESUMED: &str = "canopy_sessions_resumed_total";
pub const SESSIONS_CLOSED: &str = "canopy_sessions_closed_total";
pub const SESSIONS_SWEPT: &str = "canopy_sessions_swept_total";
pub const SESSIONS_LIVE: &str = "canopy_sessions_live";
pub const PIPELINE_DURATION: &str = "canopy_pipeline_duration_seconds";
pub const PIPELINE_FAILURES: &str = "canopy_pipeline_failures_total";

/// Holds the Prometheus handle used to render the exposition text
pub struct MetricsCollector {
    #[cfg(feature = "prometheus")]
    handle: Option<PrometheusHandle>,
    config: MetricsConfig,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl MetricsCollector {
    /// Install the global recorder (when enabled) and describe every gateway metric
    pub fn init(config: &MetricsConfig) -> Result<Self> {
        let mut collector = Self::disabled();
        collector.config = config.clone();
        if !config.enabled {
            return Ok(collector);
        }

        #[cfg(feature = "prometheus")]
        {
            let mut builder = PrometheusBuilder::new();
            for (key, value) in &config.global_labels {
                builder = builder.add_global_label(key, value);
            }
            let recorder = builder.build_recorder();
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|e| {
                ObservabilityError::metrics(format!("Failed to set global recorder: {}", e))
            })?;
            collector.handle = Some(handle);
        }

        register_descriptions();
        tracing::info!(target: "canopy_observability", "Metrics collector initialized");
        Ok(collector)
    }

    /// A collector that records nothing and renders an empty body
    pub fn disabled() -> Self {
        Self {
            #[cfg(feature = "prometheus")]
            handle: None,
            config: MetricsConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    pub fn is_installed(&self) -> bool {
        #[cfg(feature = "prometheus")]
        {
            self.handle.is_some()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            false
        }
    }

    /// Prometheus text exposition of every recorded series
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

fn register_descriptions() {
    describe_counter!(CONNECTIONS_OPENED, Unit::Count, "Connections accepted by the gateway");
    describe_counter!(CONNECTIONS_CLOSED, Unit::Count, "Connections torn down");
    describe_counter!(
        CONNECTIONS_REJECTED,
        Unit::Count,
        "Connections refused at attach, by error code"
    );
    describe_gauge!(CONNECTIONS_ATTACHED, Unit::Count, "Connections currently attached to a session");
    describe_counter!(MESSAGES_ENQUEUED, Unit::Count, "Outbound messages enqueued, by kind");
    describe_counter!(MESSAGES_SENT, Unit::Count, "Outbound messages written to a client");
    describe_counter!(MESSAGES_DROPPED, Unit::Count, "Outbound messages dropped, by reason");
    describe_counter!(QUEUE_STATUS_CHANGES, Unit::Count, "Queue status transitions, by new status");
    describe_counter!(SESSIONS_CREATED, Unit::Count, "Sessions created");
    describe_counter!(SESSIONS_RESUMED, Unit::Count, "Disconnected sessions resumed");
    describe_counter!(SESSIONS_CLOSED, Unit::Count, "Sessions closed");
    describe_counter!(SESSIONS_SWEPT, Unit::Count, "Sessions reaped by the cleanup sweep");
    describe_gauge!(SESSIONS_LIVE, Unit::Count, "Sessions held by the registry");
    describe_histogram!(PIPELINE_DURATION, Unit::Seconds, "Agent pipeline run time, by pipeline");
    describe_counter!(PIPELINE_FAILURES, Unit::Count, "Failed requests, by error code");
}

/// Connection lifecycle recorder
pub struct GatewayMetrics;

impl GatewayMetrics {
    pub fn connection_opened() {
        metrics::counter!(CONNECTIONS_OPENED).increment(1);
    }

    pub fn connection_closed() {
        metrics::counter!(CONNECTIONS_CLOSED).increment(1);
    }

    pub fn connection_rejected(code: &str) {
        metrics::counter!(CONNECTIONS_REJECTED, "code" => code.to_string()).increment(1);
    }

    pub fn set_attached(count: usize) {
        metrics::gauge!(CONNECTIONS_ATTACHED).set(count as f64);
    }
}

/// Outbound queue recorder
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn enqueued(kind: &str) {
        metrics::counter!(MESSAGES_ENQUEUED, "kind" => kind.to_string()).increment(1);
    }

    pub fn sent() {
        metrics::counter!(MESSAGES_SENT).increment(1);
    }

    /// `count` messages dropped for `reason` (overflow, evicted, detached, closed, send_failed)
    pub fn dropped(reason: &str, count: u64) {
        if count == 0 {
            return;
        }
        metrics::counter!(MESSAGES_DROPPED, "reason" => reason.to_string()).increment(count);
    }

    pub fn status_changed(status: &str) {
        metrics::counter!(QUEUE_STATUS_CHANGES, "status" => status.to_string()).increment(1);
    }
}

/// Session registry recorder
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn created() {
        metrics::counter!(SESSIONS_CREATED).increment(1);
    }

    pub fn resumed() {
        metrics::counter!(SESSIONS_RESUMED).increment(1);
    }

    pub fn closed() {
        metrics::counter!(SESSIONS_CLOSED).increment(1);
    }

    pub fn swept(count: usize) {
        metrics::counter!(SESSIONS_SWEPT).increment(count as u64);
    }

    pub fn set_live(count: usize) {
        metrics::gauge!(SESSIONS_LIVE).set(count as f64);
    }
}

/// Agent pipeline recorder
pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn completed(pipeline: &str, elapsed: Duration) {
        metrics::histogram!(PIPELINE_DURATION, "pipeline" => pipeline.to_string())
            .record(elapsed.as_secs_f64());
    }

    pub fn failed(code: &str) {
        metrics::counter!(PIPELINE_FAILURES, "code" => code.to_string()).increment(1);
    }
}
