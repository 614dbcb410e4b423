//! Operator HTTP endpoints: health, registry status, Prometheus metrics and the
//! runtime log level

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use canopy_gateway::{Gateway, GatewayError};
use canopy_observability::{LogManager, MetricsCollector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

/// Shared state of the status endpoints
#[derive(Clone)]
pub struct StatusState {
    pub gateway: Gateway,
    pub metrics: Arc<MetricsCollector>,
    /// Present when this process installed the global subscriber
    pub log_manager: Option<Arc<LogManager>>,
}

impl StatusState {
    pub fn new(gateway: Gateway, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            gateway,
            metrics,
            log_manager: None,
        }
    }

    pub fn with_log_manager(mut self, log_manager: Arc<LogManager>) -> Self {
        self.log_manager = Some(log_manager);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct LogLevelRequest {
    /// Filter directive, e.g. `debug` or `info,canopy_gateway=trace`
    pub level: String,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(summary_handler))
        .route("/status/:tenant_id/:session_id", get(session_status_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/log-level",
            get(log_level_handler).put(update_log_level_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve the status endpoints on `bind` until the gateway shuts down
pub async fn serve_status(bind: &str, state: StatusState) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid status address {}: {}", bind, e))?;
    let shutdown = state.gateway.shutdown_token();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Status endpoints listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let registry = state.gateway.registry();
    let shutting_down = registry.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if shutting_down { "shutting_down" } else { "healthy" },
            "sessions": registry.session_count(),
            "attached_connections": registry.attached_count(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn summary_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    Json(state.gateway.registry().summary())
}

async fn session_status_handler(
    State(state): State<Arc<StatusState>>,
    Path((tenant_id, session_id)): Path<(String, String)>,
) -> Response {
    match state.gateway.registry().status(&session_id, &tenant_id) {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            let status = match &e {
                GatewayError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
                GatewayError::TenantIsolationViolation { .. } => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        session_id = %session_id,
                        "Status lookup crossed tenants"
                    );
                    StatusCode::FORBIDDEN
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let body = ErrorResponse {
                error: e.to_string(),
                code: e.code().to_string(),
            };
            (status, Json(body)).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn log_level_handler(State(state): State<Arc<StatusState>>) -> Response {
    match &state.log_manager {
        Some(manager) => Json(json!({ "level": manager.level() })).into_response(),
        None => log_reload_unavailable(),
    }
}

async fn update_log_level_handler(
    State(state): State<Arc<StatusState>>,
    Json(request): Json<LogLevelRequest>,
) -> Response {
    let Some(manager) = &state.log_manager else {
        return log_reload_unavailable();
    };
    match manager.update_level(&request.level) {
        Ok(()) => Json(json!({ "level": manager.level() })).into_response(),
        Err(e) => {
            tracing::warn!(level = %request.level, error = %e, "Rejected log level update");
            let body = ErrorResponse {
                error: e.to_string(),
                code: "INVALID_LOG_LEVEL".to_string(),
            };
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}

fn log_reload_unavailable() -> Response {
    let body = ErrorResponse {
        error: "log level reload is not available in this process".to_string(),
        code: "LOG_RELOAD_UNAVAILABLE".to_string(),
    };
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}
