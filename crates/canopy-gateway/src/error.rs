//! Gateway error types
//!
//! One enum for everything the facade, registry and processor can report, plus the
//! narrower transport error raised by [`Connection`](crate::connection::Connection).

use crate::pipeline::PipelineError;

/// Transport-level errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Gateway-related errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A call named a session that only exists under another tenant.
    #[error("Tenant isolation violation: session {session_id} is not visible to tenant {tenant_id}")]
    TenantIsolationViolation {
        tenant_id: String,
        session_id: String,
    },

    #[error("Session not found: {tenant_id}/{session_id}")]
    SessionNotFound {
        tenant_id: String,
        session_id: String,
    },

    #[error("Session {session_id} is owned by another user")]
    AccessDenied { session_id: String, user_id: String },

    #[error("Connection broken: {0}")]
    ConnectionBroken(#[from] ConnectionError),

    #[error("Intermediate message {sequence} dropped for session {session_id}")]
    IntermediateDropped { session_id: String, sequence: u64 },

    #[error("Pipeline failure: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },

    #[error("Session limit reached ({limit})")]
    SessionLimit { limit: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl GatewayError {
    pub fn not_found(tenant_id: &str, session_id: &str) -> Self {
        Self::SessionNotFound {
            tenant_id: tenant_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn isolation(tenant_id: &str, session_id: &str) -> Self {
        Self::TenantIsolationViolation {
            tenant_id: tenant_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// Stable error code carried in outbound `error` events
    pub fn code(&self) -> &'static str {
        match self {
            Self::TenantIsolationViolation { .. } => "TENANT_ISOLATION_VIOLATION",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::AccessDenied { .. } => "ACCESS_DENIED",
            Self::ConnectionBroken(_) => "CONNECTION_BROKEN",
            Self::IntermediateDropped { .. } => "INTERMEDIATE_DROPPED",
            Self::Pipeline(PipelineError::Timeout(_)) => "PIPELINE_TIMEOUT",
            Self::Pipeline(_) => "PIPELINE_FAILURE",
            Self::ConnectionLimit { .. } | Self::SessionLimit { .. } => "CAPACITY_EXCEEDED",
            Self::InvalidMessage(_) | Self::Json(_) => "INVALID_MESSAGE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Io(_) | Self::AddrParse(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionBroken(_)
                | Self::IntermediateDropped { .. }
                | Self::Pipeline(_)
                | Self::ConnectionLimit { .. }
                | Self::SessionLimit { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
