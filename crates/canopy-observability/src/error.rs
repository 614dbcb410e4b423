//! Observability error type

/// Errors raised while installing logging or metrics
#[derive(Debug, thiserror::Error, Clone)]
pub enum ObservabilityError {
    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Subscriber or filter failure
    #[error("Logging error: {message}")]
    Logging { message: String },

    /// Recorder failure
    #[error("Metrics error: {message}")]
    Metrics { message: String },

    /// IO error
    #[error("IO error: {message}")]
    Io { message: String },
}

impl ObservabilityError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }

    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics {
            message: message.into(),
        }
    }

    /// Short category name, used as a log field
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Logging { .. } => "logging",
            Self::Metrics { .. } => "metrics",
            Self::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for ObservabilityError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Result alias for this crate
pub type Result<T> = std::result::Result<T, ObservabilityError>;
