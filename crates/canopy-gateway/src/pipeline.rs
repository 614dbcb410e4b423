//! Agent pipeline boundary
//!
//! The gateway does not produce content itself. An [`AgentPipeline`] takes the
//! accumulated conversation and yields a finite stream of chunks; the last chunk is the
//! answer, everything before it is progress.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::session::{ContextEntry, Role};

/// Stream of content chunks from a pipeline
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, PipelineError>> + Send>>;

/// Pipeline errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Pipeline timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl PipelineError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Everything a pipeline is given for one inbound message
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    pub request_id: String,
    /// Conversation so far, including the user turn being answered
    pub context: Vec<ContextEntry>,
}

impl PipelineRequest {
    /// Content of the most recent user turn
    pub fn last_user_message(&self) -> Option<&str> {
        self.context
            .iter()
            .rev()
            .find(|entry| entry.role == Role::User)
            .map(|entry| entry.content.as_str())
    }
}

/// External agent/model backend
#[async_trait]
pub trait AgentPipeline: Send + Sync {
    /// Pipeline name for logs and metrics
    fn name(&self) -> &str;

    /// Start generating a reply
    async fn stream(&self, request: PipelineRequest) -> Result<ChunkStream, PipelineError>;
}

/// Streams the last user message back, one more word per chunk
#[derive(Debug, Clone, Default)]
pub struct EchoPipeline {
    delay: Duration,
}

impl EchoPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between chunks
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AgentPipeline for EchoPipeline {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, request: PipelineRequest) -> Result<ChunkStream, PipelineError> {
        let text = request
            .last_user_message()
            .ok_or_else(|| PipelineError::Rejected("no user message in context".to_string()))?
            .to_string();

        let words: Vec<&str> = text.split_whitespace().collect();
        let prefixes: Vec<String> = (1..=words.len()).map(|n| words[..n].join(" ")).collect();
        let delay = self.delay;

        let stream = futures::stream::iter(prefixes).then(move |prefix| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, PipelineError>(prefix)
        });

        Ok(Box::pin(stream))
    }
}
