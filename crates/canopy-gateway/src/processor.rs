//! Message processor
//!
//! Runs one inbound message through the agent pipeline and turns the resulting chunk
//! stream into outbound messages: every chunk but the last becomes an `intermediate`,
//! the last becomes the `final`. Any failure along the way (validation, pipeline error,
//! timeout, panic) becomes a single terminal `error` message instead.
//!
//! Each inbound message is processed on its own task; nothing here holds a session lock
//! across an await.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use canopy_observability::{create_request_span, PipelineMetrics};
use futures::{FutureExt, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn, Instrument};

use crate::error::{GatewayError, Result};
use crate::pipeline::{AgentPipeline, PipelineError, PipelineRequest};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::queue::EnqueueResult;
use crate::registry::SessionRegistry;
use crate::session::{ContextEntry, SessionEntry};

/// Processor limits
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Upper bound on one pipeline run, from dispatch to the last chunk
    pub pipeline_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout: Duration::from_secs(120),
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Where processing of one inbound message got to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStage {
    Received,
    Validated,
    Dispatched,
    Streaming,
    Completed,
    Failed,
}

/// Result of processing one inbound message
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub request_id: String,
    pub stage: ProcessStage,
    /// Intermediates offered to the queue (accepted or dropped)
    pub intermediates: usize,
    /// Error code of the terminal `error` message, if one was sent
    pub error_code: Option<&'static str>,
}

struct Progress {
    stage: ProcessStage,
    intermediates: usize,
}

/// Drives inbound messages through the pipeline into session queues
pub struct MessageProcessor {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<dyn AgentPipeline>,
    config: ProcessorConfig,
}

impl MessageProcessor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pipeline: Arc<dyn AgentPipeline>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            registry,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process `inbound` on its own task.
    ///
    /// `permit` is held until processing finishes, bounding per-session concurrency.
    pub fn process(
        self: &Arc<Self>,
        session: Arc<SessionEntry>,
        inbound: InboundMessage,
        permit: Option<OwnedSemaphorePermit>,
    ) -> JoinHandle<ProcessOutcome> {
        let processor = Arc::clone(self);
        let span = create_request_span(session.tenant_id(), session.session_id(), &inbound.id);

        tokio::spawn(
            async move {
                let _permit = permit;
                let request_id = inbound.id.clone();
                match AssertUnwindSafe(processor.run(&session, inbound))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(request_id = %request_id, "Pipeline panicked");
                        let err = GatewayError::Pipeline(PipelineError::backend("pipeline panicked"));
                        processor.fail(&session, &request_id, &err);
                        ProcessOutcome {
                            request_id,
                            stage: ProcessStage::Failed,
                            intermediates: 0,
                            error_code: Some(err.code()),
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Process `inbound` on the current task
    pub async fn run(&self, session: &SessionEntry, inbound: InboundMessage) -> ProcessOutcome {
        let request_id = inbound.id.clone();
        let mut progress = Progress {
            stage: ProcessStage::Received,
            intermediates: 0,
        };
        let started = Instant::now();

        let result = self.execute(session, inbound, &mut progress).await;
        let error_code = match result {
            Ok(()) => {
                progress.stage = ProcessStage::Completed;
                PipelineMetrics::completed(self.pipeline.name(), started.elapsed());
                debug!(
                    request_id = %request_id,
                    intermediates = progress.intermediates,
                    "Request completed"
                );
                None
            }
            Err(err) => {
                progress.stage = ProcessStage::Failed;
                self.fail(session, &request_id, &err);
                Some(err.code())
            }
        };

        ProcessOutcome {
            request_id,
            stage: progress.stage,
            intermediates: progress.intermediates,
            error_code,
        }
    }

    async fn execute(
        &self,
        session: &SessionEntry,
        inbound: InboundMessage,
        progress: &mut Progress,
    ) -> Result<()> {
        self.validate(session, &inbound)?;
        progress.stage = ProcessStage::Validated;

        let tenant_id = session.tenant_id();
        let session_id = session.session_id();
        let request_id = inbound.id;

        self.registry
            .append_context(session_id, tenant_id, ContextEntry::user(inbound.content))?;
        let context = self.registry.get_context(session_id, tenant_id)?;

        let request = PipelineRequest {
            tenant_id: tenant_id.to_string(),
            user_id: session.user_id().to_string(),
            session_id: session_id.to_string(),
            request_id: request_id.clone(),
            context,
        };

        let timeout = self.config.pipeline_timeout;
        let deadline = Instant::now() + timeout;
        let mut stream = tokio::time::timeout_at(deadline, self.pipeline.stream(request))
            .await
            .map_err(|_| PipelineError::Timeout(timeout))??;
        progress.stage = ProcessStage::Dispatched;

        // One chunk of lookahead: a chunk is only known to be intermediate once the
        // next one arrives.
        let mut held: Option<String> = None;
        loop {
            let next = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| PipelineError::Timeout(timeout));
            let next = match next {
                Ok(next) => next,
                Err(e) => {
                    self.flush_held(session, &request_id, &mut held, progress);
                    return Err(e.into());
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Some(previous) = held.replace(chunk) {
                        self.emit_intermediate(session, &request_id, previous, progress);
                    }
                }
                Some(Err(e)) => {
                    self.flush_held(session, &request_id, &mut held, progress);
                    return Err(e.into());
                }
                None => break,
            }
        }

        let answer = held.unwrap_or_default();
        self.registry
            .append_context(session_id, tenant_id, ContextEntry::assistant(answer.clone()))?;
        session
            .queue()
            .enqueue(OutboundMessage::final_answer(request_id, answer));
        Ok(())
    }

    fn validate(&self, session: &SessionEntry, inbound: &InboundMessage) -> Result<()> {
        if let Some(claimed) = inbound.tenant_id.as_deref() {
            if claimed != session.tenant_id() {
                return Err(GatewayError::isolation(claimed, session.session_id()));
            }
        }
        if let Some(claimed) = inbound.session_id.as_deref() {
            if claimed != session.session_id() {
                return Err(GatewayError::isolation(session.tenant_id(), claimed));
            }
        }
        if inbound.content.trim().is_empty() {
            return Err(GatewayError::InvalidMessage("empty content".to_string()));
        }
        if inbound.content.len() > self.config.max_message_bytes {
            return Err(GatewayError::InvalidMessage(format!(
                "content exceeds {} bytes",
                self.config.max_message_bytes
            )));
        }
        Ok(())
    }

    fn flush_held(
        &self,
        session: &SessionEntry,
        request_id: &str,
        held: &mut Option<String>,
        progress: &mut Progress,
    ) {
        if let Some(chunk) = held.take() {
            self.emit_intermediate(session, request_id, chunk, progress);
        }
    }

    fn emit_intermediate(
        &self,
        session: &SessionEntry,
        request_id: &str,
        content: String,
        progress: &mut Progress,
    ) {
        progress.stage = ProcessStage::Streaming;
        progress.intermediates += 1;
        let result = session
            .queue()
            .enqueue(OutboundMessage::intermediate(request_id, content));
        if let EnqueueResult::Dropped { sequence } = result {
            let err = GatewayError::IntermediateDropped {
                session_id: session.session_id().to_string(),
                sequence,
            };
            debug!(request_id, error = %err, "Progress update dropped");
        }
    }

    /// Enqueue the terminal error message for `request_id`
    fn fail(&self, session: &SessionEntry, request_id: &str, err: &GatewayError) {
        let code = err.code();
        match err {
            GatewayError::TenantIsolationViolation { .. } => {
                warn!(request_id, code, error = %err, "Inbound message crossed tenant boundary")
            }
            GatewayError::InvalidMessage(_) => {
                debug!(request_id, code, error = %err, "Inbound message rejected")
            }
            _ => warn!(request_id, code, error = %err, "Request failed"),
        }
        PipelineMetrics::failed(code);
        session.queue().enqueue(OutboundMessage::error(
            Some(request_id.to_string()),
            code,
            err.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ChunkStream, EchoPipeline};
    use crate::protocol::{GatewayEvent, MessageKind};
    use crate::queue::Delivery;
    use crate::registry::RegistryConfig;
    use async_trait::async_trait;

    struct FailingPipeline {
        chunks: Vec<&'static str>,
    }

    #[async_trait]
    impl AgentPipeline for FailingPipeline {
        fn name(&self) -> &str {
            "failing"
        }

        async fn stream(&self, _request: PipelineRequest) -> std::result::Result<ChunkStream, PipelineError> {
            let mut items: Vec<std::result::Result<String, PipelineError>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            items.push(Err(PipelineError::backend("model crashed")));
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    struct StallingPipeline;

    #[async_trait]
    impl AgentPipeline for StallingPipeline {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn stream(&self, _request: PipelineRequest) -> std::result::Result<ChunkStream, PipelineError> {
            Ok(Box::pin(futures::stream::pending::<
                std::result::Result<String, PipelineError>,
            >()))
        }
    }

    struct PanickingPipeline;

    #[async_trait]
    impl AgentPipeline for PanickingPipeline {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn stream(&self, _request: PipelineRequest) -> std::result::Result<ChunkStream, PipelineError> {
            panic!("backend bug");
        }
    }

    fn setup(pipeline: Arc<dyn AgentPipeline>, config: ProcessorConfig) -> (Arc<MessageProcessor>, Arc<SessionEntry>) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let (session, _) = registry.create_or_get("s1", "t1", "u1").unwrap();
        session.queue().attach();
        let processor = Arc::new(MessageProcessor::new(registry, pipeline, config));
        (processor, session)
    }

    fn drain(session: &SessionEntry) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Some(msg) = futures::FutureExt::now_or_never(session.queue().next_message()).flatten() {
            session.queue().complete(Delivery::Sent);
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_streams_intermediates_then_final() {
        let (processor, session) = setup(Arc::new(EchoPipeline::new()), ProcessorConfig::default());

        let outcome = processor
            .run(&session, InboundMessage::new("one two three").with_id("r1"))
            .await;
        assert_eq!(outcome.stage, ProcessStage::Completed);
        assert_eq!(outcome.intermediates, 2);

        let messages = drain(&session);
        let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::Intermediate, MessageKind::Intermediate, MessageKind::Final]
        );
        assert_eq!(
            messages[2].event,
            GatewayEvent::Answer {
                content: "one two three".to_string()
            }
        );

        let context = processor.registry.get_context("s1", "t1").unwrap();
        assert_eq!(context.len(), 2);
        assert_eq!(context[1].role, crate::session::Role::Assistant);
        assert_eq!(context[1].content, "one two three");
    }

    #[tokio::test]
    async fn test_midstream_failure_yields_single_terminal_error() {
        let pipeline = Arc::new(FailingPipeline { chunks: vec!["a", "b"] });
        let (processor, session) = setup(pipeline, ProcessorConfig::default());

        let outcome = processor.run(&session, InboundMessage::new("hi").with_id("r1")).await;
        assert_eq!(outcome.stage, ProcessStage::Failed);
        assert_eq!(outcome.error_code, Some("PIPELINE_FAILURE"));

        let kinds: Vec<MessageKind> = drain(&session).iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::Intermediate, MessageKind::Intermediate, MessageKind::Error]
        );
    }

    #[tokio::test]
    async fn test_tenant_mismatch_is_never_dispatched() {
        let (processor, session) = setup(Arc::new(EchoPipeline::new()), ProcessorConfig::default());

        let inbound = InboundMessage::new("hi").with_target("t2", "s1");
        let outcome = processor.run(&session, inbound).await;
        assert_eq!(outcome.error_code, Some("TENANT_ISOLATION_VIOLATION"));
        assert!(processor.registry.get_context("s1", "t1").unwrap().is_empty());

        let messages = drain(&session);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Error);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let config = ProcessorConfig {
            max_message_bytes: 4,
            ..Default::default()
        };
        let (processor, session) = setup(Arc::new(EchoPipeline::new()), config);

        let outcome = processor.run(&session, InboundMessage::new("too long")).await;
        assert_eq!(outcome.stage, ProcessStage::Failed);
        assert_eq!(outcome.error_code, Some("INVALID_MESSAGE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_timeout() {
        let config = ProcessorConfig {
            pipeline_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (processor, session) = setup(Arc::new(StallingPipeline), config);

        let outcome = processor.run(&session, InboundMessage::new("hi")).await;
        assert_eq!(outcome.error_code, Some("PIPELINE_TIMEOUT"));
        assert_eq!(drain(&session).len(), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_terminal_error() {
        let (processor, session) = setup(Arc::new(PanickingPipeline), ProcessorConfig::default());

        let outcome = processor
            .process(session.clone(), InboundMessage::new("hi").with_id("r1"), None)
            .await
            .unwrap();
        assert_eq!(outcome.stage, ProcessStage::Failed);

        let messages = drain(&session);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Error);
        assert_eq!(messages[0].request_id.as_deref(), Some("r1"));
    }
}
