//! Gateway facade
//!
//! Wires accepted connections to sessions and owns the per-connection tasks: one drain
//! worker writing the session queue to the transport, one receive loop reading frames
//! and handing messages to the processor.

use std::sync::Arc;
use std::time::Duration;

use canopy_observability::{create_connection_span, GatewayMetrics};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionId, Transport};
use crate::drain::{DrainOutcome, DrainWorker};
use crate::error::{GatewayError, Result};
use crate::pipeline::AgentPipeline;
use crate::processor::{MessageProcessor, ProcessorConfig};
use crate::protocol::{ClientFrame, GatewayEvent, InboundMessage, OutboundMessage};
use crate::queue::QueueStats;
use crate::registry::{RegistryConfig, SessionOrigin, SessionRegistry};
use crate::session::{SessionEntry, SessionKey};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub registry: RegistryConfig,
    pub processor: ProcessorConfig,
    /// How long a closing session may spend flushing terminal messages
    pub close_grace: Duration,
    /// How long a client may take to finish the WebSocket upgrade
    pub handshake_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            processor: ProcessorConfig::default(),
            close_grace: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Trusted identity resolved upstream of the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub tenant_id: String,
    pub user_id: String,
}

impl ClientIdentity {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// A connection bound to a session
#[derive(Debug)]
pub struct SessionHandle {
    pub key: SessionKey,
    pub connection_id: ConnectionId,
    pub resumed: bool,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.key.session_id
    }

    /// Wait for the connection's receive loop to end
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

/// What the receive loop should do after a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveAction {
    Continue,
    /// Client asked to end the session
    CloseRequested(String),
    /// Connection went away while waiting
    Stop,
}

/// The realtime gateway
#[derive(Clone)]
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    processor: Arc<MessageProcessor>,
    shutdown: CancellationToken,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("sessions", &self.registry.session_count())
            .field("attached", &self.registry.attached_count())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Gateway {
    /// Create a new gateway around `pipeline`
    pub fn new(config: GatewayConfig, pipeline: Arc<dyn AgentPipeline>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry.clone()));
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&registry),
            pipeline,
            config.processor.clone(),
        ));
        Self {
            config,
            registry,
            processor,
            shutdown: CancellationToken::new(),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Cancelled once shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the periodic cleanup sweep
    pub fn start_background(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(self.registry.spawn_sweeper());
        }
    }

    /// Bind a new transport to a new or resumed session and start its tasks.
    ///
    /// On failure the error is sent to the client and the transport is closed.
    pub async fn on_connect(
        &self,
        transport: Arc<dyn Transport>,
        identity: ClientIdentity,
        session_id: Option<String>,
    ) -> Result<SessionHandle> {
        let connection = Arc::new(Connection::new(transport));
        GatewayMetrics::connection_opened();

        if self.shutdown.is_cancelled() {
            return Err(self.reject(&connection, GatewayError::ShuttingDown).await);
        }

        let session_id = session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("sess_{}", Uuid::new_v4()));
        let ClientIdentity { tenant_id, user_id } = identity;

        let (_, origin) = match self
            .registry
            .create_or_get(&session_id, &tenant_id, &user_id)
        {
            Ok(found) => found,
            Err(e) => return Err(self.reject(&connection, e).await),
        };

        let entry = match self.registry.attach(&session_id, &tenant_id, &connection).await {
            Ok(entry) => entry,
            Err(e) => {
                if origin == SessionOrigin::Created {
                    self.registry.abandon(&session_id, &tenant_id);
                }
                return Err(self.reject(&connection, e).await);
            }
        };

        let resumed = origin == SessionOrigin::Resumed;
        entry.queue().enqueue(OutboundMessage::urgent(GatewayEvent::Connected {
            session_id: session_id.clone(),
            resumed,
        }));

        let drain = DrainWorker::spawn(Arc::clone(entry.queue()), Arc::clone(&connection));
        let span = create_connection_span(&tenant_id, &session_id, &connection.id().to_string());
        let task = tokio::spawn(
            self.clone()
                .connection_loop(Arc::clone(&entry), Arc::clone(&connection), drain)
                .instrument(span),
        );

        info!(
            tenant_id = %tenant_id,
            session_id = %session_id,
            connection_id = %connection.id(),
            resumed,
            "Client connected"
        );

        Ok(SessionHandle {
            key: entry.key().clone(),
            connection_id: connection.id().clone(),
            resumed,
            task,
        })
    }

    /// Send the error straight to the transport and close it
    async fn reject(&self, connection: &Connection, err: GatewayError) -> GatewayError {
        GatewayMetrics::connection_rejected(err.code());
        warn!(connection_id = %connection.id(), error = %err, "Connection rejected");
        match OutboundMessage::error(None, err.code(), err.to_string()).to_frame() {
            Ok(frame) => {
                if let Err(e) = connection.send(frame).await {
                    debug!(connection_id = %connection.id(), error = %e, "Failed to deliver rejection");
                }
            }
            Err(e) => debug!(error = %e, "Failed to encode rejection"),
        }
        connection.close().await;
        GatewayMetrics::connection_closed();
        err
    }

    async fn connection_loop(
        self,
        entry: Arc<SessionEntry>,
        connection: Arc<Connection>,
        mut drain: JoinHandle<DrainOutcome>,
    ) {
        let connection_id = connection.id().clone();
        loop {
            tokio::select! {
                biased;
                _ = connection.closed() => {
                    debug!(connection_id = %connection_id, "Connection closed or broken");
                    break;
                }
                outcome = &mut drain => {
                    match outcome {
                        Ok(DrainOutcome::ConnectionBroken(e)) => {
                            warn!(connection_id = %connection_id, error = %e, "Connection broken");
                        }
                        Ok(outcome) => {
                            debug!(connection_id = %connection_id, ?outcome, "Drain worker finished");
                        }
                        Err(e) => {
                            warn!(connection_id = %connection_id, error = %e, "Drain worker failed");
                        }
                    }
                    break;
                }
                frame = connection.receive() => match frame {
                    Some(Ok(raw)) => match self.on_receive(&entry, &connection, raw).await {
                        ReceiveAction::Continue => {}
                        ReceiveAction::CloseRequested(reason) => {
                            if let Err(e) = self.finish_session(&entry, Some(&connection), reason).await {
                                debug!(connection_id = %connection_id, error = %e, "Session already gone");
                            }
                            break;
                        }
                        ReceiveAction::Stop => break,
                    },
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "Receive failed");
                        break;
                    }
                    None => {
                        debug!(connection_id = %connection_id, "Peer closed connection");
                        break;
                    }
                },
            }
        }

        self.on_disconnect(&entry, &connection).await;
    }

    /// Handle one raw inbound frame
    pub async fn on_receive(
        &self,
        entry: &Arc<SessionEntry>,
        connection: &Connection,
        raw: String,
    ) -> ReceiveAction {
        entry.lock().touch();

        let frame = match serde_json::from_str::<ClientFrame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                let err = GatewayError::InvalidMessage(e.to_string());
                debug!(session_id = entry.session_id(), error = %err, "Unparseable frame");
                return Self::reply(
                    entry,
                    connection,
                    OutboundMessage::urgent(GatewayEvent::error(err.code(), err.to_string())),
                )
                .await;
            }
        };

        match frame {
            ClientFrame::Message {
                id,
                content,
                session_id,
                tenant_id,
            } => {
                let mut inbound = InboundMessage::new(content);
                if let Some(id) = id {
                    inbound = inbound.with_id(id);
                }
                inbound.session_id = session_id;
                inbound.tenant_id = tenant_id;

                // Wait for an in-flight slot; this stops reading from a client that
                // outpaces its own pipeline runs.
                let permit = tokio::select! {
                    permit = Arc::clone(entry.inflight()).acquire_owned() => permit.ok(),
                    _ = connection.closed() => return ReceiveAction::Stop,
                };
                self.processor.process(Arc::clone(entry), inbound, permit);
                ReceiveAction::Continue
            }
            ClientFrame::Ping { timestamp } => {
                Self::reply(
                    entry,
                    connection,
                    OutboundMessage::urgent(GatewayEvent::Pong { timestamp }),
                )
                .await
            }
            ClientFrame::Close { reason } => {
                ReceiveAction::CloseRequested(reason.unwrap_or_else(|| "client_close".to_string()))
            }
        }
    }

    /// Enqueue a reply to a client frame once the queue has room.
    ///
    /// Stops reading from a client that sends faster than it reads.
    async fn reply(
        entry: &SessionEntry,
        connection: &Connection,
        message: OutboundMessage,
    ) -> ReceiveAction {
        tokio::select! {
            _ = entry.queue().wait_for_room() => {}
            _ = connection.closed() => return ReceiveAction::Stop,
        }
        entry.queue().enqueue(message);
        ReceiveAction::Continue
    }

    /// Tear down one connection. The session stays for a later resume.
    pub async fn on_disconnect(&self, entry: &SessionEntry, connection: &Connection) {
        connection.close().await;
        GatewayMetrics::connection_closed();
        match self
            .registry
            .detach_connection(entry.session_id(), entry.tenant_id(), connection.id())
        {
            Ok(true) => info!(
                tenant_id = entry.tenant_id(),
                session_id = entry.session_id(),
                connection_id = %connection.id(),
                "Client disconnected"
            ),
            Ok(false) => debug!(
                session_id = entry.session_id(),
                connection_id = %connection.id(),
                "Superseded connection finished"
            ),
            Err(e) => debug!(
                session_id = entry.session_id(),
                connection_id = %connection.id(),
                error = %e,
                "Session closed before disconnect"
            ),
        }
    }

    /// End a session for good. Returns its final queue counters.
    pub async fn close_session(
        &self,
        session_id: &str,
        tenant_id: &str,
        reason: impl Into<String>,
    ) -> Result<QueueStats> {
        let entry = self.registry.get(session_id, tenant_id)?;
        let connection = entry.lock().connection();
        self.finish_session(&entry, connection.as_ref(), reason.into())
            .await
    }

    /// Announce the end, flush terminal messages within the close grace, then close
    async fn finish_session(
        &self,
        entry: &SessionEntry,
        connection: Option<&Arc<Connection>>,
        reason: String,
    ) -> Result<QueueStats> {
        let queue = entry.queue();
        queue.enqueue(OutboundMessage::urgent(GatewayEvent::SessionEnded {
            session_id: entry.session_id().to_string(),
            reason: reason.clone(),
        }));
        queue.begin_close();

        if connection.is_some()
            && tokio::time::timeout(self.config.close_grace, queue.wait_idle())
                .await
                .is_err()
        {
            warn!(
                session_id = entry.session_id(),
                pending = queue.occupancy(),
                "Close grace expired before flush"
            );
        }

        let stats = self
            .registry
            .close(entry.session_id(), entry.tenant_id())
            .await?;
        info!(
            tenant_id = entry.tenant_id(),
            session_id = entry.session_id(),
            reason = %reason,
            sent = stats.sent_count,
            dropped = stats.dropped_count,
            "Session ended"
        );
        Ok(stats)
    }

    /// Stop accepting, stop the sweeper and close every live session
    pub async fn shutdown(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        info!("Gateway shutting down");
        self.shutdown.cancel();
        self.registry.begin_shutdown();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        let sessions = self.registry.snapshot();
        let closing = sessions.iter().map(|entry| {
            let connection = entry.lock().connection();
            async move {
                self.finish_session(entry, connection.as_ref(), "shutdown".to_string())
                    .await
                    .is_ok()
            }
        });
        let closed = join_all(closing).await.into_iter().filter(|ok| *ok).count();
        info!(closed, "Gateway shutdown complete");
        closed
    }
}
