//! Canopy Gateway - realtime session gateway
//!
//! Holds long-lived client connections, runs inbound messages through an agent
//! pipeline and streams staged replies back through a bounded per-session queue, so a
//! slow client never stalls the rest of the service.

mod connection;
mod drain;
mod error;
mod gateway;
mod pipeline;
mod processor;
mod protocol;
mod queue;
mod registry;
mod session;
mod ws;

pub use connection::{Connection, ConnectionId, Transport, TRANSPORT_CLOSE_TIMEOUT};
pub use drain::{DrainOutcome, DrainWorker};
pub use error::{ConnectionError, GatewayError, Result};
pub use gateway::{ClientIdentity, Gateway, GatewayConfig, ReceiveAction, SessionHandle};
pub use pipeline::{AgentPipeline, ChunkStream, EchoPipeline, PipelineError, PipelineRequest};
pub use processor::{MessageProcessor, ProcessOutcome, ProcessStage, ProcessorConfig};
pub use protocol::{ClientFrame, GatewayEvent, InboundMessage, MessageKind, OutboundMessage};
pub use queue::{BackpressureQueue, Delivery, EnqueueResult, QueueConfig, QueueStats, QueueStatus};
pub use registry::{
    RegistryConfig, SessionOrigin, SessionRegistry, SessionStatusReport, StatusSummary,
};
pub use session::{ContextEntry, Role, Session, SessionEntry, SessionKey, SessionStatus};
pub use ws::{WebSocketTransport, SESSION_HEADER, TENANT_HEADER, USER_HEADER};
