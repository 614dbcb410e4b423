//! Wire protocol definitions
//!
//! Defines the frames exchanged between clients and the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames sent from client to gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// User message for the agent pipeline
    Message {
        /// Client-chosen request id, echoed on every reply
        #[serde(default)]
        id: Option<String>,
        content: String,
        /// Optional explicit target; must match the connection's session
        #[serde(default)]
        session_id: Option<String>,
        /// Optional explicit tenant; must match the connection's tenant
        #[serde(default)]
        tenant_id: Option<String>,
    },
    /// Heartbeat ping
    Ping {
        timestamp: i64,
    },
    /// End the session for good (as opposed to just disconnecting)
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Events delivered from gateway to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Session bound to this connection
    Connected { session_id: String, resumed: bool },
    /// Incremental pipeline output
    Progress { content: String },
    /// Final pipeline output
    Answer { content: String },
    Error { code: String, message: String },
    Pong { timestamp: i64 },
    SessionEnded { session_id: String, reason: String },
}

impl GatewayEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Delivery class of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Supersedable progress update
    Intermediate,
    /// Terminal answer to one inbound message
    Final,
    /// Out-of-band notice (pong, connected, session end)
    Urgent,
    /// Terminal failure of one inbound message
    Error,
}

impl MessageKind {
    /// Kinds that may evict an intermediate and are never dropped for lack of room
    pub fn is_priority(&self) -> bool {
        !matches!(self, MessageKind::Intermediate)
    }

    /// Kinds that end the reply to an inbound message
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageKind::Final | MessageKind::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Intermediate => "intermediate",
            MessageKind::Final => "final",
            MessageKind::Urgent => "urgent",
            MessageKind::Error => "error",
        }
    }
}

/// One message queued for a client.
///
/// `sequence` and `enqueued_at` are stamped by the queue at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub event: GatewayEvent,
}

impl OutboundMessage {
    pub fn new(kind: MessageKind, request_id: Option<String>, event: GatewayEvent) -> Self {
        Self {
            kind,
            sequence: 0,
            request_id,
            enqueued_at: Utc::now(),
            event,
        }
    }

    pub fn intermediate(request_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Intermediate,
            Some(request_id.into()),
            GatewayEvent::Progress {
                content: content.into(),
            },
        )
    }

    pub fn final_answer(request_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Final,
            Some(request_id.into()),
            GatewayEvent::Answer {
                content: content.into(),
            },
        )
    }

    pub fn error(
        request_id: Option<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Error, request_id, GatewayEvent::error(code, message))
    }

    pub fn urgent(event: GatewayEvent) -> Self {
        Self::new(MessageKind::Urgent, None, event)
    }

    /// Serialize for the transport
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An inbound user message after frame decoding
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub content: String,
    pub session_id: Option<String>,
    pub tenant_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            session_id: None,
            tenant_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_target(mut self, tenant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self.session_id = Some(session_id.into());
        self
    }
}
