//! Session state
//!
//! A session outlives any single connection. It keeps the tenant/user identity, the
//! conversation context and the outbound queue, and tracks (but does not own) the
//! connection currently attached to it.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::connection::{Connection, ConnectionId};
use crate::queue::{BackpressureQueue, QueueConfig, QueueStatus};

/// Tenant-scoped session identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.session_id)
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    /// Connected, but the outbound queue is critical or overflowing
    Backpressure,
    Disconnected,
    /// A resume is in progress
    Reconnecting,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Backpressure => "backpressure",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The connection a session currently points at
#[derive(Debug, Clone)]
pub(crate) struct AttachedConnection {
    pub id: ConnectionId,
    pub handle: Weak<Connection>,
}

/// Mutable session state, guarded by the per-session lock
#[derive(Debug)]
pub struct Session {
    pub status: SessionStatus,
    pub context: Vec<ContextEntry>,
    pub(crate) attached: Option<AttachedConnection>,
    /// Connections attached over the session's lifetime
    pub connection_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            status: SessionStatus::Connecting,
            context: Vec::new(),
            attached: None,
            connection_count: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    pub fn attached_connection_id(&self) -> Option<&ConnectionId> {
        self.attached.as_ref().map(|a| &a.id)
    }

    /// Time since last activity, measured against `now`
    pub fn idle_time(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity_at
    }

    /// Attached connection handle, if it is still alive
    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.attached.as_ref().and_then(|a| a.handle.upgrade())
    }
}

/// A registered session: identity plus its lock-guarded state and queue
#[derive(Debug)]
pub struct SessionEntry {
    key: SessionKey,
    user_id: String,
    state: Mutex<Session>,
    queue: Arc<BackpressureQueue>,
    inflight: Arc<Semaphore>,
}

impl SessionEntry {
    pub(crate) fn new(
        key: SessionKey,
        user_id: impl Into<String>,
        queue_config: QueueConfig,
        max_inflight: usize,
    ) -> Self {
        let queue = Arc::new(BackpressureQueue::new(key.session_id.clone(), queue_config));
        Self {
            key,
            user_id: user_id.into(),
            state: Mutex::new(Session::new()),
            queue,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn tenant_id(&self) -> &str {
        &self.key.tenant_id
    }

    pub fn session_id(&self) -> &str {
        &self.key.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn queue(&self) -> &Arc<BackpressureQueue> {
        &self.queue
    }

    /// Limits concurrently processed inbound messages for this session
    pub fn inflight(&self) -> &Arc<Semaphore> {
        &self.inflight
    }

    /// Lock the session state. Never hold the guard across an await point.
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Session> {
        self.state.lock()
    }

    /// Stored status, before the backpressure overlay
    pub fn raw_status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Status as reported to operators
    pub fn status(&self) -> SessionStatus {
        let status = self.raw_status();
        effective_status(status, self.queue.status())
    }

    pub fn is_closed(&self) -> bool {
        self.raw_status() == SessionStatus::Closed
    }
}

pub(crate) fn effective_status(status: SessionStatus, queue: QueueStatus) -> SessionStatus {
    if status == SessionStatus::Connected && queue >= QueueStatus::Critical {
        SessionStatus::Backpressure
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundMessage;

    #[test]
    fn test_new_entry_starts_connecting() {
        let entry = SessionEntry::new(SessionKey::new("t1", "s1"), "u1", QueueConfig::default(), 4);
        assert_eq!(entry.status(), SessionStatus::Connecting);
        assert_eq!(entry.key().to_string(), "t1/s1");
        assert!(!entry.lock().is_attached());
    }

    #[test]
    fn test_backpressure_overlay() {
        let entry = SessionEntry::new(
            SessionKey::new("t1", "s1"),
            "u1",
            QueueConfig::default().with_max_queue_size(4),
            4,
        );
        entry.lock().status = SessionStatus::Connected;
        entry.queue().attach();
        assert_eq!(entry.status(), SessionStatus::Connected);

        for _ in 0..4 {
            entry.queue().enqueue(OutboundMessage::intermediate("r1", "x"));
        }
        assert_eq!(entry.status(), SessionStatus::Backpressure);
        assert_eq!(entry.raw_status(), SessionStatus::Connected);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
    }
}
