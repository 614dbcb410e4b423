//! Session registry
//!
//! Process-wide table of sessions keyed by `(tenant_id, session_id)`. The map is a
//! sharded `DashMap`, so inserts and removals only lock one bucket, and every session
//! carries its own lock for state changes.
//!
//! Lock order is always map shard, then session. Code holding a session lock never
//! touches the map.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canopy_observability::{GatewayMetrics, SessionMetrics};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::{GatewayError, Result};
use crate::queue::{QueueConfig, QueueStats};
use crate::session::{
    effective_status, AttachedConnection, ContextEntry, Session, SessionEntry, SessionKey,
    SessionStatus,
};

/// Registry limits and timers
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum live sessions
    pub max_sessions: usize,
    /// Maximum concurrently attached connections
    pub max_connections: usize,
    /// How long a disconnected session waits for a reconnect
    pub grace_ttl: Duration,
    pub cleanup_interval: Duration,
    pub queue: QueueConfig,
    pub max_inflight_per_session: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            max_connections: 1_000,
            grace_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            queue: QueueConfig::default(),
            max_inflight_per_session: 4,
        }
    }
}

/// Whether `create_or_get` made a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Created,
    Resumed,
}

/// Per-session operator report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusReport {
    pub tenant_id: String,
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub queue: QueueStats,
    pub connection_count: u64,
    pub connected: bool,
    pub context_len: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Registry-wide operator summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total_sessions: usize,
    pub attached_connections: usize,
    pub by_status: BTreeMap<SessionStatus, usize>,
}

/// A session that was just closed
struct Closed {
    connection: Option<Arc<Connection>>,
}

/// Tenant-scoped table of live sessions
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: DashMap<SessionKey, Arc<SessionEntry>>,
    /// session_id -> tenants holding a session with that id
    owners: DashMap<String, HashSet<String>>,
    live: AtomicUsize,
    attached: AtomicUsize,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            owners: DashMap::new(),
            live: AtomicUsize::new(0),
            attached: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live session for `(tenant_id, session_id)` or create one.
    ///
    /// A disconnected session is marked `Reconnecting` and returned as resumed. A
    /// session owned by another user of the same tenant is `AccessDenied`.
    pub fn create_or_get(
        &self,
        session_id: &str,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<(Arc<SessionEntry>, SessionOrigin)> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        let key = SessionKey::new(tenant_id, session_id);

        match self.sessions.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = Arc::clone(occupied.get());
                {
                    let mut state = existing.lock();
                    if state.status != SessionStatus::Closed {
                        if existing.user_id() != user_id {
                            warn!(
                                tenant_id,
                                session_id,
                                user_id,
                                "Resume rejected, session owned by another user"
                            );
                            return Err(GatewayError::AccessDenied {
                                session_id: session_id.to_string(),
                                user_id: user_id.to_string(),
                            });
                        }
                        if state.status == SessionStatus::Disconnected {
                            state.status = SessionStatus::Reconnecting;
                        }
                        state.touch();
                        drop(state);
                        SessionMetrics::resumed();
                        debug!(tenant_id, session_id, "Session resumed");
                        return Ok((existing, SessionOrigin::Resumed));
                    }
                }
                // Closed but not yet removed: replace in place, the live count is unchanged.
                let fresh = self.new_entry(key, user_id);
                occupied.insert(Arc::clone(&fresh));
                SessionMetrics::created();
                info!(tenant_id, session_id, user_id, "Session recreated");
                Ok((fresh, SessionOrigin::Created))
            }
            Entry::Vacant(vacant) => {
                let limit = self.config.max_sessions;
                if self
                    .live
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < limit).then_some(n + 1)
                    })
                    .is_err()
                {
                    warn!(tenant_id, session_id, limit, "Session limit reached");
                    return Err(GatewayError::SessionLimit { limit });
                }
                let fresh = self.new_entry(key, user_id);
                vacant.insert(Arc::clone(&fresh));
                self.owners
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(tenant_id.to_string());
                SessionMetrics::created();
                SessionMetrics::set_live(self.live.load(Ordering::Acquire));
                info!(tenant_id, session_id, user_id, "Session created");
                Ok((fresh, SessionOrigin::Created))
            }
        }
    }

    /// Look up a live session. Never falls back to another tenant.
    pub fn get(&self, session_id: &str, tenant_id: &str) -> Result<Arc<SessionEntry>> {
        let key = SessionKey::new(tenant_id, session_id);
        let found = self.sessions.get(&key).map(|e| Arc::clone(e.value()));
        match found {
            Some(entry) if !entry.is_closed() => Ok(entry),
            Some(_) => Err(GatewayError::not_found(tenant_id, session_id)),
            None => {
                let foreign = self
                    .owners
                    .get(session_id)
                    .map(|tenants| tenants.iter().any(|t| t != tenant_id))
                    .unwrap_or(false);
                if foreign {
                    warn!(tenant_id, session_id, "Tenant isolation violation on lookup");
                    Err(GatewayError::isolation(tenant_id, session_id))
                } else {
                    Err(GatewayError::not_found(tenant_id, session_id))
                }
            }
        }
    }

    /// Bind `connection` to the session, superseding any connection already attached
    pub async fn attach(
        &self,
        session_id: &str,
        tenant_id: &str,
        connection: &Arc<Connection>,
    ) -> Result<Arc<SessionEntry>> {
        let entry = self.get(session_id, tenant_id)?;

        let previous = {
            let mut state = entry.lock();
            if state.status == SessionStatus::Closed {
                return Err(GatewayError::not_found(tenant_id, session_id));
            }
            if state.attached.is_none() && !self.reserve_slot() {
                if state.status == SessionStatus::Reconnecting {
                    state.status = SessionStatus::Disconnected;
                }
                let limit = self.config.max_connections;
                drop(state);
                GatewayMetrics::connection_rejected("connection_limit");
                warn!(tenant_id, session_id, limit, "Connection limit reached");
                return Err(GatewayError::ConnectionLimit { limit });
            }
            let previous = state.attached.replace(AttachedConnection {
                id: connection.id().clone(),
                handle: Arc::downgrade(connection),
            });
            state.status = SessionStatus::Connected;
            state.connection_count += 1;
            state.touch();
            previous
        };

        if let Some(previous) = previous {
            info!(
                tenant_id,
                session_id,
                superseded = %previous.id,
                connection_id = %connection.id(),
                "Connection superseded"
            );
            if let Some(old) = previous.handle.upgrade() {
                old.close_in_background();
            }
        }

        entry.queue().attach();
        GatewayMetrics::set_attached(self.attached.load(Ordering::Acquire));
        debug!(tenant_id, session_id, connection_id = %connection.id(), "Connection attached");
        Ok(entry)
    }

    /// Detach whatever connection is attached. The session and its context survive.
    pub fn detach(&self, session_id: &str, tenant_id: &str) -> Result<()> {
        let entry = self.get(session_id, tenant_id)?;
        self.detach_entry(&entry, None);
        Ok(())
    }

    /// Detach only if `connection_id` is still the attached connection.
    ///
    /// Returns `false` when the connection was already superseded or detached.
    pub fn detach_connection(
        &self,
        session_id: &str,
        tenant_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<bool> {
        let entry = self.get(session_id, tenant_id)?;
        Ok(self.detach_entry(&entry, Some(connection_id)))
    }

    fn detach_entry(&self, entry: &SessionEntry, only: Option<&ConnectionId>) -> bool {
        {
            let mut state = entry.lock();
            if state.status == SessionStatus::Closed {
                return false;
            }
            if let Some(expected) = only {
                if state.attached_connection_id() != Some(expected) {
                    return false;
                }
            }
            if state.attached.take().is_some() {
                self.release_slot();
            }
            state.status = SessionStatus::Disconnected;
            state.touch();
        }

        let discarded = entry.queue().detach();
        GatewayMetrics::set_attached(self.attached.load(Ordering::Acquire));
        info!(
            tenant_id = entry.tenant_id(),
            session_id = entry.session_id(),
            discarded,
            "Session detached"
        );
        true
    }

    /// Discard a freshly created session whose first attach failed
    pub fn abandon(&self, session_id: &str, tenant_id: &str) {
        let Ok(entry) = self.get(session_id, tenant_id) else {
            return;
        };
        let unused = {
            let mut state = entry.lock();
            let unused = state.status == SessionStatus::Connecting && state.connection_count == 0;
            if unused {
                state.status = SessionStatus::Closed;
            }
            unused
        };
        if unused {
            self.remove(&entry);
            entry.queue().close();
            debug!(tenant_id, session_id, "Abandoned unused session");
        }
    }

    /// Conversation context, tenant-checked
    pub fn get_context(&self, session_id: &str, tenant_id: &str) -> Result<Vec<ContextEntry>> {
        let entry = self.get(session_id, tenant_id)?;
        let state = entry.lock();
        if state.status == SessionStatus::Closed {
            return Err(GatewayError::not_found(tenant_id, session_id));
        }
        Ok(state.context.clone())
    }

    /// Append one turn to the context. Returns the new context length.
    pub fn append_context(
        &self,
        session_id: &str,
        tenant_id: &str,
        turn: ContextEntry,
    ) -> Result<usize> {
        let entry = self.get(session_id, tenant_id)?;
        let mut state = entry.lock();
        if state.status == SessionStatus::Closed {
            return Err(GatewayError::not_found(tenant_id, session_id));
        }
        state.context.push(turn);
        state.touch();
        Ok(state.context.len())
    }

    /// Record activity on the session
    pub fn touch(&self, session_id: &str, tenant_id: &str) -> Result<()> {
        let entry = self.get(session_id, tenant_id)?;
        entry.lock().touch();
        Ok(())
    }

    /// End the session: close its connection, drop context and queue, and remove it.
    ///
    /// Returns the final queue counters.
    pub async fn close(&self, session_id: &str, tenant_id: &str) -> Result<QueueStats> {
        let entry = self.get(session_id, tenant_id)?;
        if let Some(Closed {
            connection: Some(connection),
        }) = self.close_entry_if(&entry, |_| true)
        {
            connection.close().await;
        }
        info!(tenant_id, session_id, "Session closed");
        Ok(entry.queue().stats())
    }

    /// Mark closed, release resources and unregister, if `should_close` holds under the
    /// session lock. `None` means the session was left alone.
    fn close_entry_if<F>(&self, entry: &Arc<SessionEntry>, should_close: F) -> Option<Closed>
    where
        F: FnOnce(&Session) -> bool,
    {
        let connection = {
            let mut state = entry.lock();
            if state.status == SessionStatus::Closed || !should_close(&state) {
                return None;
            }
            let connection = state.connection();
            if state.attached.take().is_some() {
                self.release_slot();
            }
            state.status = SessionStatus::Closed;
            state.context.clear();
            state.touch();
            connection
        };

        entry.queue().close();
        self.remove(entry);
        SessionMetrics::closed();
        GatewayMetrics::set_attached(self.attached.load(Ordering::Acquire));
        Some(Closed { connection })
    }

    fn remove(&self, entry: &Arc<SessionEntry>) {
        let removed = self
            .sessions
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if !removed {
            return;
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        SessionMetrics::set_live(self.live.load(Ordering::Acquire));

        let session_id = entry.session_id();
        if let Some(mut tenants) = self.owners.get_mut(session_id) {
            tenants.remove(entry.tenant_id());
        }
        self.owners.remove_if(session_id, |_, tenants| tenants.is_empty());
    }

    /// Close sessions disconnected for longer than `grace_ttl`.
    ///
    /// Locks one session at a time and stops early once shutdown begins. Returns the
    /// number of sessions closed.
    pub fn cleanup_sweep(&self, now: DateTime<Utc>, grace_ttl: Duration) -> usize {
        let mut closed = 0;
        for entry in self.snapshot() {
            if self.shutdown.is_cancelled() {
                debug!("Shutdown in progress, cleanup sweep stopped");
                break;
            }
            let expired = self.close_entry_if(&entry, |state| {
                state.status == SessionStatus::Disconnected
                    && state
                        .idle_time(now)
                        .to_std()
                        .map(|idle| idle > grace_ttl)
                        .unwrap_or(false)
            });
            if expired.is_some() {
                closed += 1;
                debug!(
                    tenant_id = entry.tenant_id(),
                    session_id = entry.session_id(),
                    "Expired session closed"
                );
            }
        }
        if closed > 0 {
            SessionMetrics::swept(closed);
            info!(closed, "Cleanup sweep closed expired sessions");
        }
        closed
    }

    /// Run `cleanup_sweep` on the configured interval until shutdown
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => {
                        debug!("Session sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.cleanup_sweep(Utc::now(), registry.config.grace_ttl);
                    }
                }
            }
        })
    }

    /// Operator view of one session
    pub fn status(&self, session_id: &str, tenant_id: &str) -> Result<SessionStatusReport> {
        let entry = self.get(session_id, tenant_id)?;
        let queue = entry.queue().stats();
        let state = entry.lock();
        Ok(SessionStatusReport {
            tenant_id: tenant_id.to_string(),
            session_id: session_id.to_string(),
            user_id: entry.user_id().to_string(),
            status: effective_status(state.status, queue.status),
            queue,
            connection_count: state.connection_count,
            connected: state.is_attached(),
            context_len: state.context.len(),
            created_at: state.created_at,
            last_activity_at: state.last_activity_at,
        })
    }

    /// Sessions by status plus attached connection count
    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary {
            attached_connections: self.attached_count(),
            ..Default::default()
        };
        for entry in self.snapshot() {
            let status = entry.status();
            if status == SessionStatus::Closed {
                continue;
            }
            summary.total_sessions += 1;
            *summary.by_status.entry(status).or_insert(0) += 1;
        }
        summary
    }

    /// All registered sessions at this instant
    pub fn snapshot(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn session_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Stop accepting new sessions and stop the sweeper
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn new_entry(&self, key: SessionKey, user_id: &str) -> Arc<SessionEntry> {
        Arc::new(SessionEntry::new(
            key,
            user_id,
            self.config.queue.clone(),
            self.config.max_inflight_per_session,
        ))
    }

    fn reserve_slot(&self) -> bool {
        let limit = self.config.max_connections;
        self.attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
