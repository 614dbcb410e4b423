//! Per-session outbound buffer with backpressure policy
//!
//! Producers call [`BackpressureQueue::enqueue`], which never waits. A single drain
//! worker per connection pulls messages with [`BackpressureQueue::next_message`] and
//! reports each delivery back with [`BackpressureQueue::complete`].
//!
//! When the queue is full:
//! - an incoming `intermediate` is dropped (the queued ones are kept),
//! - an incoming `final`/`urgent`/`error` evicts the oldest queued `intermediate`, or is
//!   appended past capacity when there is none to evict, up to `max_overflow` extra slots.
//!
//! Replies triggered by client frames go through [`BackpressureQueue::wait_for_room`]
//! first, so only pipeline terminals (bounded by the in-flight limit) ever use the
//! overflow slots.
//!
//! The message being written counts toward occupancy until `complete` is called.

use std::collections::VecDeque;

use canopy_observability::QueueMetrics;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::protocol::{MessageKind, OutboundMessage};

/// Queue sizing and status thresholds
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of undelivered messages
    pub max_queue_size: usize,
    /// Occupancy ratio at which the queue reports `Warning`
    pub warning_ratio: f64,
    /// Occupancy ratio at which the queue reports `Critical`
    pub critical_ratio: f64,
    /// Priority messages admitted past `max_queue_size` when nothing is evictable
    pub max_overflow: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            warning_ratio: 0.5,
            critical_ratio: 0.8,
            max_overflow: 8,
        }
    }
}

impl QueueConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_overflow(mut self, slots: usize) -> Self {
        self.max_overflow = slots;
        self
    }
}

/// Occupancy-derived health of a queue
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Normal,
    Warning,
    Critical,
    Overflow,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Normal => "normal",
            QueueStatus::Warning => "warning",
            QueueStatus::Critical => "critical",
            QueueStatus::Overflow => "overflow",
        }
    }
}

/// Outcome of a single enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Appended within capacity
    Accepted { sequence: u64 },
    /// Appended after evicting the oldest queued intermediate
    Evicted { sequence: u64, evicted: u64 },
    /// Priority message appended past capacity; nothing was evictable
    OverCapacity { sequence: u64 },
    /// Incoming intermediate dropped because the queue is full
    Dropped { sequence: u64 },
    /// Priority message refused because the overflow slots are used up
    Refused { sequence: u64 },
    /// No connection is attached or the queue is closing
    Discarded { sequence: u64 },
}

impl EnqueueResult {
    pub fn sequence(&self) -> u64 {
        match *self {
            EnqueueResult::Accepted { sequence }
            | EnqueueResult::Evicted { sequence, .. }
            | EnqueueResult::OverCapacity { sequence }
            | EnqueueResult::Dropped { sequence }
            | EnqueueResult::Refused { sequence }
            | EnqueueResult::Discarded { sequence } => sequence,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            EnqueueResult::Accepted { .. }
                | EnqueueResult::Evicted { .. }
                | EnqueueResult::OverCapacity { .. }
        )
    }
}

/// What happened to a message handed out by `next_message`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub status: QueueStatus,
    pub occupancy: usize,
    pub capacity: usize,
    pub enqueued_count: u64,
    pub sent_count: u64,
    pub dropped_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No connection attached; everything enqueued is discarded
    Detached,
    /// Attached and accepting
    Open,
    /// Flushing priority messages before close; nothing new is accepted
    Closing,
    Closed,
}

#[derive(Debug)]
struct QueueState {
    buffer: VecDeque<OutboundMessage>,
    in_flight: usize,
    phase: Phase,
    next_sequence: u64,
    status: QueueStatus,
    enqueued: u64,
    sent: u64,
    dropped: u64,
}

impl QueueState {
    fn occupancy(&self) -> usize {
        self.buffer.len() + self.in_flight
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.in_flight == 0
    }
}

/// Bounded outbound buffer owned by one session
#[derive(Debug)]
pub struct BackpressureQueue {
    session_id: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Wakes the drain worker on enqueue and on phase changes
    ready: Notify,
    /// Wakes `wait_idle` callers once nothing is buffered or in flight
    idle: Notify,
    /// Wakes `wait_for_room` callers whenever occupancy drops or the phase changes
    room: Notify,
}

impl BackpressureQueue {
    /// Create a detached queue; call [`attach`](Self::attach) once a connection is bound
    pub fn new(session_id: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                in_flight: 0,
                phase: Phase::Detached,
                next_sequence: 1,
                status: QueueStatus::Normal,
                enqueued: 0,
                sent: 0,
                dropped: 0,
            }),
            ready: Notify::new(),
            idle: Notify::new(),
            room: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.max_queue_size
    }

    /// Start accepting messages for a newly attached connection
    pub fn attach(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Closed {
            state.phase = Phase::Open;
        }
    }

    /// Offer a message. Never blocks.
    pub fn enqueue(&self, mut message: OutboundMessage) -> EnqueueResult {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.enqueued += 1;
        message.sequence = sequence;
        message.enqueued_at = Utc::now();
        QueueMetrics::enqueued(message.kind.as_str());

        if state.phase != Phase::Open {
            state.dropped += 1;
            let reason = if state.phase == Phase::Detached {
                "detached"
            } else {
                "closed"
            };
            QueueMetrics::dropped(reason, 1);
            if message.kind.is_terminal() {
                warn!(
                    session_id = %self.session_id,
                    sequence,
                    reason,
                    "Terminal message discarded, no deliverable connection"
                );
            } else {
                debug!(session_id = %self.session_id, sequence, reason, "Message discarded");
            }
            return EnqueueResult::Discarded { sequence };
        }

        let capacity = self.config.max_queue_size;
        let result = if state.occupancy() < capacity {
            state.buffer.push_back(message);
            EnqueueResult::Accepted { sequence }
        } else if message.kind.is_priority() {
            let evictable = state
                .buffer
                .iter()
                .position(|m| m.kind == MessageKind::Intermediate);
            match evictable.and_then(|idx| state.buffer.remove(idx)) {
                Some(evicted) => {
                    state.dropped += 1;
                    QueueMetrics::dropped("evicted", 1);
                    state.buffer.push_back(message);
                    debug!(
                        session_id = %self.session_id,
                        sequence,
                        evicted = evicted.sequence,
                        "Evicted intermediate to admit priority message"
                    );
                    EnqueueResult::Evicted {
                        sequence,
                        evicted: evicted.sequence,
                    }
                }
                None if state.occupancy() < capacity + self.config.max_overflow => {
                    state.buffer.push_back(message);
                    warn!(
                        session_id = %self.session_id,
                        sequence,
                        occupancy = state.occupancy(),
                        capacity,
                        "Queue over capacity, priority message admitted"
                    );
                    EnqueueResult::OverCapacity { sequence }
                }
                None => {
                    state.dropped += 1;
                    QueueMetrics::dropped("overflow_ceiling", 1);
                    warn!(
                        session_id = %self.session_id,
                        sequence,
                        kind = message.kind.as_str(),
                        occupancy = state.occupancy(),
                        "Overflow slots exhausted, priority message refused"
                    );
                    EnqueueResult::Refused { sequence }
                }
            }
        } else {
            state.dropped += 1;
            QueueMetrics::dropped("overflow", 1);
            debug!(session_id = %self.session_id, sequence, "Queue full, intermediate dropped");
            EnqueueResult::Dropped { sequence }
        };

        self.refresh_status(&mut state);
        drop(state);

        if result.is_accepted() {
            self.ready.notify_one();
        }
        result
    }

    /// Wait for the next message to write.
    ///
    /// Returns `None` once the queue is detached or closed, or when it is closing and
    /// fully flushed. Cancel-safe: a message is only taken when the future completes.
    pub async fn next_message(&self) -> Option<OutboundMessage> {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            {
                let mut state = self.state.lock();
                if matches!(state.phase, Phase::Detached | Phase::Closed) {
                    return None;
                }
                if let Some(message) = state.buffer.pop_front() {
                    state.in_flight += 1;
                    return Some(message);
                }
                if state.phase == Phase::Closing {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Record the fate of a message taken with `next_message`
    pub fn complete(&self, delivery: Delivery) {
        let mut state = self.state.lock();
        if state.in_flight == 0 {
            // Already written off by `close`
            return;
        }
        state.in_flight -= 1;
        match delivery {
            Delivery::Sent => {
                state.sent += 1;
                QueueMetrics::sent();
            }
            Delivery::Failed => {
                state.dropped += 1;
                QueueMetrics::dropped("send_failed", 1);
            }
        }
        self.refresh_status(&mut state);
        let idle = state.is_idle();
        drop(state);

        self.room.notify_waiters();
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Wait until occupancy is below capacity, or the queue stops accepting.
    ///
    /// Cancel-safe.
    pub async fn wait_for_room(&self) {
        loop {
            let room = self.room.notified();
            tokio::pin!(room);
            room.as_mut().enable();
            {
                let state = self.state.lock();
                if state.phase != Phase::Open || state.occupancy() < self.config.max_queue_size {
                    return;
                }
            }
            room.await;
        }
    }

    /// Wait until nothing is buffered or in flight
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.state.lock().is_idle() {
                return;
            }
            idle.await;
        }
    }

    /// Discard everything pending because the connection went away.
    ///
    /// Returns how many messages were discarded.
    pub fn detach(&self) -> usize {
        let mut state = self.state.lock();
        if state.phase != Phase::Closed {
            state.phase = Phase::Detached;
        }
        let discarded = self.discard(&mut state, "detached");
        drop(state);
        self.wake_all();
        discarded
    }

    /// Stop accepting and drop queued intermediates; priority messages stay to be flushed
    pub fn begin_close(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closing;
        let before = state.buffer.len();
        state.buffer.retain(|m| m.kind.is_priority());
        let removed = (before - state.buffer.len()) as u64;
        if removed > 0 {
            state.dropped += removed;
            QueueMetrics::dropped("closed", removed);
        }
        self.refresh_status(&mut state);
        drop(state);
        self.wake_all();
    }

    /// Close for good, discarding whatever is left. Returns the discarded count.
    ///
    /// A message still being written is counted as dropped here; its later
    /// `complete` is ignored.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.phase = Phase::Closed;
        let in_flight = std::mem::take(&mut state.in_flight);
        if in_flight > 0 {
            state.dropped += in_flight as u64;
            QueueMetrics::dropped("closed", in_flight as u64);
        }
        let discarded = self.discard(&mut state, "closed") + in_flight;
        drop(state);
        self.wake_all();
        info!(session_id = %self.session_id, discarded, "Queue closed");
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    pub fn status(&self) -> QueueStatus {
        self.state.lock().status
    }

    pub fn occupancy(&self) -> usize {
        self.state.lock().occupancy()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            status: state.status,
            occupancy: state.occupancy(),
            capacity: self.config.max_queue_size,
            enqueued_count: state.enqueued,
            sent_count: state.sent,
            dropped_count: state.dropped,
        }
    }

    fn discard(&self, state: &mut QueueState, reason: &'static str) -> usize {
        let discarded = state.buffer.len();
        if discarded > 0 {
            let terminal = state.buffer.iter().filter(|m| m.kind.is_terminal()).count();
            if terminal > 0 {
                warn!(
                    session_id = %self.session_id,
                    terminal,
                    reason,
                    "Discarding undelivered terminal messages"
                );
            }
            state.buffer.clear();
            state.dropped += discarded as u64;
            QueueMetrics::dropped(reason, discarded as u64);
        }
        self.refresh_status(state);
        discarded
    }

    fn wake_all(&self) {
        self.ready.notify_waiters();
        self.room.notify_waiters();
        if self.state.lock().is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn refresh_status(&self, state: &mut QueueState) {
        let status = self.classify(state.occupancy());
        if status == state.status {
            return;
        }
        let previous = std::mem::replace(&mut state.status, status);
        QueueMetrics::status_changed(status.as_str());
        if status > previous && status >= QueueStatus::Critical {
            warn!(
                session_id = %self.session_id,
                from = previous.as_str(),
                to = status.as_str(),
                "Queue under backpressure"
            );
        } else {
            debug!(
                session_id = %self.session_id,
                from = previous.as_str(),
                to = status.as_str(),
                "Queue status changed"
            );
        }
    }

    fn classify(&self, occupancy: usize) -> QueueStatus {
        let capacity = self.config.max_queue_size.max(1);
        if occupancy >= capacity {
            return QueueStatus::Overflow;
        }
        let ratio = occupancy as f64 / capacity as f64;
        if ratio >= self.config.critical_ratio {
            QueueStatus::Critical
        } else if ratio >= self.config.warning_ratio {
            QueueStatus::Warning
        } else {
            QueueStatus::Normal
        }
    }
}
