//! Connection abstraction
//!
//! A [`Connection`] wraps one client transport. The gateway only needs three things
//! from a transport (send a frame, receive a frame, close), so anything that can do
//! those (a WebSocket, an in-memory pipe in tests) plugs in through [`Transport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ConnectionError;

/// Upper bound on waiting for a transport to finish closing
pub const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Duplex message channel for one client socket.
///
/// `send` is only ever called from the connection's single drain worker. `receive`
/// returns `None` on graceful close and `Some(Err(_))` on failure.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, frame: String) -> Result<(), ConnectionError>;

    async fn receive(&self) -> Option<Result<String, ConnectionError>>;

    async fn close(&self);
}

/// Unique connection identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to one live client transport
pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    /// Cancelled once the connection is closed; drain and receive loops watch it
    closed: CancellationToken,
    closing: AtomicBool,
    opened_at: DateTime<Utc>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

impl Connection {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            id: ConnectionId::new(),
            transport,
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Write one frame to the transport
    pub async fn send(&self, frame: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.transport.send(frame).await
    }

    /// Read the next inbound frame; `None` once the peer or the gateway closed it
    pub async fn receive(&self) -> Option<Result<String, ConnectionError>> {
        if self.is_closed() {
            return None;
        }
        self.transport.receive().await
    }

    /// Close the connection. Idempotent.
    ///
    /// Workers watching [`closed`](Self::closed) stop right away; the transport gets
    /// at most [`TRANSPORT_CLOSE_TIMEOUT`] to shut down.
    pub async fn close(&self) {
        if self.begin_close() {
            self.close_transport().await;
        }
    }

    /// Like [`close`](Self::close), but the transport shutdown runs on its own task
    pub fn close_in_background(self: &Arc<Self>) {
        if self.begin_close() {
            let connection = Arc::clone(self);
            tokio::spawn(async move { connection.close_transport().await });
        }
    }

    /// Mark the connection dead after a failed write. The owner still calls `close`.
    pub(crate) fn mark_broken(&self) {
        self.closed.cancel();
    }

    fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        true
    }

    async fn close_transport(&self) {
        match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, self.transport.close()).await {
            Ok(()) => debug!(connection_id = %self.id, "Connection closed"),
            Err(_) => warn!(
                connection_id = %self.id,
                timeout_ms = TRANSPORT_CLOSE_TIMEOUT.as_millis() as u64,
                "Transport close timed out, abandoning"
            ),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-memory transport recording every frame it is asked to send
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<String>>,
        pub send_delay: Duration,
        pub fail_sends: AtomicBool,
        pub closed: AtomicBool,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
        pub inbound_tx: mpsc::UnboundedSender<String>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        pub fn with_delay(send_delay: Duration) -> Arc<Self> {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                send_delay,
                fail_sends: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                inbound: tokio::sync::Mutex::new(inbound_rx),
                inbound_tx,
            })
        }

        pub fn sent_frames(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, frame: String) -> Result<(), ConnectionError> {
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ConnectionError::Send("broken pipe".to_string()));
            }
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn receive(&self) -> Option<Result<String, ConnectionError>> {
            self.inbound.lock().await.recv().await.map(Ok)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let transport = RecordingTransport::new();
        let conn = Connection::new(transport.clone());

        conn.send("a".to_string()).await.unwrap();
        conn.close().await;

        assert!(conn.is_closed());
        assert!(transport.closed.load(Ordering::SeqCst));
        assert!(matches!(
            conn.send("b".to_string()).await,
            Err(ConnectionError::Closed)
        ));
        assert!(conn.receive().await.is_none());
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = Connection::new(RecordingTransport::new());
        conn.close().await;
        conn.close().await;
        conn.closed().await;
        assert!(conn.is_closed());
    }

    /// Transport whose close never finishes, like a peer with a full TCP window
    struct WedgedTransport;

    #[async_trait]
    impl Transport for WedgedTransport {
        async fn send(&self, _frame: String) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn receive(&self) -> Option<Result<String, ConnectionError>> {
            std::future::pending().await
        }

        async fn close(&self) {
            std::future::pending::<()>().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_wedged_transport() {
        let conn = Connection::new(Arc::new(WedgedTransport));
        let started = tokio::time::Instant::now();
        conn.close().await;

        assert!(conn.is_closed());
        assert!(started.elapsed() >= TRANSPORT_CLOSE_TIMEOUT);
        assert!(started.elapsed() < TRANSPORT_CLOSE_TIMEOUT * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_in_background_returns_immediately() {
        let conn = Arc::new(Connection::new(Arc::new(WedgedTransport)));
        conn.close_in_background();
        assert!(conn.is_closed());
        conn.closed().await;
        // a later close is a no-op rather than a second wait
        tokio::time::timeout(std::time::Duration::from_millis(1), conn.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mark_broken_still_closes_transport() {
        let transport = RecordingTransport::new();
        let conn = Connection::new(transport.clone());
        conn.mark_broken();
        assert!(conn.is_closed());
        assert!(!transport.closed.load(Ordering::SeqCst));

        conn.close().await;
        assert!(transport.closed.load(Ordering::SeqCst));
    }
}
