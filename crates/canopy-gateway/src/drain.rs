//! Drain worker
//!
//! Exactly one worker per attached connection pulls from the session's queue and writes
//! to the transport, so writes for a connection are never interleaved.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::queue::{BackpressureQueue, Delivery};

/// Why a drain worker stopped
#[derive(Debug)]
pub enum DrainOutcome {
    /// The connection was closed by the gateway (detach, supersede, close)
    Stopped,
    /// The queue was detached or closed and fully flushed
    QueueClosed,
    /// A send failed; the session must be detached
    ConnectionBroken(ConnectionError),
}

pub struct DrainWorker;

impl DrainWorker {
    /// Start draining `queue` into `connection`
    pub fn spawn(queue: Arc<BackpressureQueue>, connection: Arc<Connection>) -> JoinHandle<DrainOutcome> {
        tokio::spawn(async move { Self::run(&queue, &connection).await })
    }

    async fn run(queue: &BackpressureQueue, connection: &Connection) -> DrainOutcome {
        let connection_id = connection.id().clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = connection.closed() => return DrainOutcome::Stopped,
                next = queue.next_message() => match next {
                    Some(message) => message,
                    None => {
                        debug!(connection_id = %connection_id, "Queue drained, worker exiting");
                        return DrainOutcome::QueueClosed;
                    }
                },
            };

            let frame = match message.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        connection_id = %connection_id,
                        sequence = message.sequence,
                        error = %e,
                        "Failed to encode outbound message"
                    );
                    queue.complete(Delivery::Failed);
                    continue;
                }
            };

            let sent = tokio::select! {
                biased;
                _ = connection.closed() => None,
                result = connection.send(frame) => Some(result),
            };

            match sent {
                Some(Ok(())) => queue.complete(Delivery::Sent),
                Some(Err(e)) => {
                    queue.complete(Delivery::Failed);
                    connection.mark_broken();
                    warn!(
                        connection_id = %connection_id,
                        sequence = message.sequence,
                        error = %e,
                        "Send failed, stopping drain"
                    );
                    return DrainOutcome::ConnectionBroken(e);
                }
                None => {
                    queue.complete(Delivery::Failed);
                    return DrainOutcome::Stopped;
                }
            }
        }
    }
}
