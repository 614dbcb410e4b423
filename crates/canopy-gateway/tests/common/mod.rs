//! Shared test doubles for gateway integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy_gateway::{
    AgentPipeline, ChunkStream, ClientIdentity, ConnectionError, EchoPipeline, Gateway,
    GatewayConfig, PipelineError, PipelineRequest, SessionHandle, Transport,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// In-memory transport: records sent frames, replays scripted inbound frames
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    send_delay: Duration,
    fail_sends: AtomicBool,
    closed: AtomicBool,
    stall_close: AtomicBool,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_send_delay(Duration::ZERO)
    }

    pub fn with_send_delay(send_delay: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            send_delay,
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stall_close: AtomicBool::new(false),
            inbound: tokio::sync::Mutex::new(rx),
            inbound_tx: Mutex::new(Some(tx)),
        })
    }

    /// Queue a raw frame for the gateway to receive
    pub fn push_inbound(&self, frame: impl Into<String>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(frame.into());
        }
    }

    /// Queue a `message` frame
    pub fn send_message(&self, id: &str, content: &str) {
        self.push_inbound(
            serde_json::json!({"type": "message", "id": id, "content": content}).to_string(),
        );
    }

    /// Simulate the client going away
    pub fn hang_up(&self) {
        self.inbound_tx.lock().take();
    }

    /// Make every following send fail
    pub fn break_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Make `close` record the call and then never return, like a wedged socket
    pub fn stall_close(&self) {
        self.stall_close.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|f| serde_json::from_str(f).expect("frame is JSON"))
            .collect()
    }

    /// `event.type` of every frame sent so far
    pub fn events(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| f["event"]["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Frames answering one request
    pub fn frames_for(&self, request_id: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["request_id"] == request_id)
            .collect()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.frames()
            .iter()
            .filter_map(|f| f["sequence"].as_u64())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: String) -> Result<(), ConnectionError> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectionError::Send("connection reset".to_string()));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn receive(&self) -> Option<Result<String, ConnectionError>> {
        self.inbound.lock().await.recv().await.map(Ok)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

/// Pipeline yielding a fixed chunk list, optionally failing after some chunks
pub struct ScriptedPipeline {
    chunks: Vec<String>,
    fail_after: Option<usize>,
    delay: Duration,
    requests: Mutex<Vec<PipelineRequest>>,
}

impl ScriptedPipeline {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            fail_after: None,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Yield `n` chunks, then raise a pipeline error
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<PipelineRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AgentPipeline for ScriptedPipeline {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: PipelineRequest) -> Result<ChunkStream, PipelineError> {
        self.requests.lock().push(request);
        let chunks = self.chunks.clone();
        let fail_after = self.fail_after;
        let delay = self.delay;

        Ok(Box::pin(async_stream::stream! {
            let limit = fail_after.unwrap_or(chunks.len()).min(chunks.len());
            for chunk in chunks.into_iter().take(limit) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if fail_after.is_some() {
                yield Err(PipelineError::backend("scripted failure"));
            }
        }))
    }
}

pub fn echo_gateway(config: GatewayConfig) -> Gateway {
    Gateway::new(config, Arc::new(EchoPipeline::new()))
}

pub async fn connect(
    gateway: &Gateway,
    transport: &Arc<MockTransport>,
    tenant_id: &str,
    user_id: &str,
    session_id: &str,
) -> SessionHandle {
    gateway
        .on_connect(
            transport.clone(),
            ClientIdentity::new(tenant_id, user_id),
            Some(session_id.to_string()),
        )
        .await
        .expect("connect")
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
