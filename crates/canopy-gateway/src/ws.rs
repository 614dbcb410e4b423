//! WebSocket transport and accept loop
//!
//! Identity is resolved during the upgrade handshake from the `x-tenant-id` and
//! `x-user-id` headers, set by the authenticating proxy in front of the gateway. A
//! session to resume may be named with `x-session-id` or a `session_id` query parameter.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::connection::Transport;
use crate::error::{ConnectionError, GatewayError, Result};
use crate::gateway::{ClientIdentity, Gateway};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const SESSION_HEADER: &str = "x-session-id";

/// [`Transport`] over a WebSocket stream
pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: String) -> std::result::Result<(), ConnectionError> {
        self.sink.lock().await.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn receive(&self) -> Option<std::result::Result<String, ConnectionError>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes).map_err(|e| ConnectionError::Receive(e.to_string())),
                    )
                }
                Ok(Message::Close(_)) => return None,
                // Ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

/// Identity and resume target taken from the upgrade request
#[derive(Debug, Clone)]
struct Handshake {
    identity: ClientIdentity,
    session_id: Option<String>,
}

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn query_param(request: &Request, name: &str) -> Option<String> {
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
    })
}

fn unauthorized(message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn resolve_handshake(request: &Request) -> std::result::Result<Handshake, ErrorResponse> {
    let tenant_id = header(request, TENANT_HEADER).ok_or_else(|| unauthorized("missing x-tenant-id"))?;
    let user_id = header(request, USER_HEADER).ok_or_else(|| unauthorized("missing x-user-id"))?;
    let session_id = header(request, SESSION_HEADER).or_else(|| query_param(request, "session_id"));
    Ok(Handshake {
        identity: ClientIdentity { tenant_id, user_id },
        session_id,
    })
}

impl Gateway {
    /// Bind `bind` and serve WebSocket clients until shutdown
    pub async fn run(&self, bind: &str) -> Result<()> {
        let addr: SocketAddr = bind.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Accept WebSocket clients from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let shutdown = self.shutdown_token();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Gateway stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            debug!("New connection from {}", peer);
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_socket(stream, peer).await {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut handshake = None;
        let accept = accept_hdr_async(stream, |request: &Request, response: Response| {
            handshake = Some(resolve_handshake(request)?);
            Ok(response)
        });
        let socket = match tokio::time::timeout(self.config().handshake_timeout, accept).await {
            Ok(accepted) => accepted.map_err(ConnectionError::from)?,
            Err(_) => {
                warn!(peer = %peer, "WebSocket handshake timed out");
                return Err(ConnectionError::Receive("handshake timed out".to_string()).into());
            }
        };

        let Some(Handshake {
            identity,
            session_id,
        }) = handshake
        else {
            return Err(GatewayError::InvalidMessage("handshake without identity".to_string()));
        };

        let transport = Arc::new(WebSocketTransport::new(socket));
        let handle = self.on_connect(transport, identity, session_id).await?;
        debug!(peer = %peer, session_id = handle.session_id(), "WebSocket session started");
        Ok(())
    }
}
