//! WebSocket accept loop against a real socket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canopy_gateway::{EchoPipeline, Gateway, GatewayConfig, TENANT_HEADER, USER_HEADER};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_gateway() -> (Gateway, SocketAddr) {
    start_gateway_with(GatewayConfig::default()).await
}

async fn start_gateway_with(config: GatewayConfig) -> (Gateway, SocketAddr) {
    let gateway = Gateway::new(config, Arc::new(EchoPipeline::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = gateway.clone();
    tokio::spawn(async move { server.serve(listener).await });
    (gateway, addr)
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_session_round_trip() {
    let (gateway, addr) = start_gateway().await;

    let mut request = format!("ws://{}/ws?session_id=ws-1", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(TENANT_HEADER, HeaderValue::from_static("t1"));
    request
        .headers_mut()
        .insert(USER_HEADER, HeaderValue::from_static("u1"));

    let (mut client, _) = connect_async(request).await.unwrap();

    let connected = next_json(&mut client).await;
    assert_eq!(connected["event"]["type"], "connected");
    assert_eq!(connected["event"]["session_id"], "ws-1");

    client
        .send(Message::Text(
            r#"{"type":"message","id":"r1","content":"hi there"}"#.to_string(),
        ))
        .await
        .unwrap();

    let progress = next_json(&mut client).await;
    assert_eq!(progress["kind"], "intermediate");
    assert_eq!(progress["event"]["content"], "hi");
    let answer = next_json(&mut client).await;
    assert_eq!(answer["kind"], "final");
    assert_eq!(answer["event"]["content"], "hi there");

    client.close(None).await.unwrap();

    let registry = gateway.registry();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.attached_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(registry.get_context("ws-1", "t1").unwrap().len(), 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn websocket_without_identity_is_unauthorized() {
    let (gateway, addr) = start_gateway().await;

    let err = connect_async(format!("ws://{}/ws", addr)).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
    assert_eq!(gateway.registry().session_count(), 0);
}

#[tokio::test]
async fn stalled_handshake_is_dropped() {
    let (gateway, addr) = start_gateway_with(GatewayConfig {
        handshake_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    // Open the TCP connection but never send the upgrade request.
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("server kept a stalled handshake open");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(gateway.registry().session_count(), 0);
}
