//! Backpressure and failure scenarios, end to end through queue, drain and gateway

mod common;

use std::sync::Arc;
use std::time::Duration;

use canopy_gateway::{
    BackpressureQueue, ClientIdentity, Connection, DrainWorker, Gateway, GatewayConfig,
    GatewayError, OutboundMessage, QueueConfig, RegistryConfig, SessionStatus,
};
use common::{connect, echo_gateway, wait_until, MockTransport, ScriptedPipeline};

fn attached_queue(size: usize) -> Arc<BackpressureQueue> {
    let queue = Arc::new(BackpressureQueue::new(
        "sess-a",
        QueueConfig::default().with_max_queue_size(size),
    ));
    queue.attach();
    queue
}

#[tokio::test(start_paused = true)]
async fn slow_client_keeps_oldest_intermediates() {
    let queue = attached_queue(5);
    let transport = MockTransport::with_send_delay(Duration::from_millis(100));
    let connection = Arc::new(Connection::new(transport.clone()));
    let worker = DrainWorker::spawn(queue.clone(), connection.clone());

    let accepted = (0..10)
        .map(|i| queue.enqueue(OutboundMessage::intermediate("r1", format!("step {}", i))))
        .filter(|result| result.is_accepted())
        .count();

    assert!(accepted <= 5);
    assert!(queue.occupancy() <= 5);
    assert!(queue.stats().dropped_count >= 5);

    queue.wait_idle().await;

    let delivered = transport.sequences();
    assert_eq!(delivered.len(), accepted);
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));

    let stats = queue.stats();
    assert_eq!(stats.enqueued_count, 10);
    assert_eq!(stats.sent_count + stats.dropped_count, 10);

    connection.close().await;
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn final_on_full_queue_is_delivered() {
    let queue = attached_queue(5);
    let transport = MockTransport::with_send_delay(Duration::from_millis(100));
    let connection = Arc::new(Connection::new(transport.clone()));

    for i in 0..5 {
        assert!(queue
            .enqueue(OutboundMessage::intermediate("r1", format!("step {}", i)))
            .is_accepted());
    }
    let final_sequence = queue
        .enqueue(OutboundMessage::final_answer("r1", "done"))
        .sequence();
    assert!(queue.occupancy() <= 5);

    let worker = DrainWorker::spawn(queue.clone(), connection.clone());
    queue.wait_idle().await;

    let frames = transport.frames();
    let last = frames.last().unwrap();
    assert_eq!(last["kind"], "final");
    assert_eq!(last["sequence"], final_sequence);

    let stats = queue.stats();
    assert_eq!(stats.sent_count, 5);
    assert_eq!(stats.dropped_count, 1);

    connection.close().await;
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn urgent_bypasses_a_queue_full_of_finals() {
    let queue = attached_queue(2);
    let transport = MockTransport::with_send_delay(Duration::from_millis(50));
    let connection = Arc::new(Connection::new(transport.clone()));

    queue.enqueue(OutboundMessage::final_answer("r1", "one"));
    queue.enqueue(OutboundMessage::final_answer("r2", "two"));
    queue.enqueue(OutboundMessage::urgent(canopy_gateway::GatewayEvent::Pong {
        timestamp: 7,
    }));
    assert_eq!(queue.occupancy(), 3);

    let worker = DrainWorker::spawn(queue.clone(), connection.clone());
    queue.wait_idle().await;
    assert_eq!(transport.events(), vec!["answer", "answer", "pong"]);
    assert_eq!(queue.stats().dropped_count, 0);

    connection.close().await;
    worker.await.unwrap();
}

#[tokio::test]
async fn fourth_connection_rejected_at_capacity() {
    let gateway = echo_gateway(GatewayConfig {
        registry: RegistryConfig {
            max_connections: 3,
            ..Default::default()
        },
        ..Default::default()
    });

    let mut transports = Vec::new();
    for i in 0..3 {
        let transport = MockTransport::new();
        connect(&gateway, &transport, "t1", "u1", &format!("s{}", i)).await;
        transports.push(transport);
    }

    let rejected = MockTransport::new();
    let err = gateway
        .on_connect(
            rejected.clone(),
            ClientIdentity::new("t1", "u1"),
            Some("s-new".to_string()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::ConnectionLimit { limit: 3 }));
    assert_eq!(err.code(), "CAPACITY_EXCEEDED");
    assert!(rejected.is_closed());
    assert_eq!(rejected.frames()[0]["event"]["code"], "CAPACITY_EXCEEDED");

    let registry = gateway.registry();
    assert_eq!(registry.attached_count(), 3);
    for i in 0..3 {
        let entry = registry.get(&format!("s{}", i), "t1").unwrap();
        assert_eq!(entry.status(), SessionStatus::Connected);
    }
    assert!(transports.iter().all(|t| !t.is_closed()));
    assert!(matches!(
        registry.get("s-new", "t1"),
        Err(GatewayError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn pipeline_failure_midstream_ends_with_one_error() {
    let pipeline = Arc::new(ScriptedPipeline::new(&["a", "b", "c"]).failing_after(2));
    let gateway = Gateway::new(GatewayConfig::default(), pipeline);
    let transport = MockTransport::new();
    connect(&gateway, &transport, "t1", "u1", "s1").await;

    transport.send_message("r1", "go");
    wait_until(|| transport.frames_for("r1").len() >= 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let frames = transport.frames_for("r1");
    let kinds: Vec<&str> = frames.iter().map(|f| f["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["intermediate", "intermediate", "error"]);
    assert_eq!(frames[0]["event"]["content"], "a");
    assert_eq!(frames[1]["event"]["content"], "b");
    assert_eq!(frames[2]["event"]["code"], "PIPELINE_FAILURE");

    // The session stays usable for the next message.
    transport.send_message("r2", "again");
    wait_until(|| transport.frames_for("r2").len() >= 3).await;
    let entry = gateway.registry().get("s1", "t1").unwrap();
    assert_eq!(entry.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn send_failure_detaches_session() {
    let gateway = echo_gateway(GatewayConfig::default());
    let transport = MockTransport::new();
    connect(&gateway, &transport, "t1", "u1", "s1").await;
    let entry = gateway.registry().get("s1", "t1").unwrap();
    wait_until(|| entry.queue().stats().sent_count == 1).await;

    transport.break_sends();
    transport.send_message("r1", "hello there");

    wait_until(|| entry.status() == SessionStatus::Disconnected).await;
    assert!(transport.is_closed());
    assert_eq!(gateway.registry().attached_count(), 0);
    assert!(gateway.registry().get_context("s1", "t1").is_ok());
}

#[tokio::test(start_paused = true)]
async fn inflight_limit_serializes_one_session() {
    let pipeline = Arc::new(ScriptedPipeline::new(&["x", "y"]).with_delay(Duration::from_millis(20)));
    let gateway = Gateway::new(
        GatewayConfig {
            registry: RegistryConfig {
                max_inflight_per_session: 1,
                ..Default::default()
            },
            ..Default::default()
        },
        pipeline,
    );
    let transport = MockTransport::new();
    connect(&gateway, &transport, "t1", "u1", "s1").await;

    transport.send_message("r1", "first");
    transport.send_message("r2", "second");
    wait_until(|| transport.frames_for("r2").len() == 2).await;

    let order: Vec<String> = transport
        .frames()
        .iter()
        .filter_map(|f| f["request_id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(order, vec!["r1", "r1", "r2", "r2"]);
}

#[tokio::test(start_paused = true)]
async fn ping_flood_against_stalled_reader_stays_bounded() {
    let gateway = echo_gateway(GatewayConfig {
        registry: RegistryConfig {
            queue: QueueConfig::default().with_max_queue_size(2),
            ..Default::default()
        },
        ..Default::default()
    });
    let transport = MockTransport::with_send_delay(Duration::from_secs(3600));
    connect(&gateway, &transport, "t1", "u1", "s1").await;
    let entry = gateway.registry().get("s1", "t1").unwrap();

    for i in 0..500 {
        transport.push_inbound(serde_json::json!({"type": "ping", "timestamp": i}).to_string());
    }
    for _ in 0..200 {
        transport.push_inbound("{not json");
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stats = entry.queue().stats();
    assert!(
        stats.occupancy <= stats.capacity,
        "occupancy {} over capacity {}",
        stats.occupancy,
        stats.capacity
    );
    assert!(stats.enqueued_count <= 3);
    assert_eq!(stats.dropped_count, 0);
    assert_eq!(entry.status(), SessionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn send_failure_while_waiting_for_inflight_slot_detaches() {
    let pipeline = Arc::new(
        ScriptedPipeline::new(&["a", "b", "c", "d", "e"]).with_delay(Duration::from_secs(2)),
    );
    let gateway = Gateway::new(
        GatewayConfig {
            registry: RegistryConfig {
                max_inflight_per_session: 1,
                ..Default::default()
            },
            ..Default::default()
        },
        pipeline,
    );
    let transport = MockTransport::new();
    connect(&gateway, &transport, "t1", "u1", "s1").await;
    let entry = gateway.registry().get("s1", "t1").unwrap();
    wait_until(|| entry.queue().stats().sent_count == 1).await;

    transport.break_sends();
    transport.send_message("r1", "first");
    // Parks the receive loop on the in-flight permit held by r1.
    transport.send_message("r2", "second");

    wait_until(|| entry.status() == SessionStatus::Disconnected).await;
    assert!(transport.is_closed());
    assert_eq!(gateway.registry().attached_count(), 0);
}
