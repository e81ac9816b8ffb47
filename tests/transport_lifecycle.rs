mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_live::client::{EventKind, TransportConfig, TransportEvent};
use agent_live::core::{
    ConnectionState, InboundMessage, LiveError, OutboundMessage, PushTopic, WsFrame,
};
use agent_live::testing::{event_recorder, mock_client};
use common::{WAIT, connected_client, fast_config, next_event, wait_connected, wait_for_event};
use serde_json::json;
use tokio::time::Instant;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_is_a_no_op_while_connecting_or_connected() {
    let (client, mut server) = mock_client(fast_config(3));

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    let _conn = server.accept_timeout(WAIT).await.expect("first connection");
    wait_connected(&client).await;
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connect_count(), 1);
    assert!(server.try_accept().is_none());
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_then_connect_leaves_a_single_socket() {
    let (client, mut server, mut first) = connected_client(fast_config(3)).await;

    client.disconnect().await.unwrap();
    let close = first.recv_outbound_timeout(WAIT).await;
    assert_eq!(close, Some(WsFrame::client_disconnect()));
    assert!(!client.is_connected().await);

    client.connect().await.unwrap();
    let _second = server.accept_timeout(WAIT).await.expect("second connection");
    wait_connected(&client).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connect_count(), 2);
    assert!(server.try_accept().is_none());
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listeners_run_in_registration_order_and_off_stops_delivery() {
    let (client, mut server) = mock_client(fast_config(3));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for n in 1..=3 {
        let seen = seen.clone();
        let id = client
            .on(EventKind::Connected, move |_: &TransportEvent| {
                seen.lock().unwrap().push(n);
            })
            .await
            .unwrap();
        ids.push(id);
    }
    assert!(client.off(ids[1]).await.unwrap());
    assert!(!client.off(ids[1]).await.unwrap());

    client.connect().await.unwrap();
    let _conn = server.accept_timeout(WAIT).await.unwrap();
    wait_connected(&client).await;

    assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_disconnect_clears_listeners() {
    let (client, _server, _conn) = connected_client(fast_config(3)).await;
    let (recorder, mut events) = event_recorder();
    client
        .on_shared(EventKind::Disconnected, recorder.clone())
        .await
        .unwrap();
    client.on_shared(EventKind::Error, recorder).await.unwrap();
    let mut state = client.watch_state().await.unwrap();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    client.disconnect().await.unwrap();

    // the registry drops the recorder, so the channel may close but must stay empty
    let observed = tokio::time::timeout(Duration::from_millis(150), events.recv()).await;
    assert!(!matches!(observed, Ok(Some(_))), "no event expected, got {observed:?}");
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abnormal_close_retries_until_the_ceiling_then_gives_up() {
    let (client, server, mut conn) = connected_client(fast_config(2)).await;
    let (recorder, mut events) = event_recorder();
    client
        .on_shared(EventKind::Reconnecting, recorder.clone())
        .await
        .unwrap();
    client
        .on_shared(EventKind::Disconnected, recorder)
        .await
        .unwrap();

    server.refuse_connections(true);
    conn.drop_socket();

    let mut attempts = Vec::new();
    loop {
        match next_event(&mut events).await {
            TransportEvent::Reconnecting { attempt, delay } => {
                assert_eq!(delay, Duration::from_millis(20));
                attempts.push(attempt);
            }
            TransportEvent::Disconnected { exhausted, .. } => {
                assert!(exhausted);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(attempts, vec![1, 2]);
    // initial connect plus two refused retries
    assert_eq!(server.connect_count(), 3);
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn default_policy_gives_up_after_five_attempts_three_seconds_apart() {
    let (client, server, mut conn) = connected_client(TransportConfig::default()).await;
    let (recorder, mut events) = event_recorder();
    client
        .on_shared(EventKind::Reconnecting, recorder.clone())
        .await
        .unwrap();
    client
        .on_shared(EventKind::Disconnected, recorder)
        .await
        .unwrap();

    server.refuse_connections(true);
    let dropped_at = Instant::now();
    conn.drop_socket();

    let mut attempts = Vec::new();
    let gave_up_at = loop {
        match events.recv().await.expect("recorder alive") {
            TransportEvent::Reconnecting { attempt, delay } => {
                assert_eq!(delay, Duration::from_secs(3));
                attempts.push(attempt);
            }
            TransportEvent::Disconnected { exhausted, .. } => {
                assert!(exhausted);
                break Instant::now();
            }
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert!(gave_up_at - dropped_at >= Duration::from_secs(15));
    assert_eq!(server.connect_count(), 6);
    assert!(!client.is_connected().await);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_reconnect_resets_the_attempt_counter() {
    let (client, mut server, mut conn) = connected_client(fast_config(2)).await;
    let (recorder, mut events) = event_recorder();
    for kind in [EventKind::Reconnecting, EventKind::Connected] {
        client.on_shared(kind, recorder.clone()).await.unwrap();
    }

    conn.drop_socket();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Reconnecting { attempt: 1, .. }
    ));
    let mut conn = server.accept_timeout(WAIT).await.expect("reconnected");
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    conn.drop_socket();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Reconnecting { attempt: 1, .. }
    ));
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_server_close_is_not_retried() {
    let (client, server, conn) = connected_client(fast_config(3)).await;
    let (recorder, mut events) = event_recorder();
    for kind in [EventKind::Reconnecting, EventKind::Disconnected] {
        client.on_shared(kind, recorder.clone()).await.unwrap();
    }

    conn.close(1000, "maintenance").unwrap();

    match next_event(&mut events).await {
        TransportEvent::Disconnected { exhausted, reason } => {
            assert!(!exhausted);
            assert!(reason.contains("1000"), "reason: {reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connect_count(), 1);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_socket_is_replaced_after_the_liveness_window() {
    let config = fast_config(3).with_heartbeat(Duration::from_millis(40), 2);
    let (client, mut server, mut conn) = connected_client(config).await;
    let (recorder, mut events) = event_recorder();
    client
        .on_shared(EventKind::Reconnecting, recorder)
        .await
        .unwrap();

    let ping = conn.recv_json_timeout(WAIT).await.expect("heartbeat ping");
    assert_eq!(ping, json!({"type": "ping"}));

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Reconnecting { attempt: 1, .. }
    ));
    let _replacement = server.accept_timeout(WAIT).await.expect("replacement socket");
    wait_connected(&client).await;
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_acks_keep_the_socket_alive() {
    let config = fast_config(3).with_heartbeat(Duration::from_millis(40), 2);
    let (client, server, mut conn) = connected_client(config).await;

    for _ in 0..6 {
        let ping = conn.recv_json_timeout(WAIT).await.expect("ping");
        assert_eq!(ping, json!({"type": "ping"}));
        conn.send_json(&json!({"type": "pong"})).unwrap();
    }

    assert_eq!(server.connect_count(), 1);
    assert!(client.is_connected().await);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_send_requires_a_connection() {
    let (client, _server) = mock_client(fast_config(1));
    let err = client
        .send_raw_message(OutboundMessage::user("hello"))
        .await
        .unwrap_err();
    assert_eq!(err, LiveError::NotConnected);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_send_stamps_id_and_timestamp() {
    let (client, _server, mut conn) = connected_client(fast_config(1)).await;

    let id = client
        .send_raw_message(OutboundMessage::user("hello"))
        .await
        .unwrap();
    let wire = conn.recv_json_timeout(WAIT).await.expect("message frame");

    assert!(id.starts_with("msg_"), "id: {id}");
    assert_eq!(wire["id"], json!(id));
    assert_eq!(wire["type"], json!("user"));
    assert_eq!(wire["content"], json!("hello"));
    assert!(wire["timestamp"].is_string());
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_frames_are_classified_or_reported() {
    let (client, _server, conn) = connected_client(fast_config(1)).await;
    let (recorder, mut events) = event_recorder();
    for kind in [EventKind::Message, EventKind::Error] {
        client.on_shared(kind, recorder.clone()).await.unwrap();
    }

    conn.send_json(&json!({
        "type": "alerts",
        "content": "[{\"id\":\"a1\",\"severity\":\"critical\"}]"
    }))
    .unwrap();
    conn.send_text("{not json").unwrap();
    conn.send_json(&json!({"id": "m1", "type": "agent", "content": "hi"}))
        .unwrap();

    match next_event(&mut events).await {
        TransportEvent::Message(InboundMessage::Push(update)) => {
            assert_eq!(update.topic, PushTopic::Alerts);
            assert_eq!(update.content[0]["id"], json!("a1"));
        }
        other => panic!("expected push, got {other:?}"),
    }
    match next_event(&mut events).await {
        TransportEvent::Error(err) => {
            assert_eq!(err.content, "Failed to parse message from backend")
        }
        other => panic!("expected parse error, got {other:?}"),
    }
    let agent = wait_for_event(&mut events, |e| {
        matches!(e, TransportEvent::Message(InboundMessage::Agent(_)))
    })
    .await;
    if let TransportEvent::Message(InboundMessage::Agent(message)) = agent {
        assert_eq!(message.content, "hi");
    }
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_count_traffic() {
    let (client, _server, conn) = connected_client(fast_config(1)).await;
    conn.send_json(&json!({"id": "m1", "type": "agent", "content": "hi"}))
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while client.stats().await.unwrap().messages == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message counted");
    client.shutdown().await.unwrap();
}
