#![allow(dead_code)]

use std::time::Duration;

use agent_live::client::{TransportClient, TransportConfig, TransportEvent};
use agent_live::testing::{MockConnection, MockServer, MockTransport, mock_client};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

/// Short reconnect delay, default heartbeat.
pub fn fast_config(reconnect_attempts: u32) -> TransportConfig {
    TransportConfig::new("ws://mock").with_reconnect(reconnect_attempts, Duration::from_millis(20))
}

/// Spawn a client, connect it and take the server side of the socket.
pub async fn connected_client(
    config: TransportConfig,
) -> (TransportClient<MockTransport>, MockServer, MockConnection) {
    let (client, mut server) = mock_client(config);
    client.connect().await.expect("connect");
    let conn = server.accept_timeout(WAIT).await.expect("connection accepted");
    wait_connected(&client).await;
    (client, server, conn)
}

pub async fn wait_connected(client: &TransportClient<MockTransport>) {
    tokio::time::timeout(WAIT, async {
        while !client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client connected");
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("event before timeout")
        .expect("recorder alive")
}

/// Skip events until one matches.
pub async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}
