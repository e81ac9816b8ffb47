//! In-memory doubles for exercising the transport and live-data layers without sockets or HTTP.
//!
//! [`MockTransport::channel_pair`] returns the transport for a [`TransportClient`] plus a
//! [`MockServer`] that accepts each connection attempt as a [`MockConnection`]. Tests use the
//! connection to read what the client wrote, push frames, close cleanly or drop the socket.
//! [`MockDataSource`] stands in for the REST backend.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::{EventListener, TransportClient, TransportConfig, TransportEvent};
use crate::core::{
    LiveError, LiveResult, ReconnectStrategy, WebSocketBufferConfig, WsFrame, WsTlsConfig,
};
use crate::live::{DataFuture, DataSource};
use crate::transport::{WsTransport, WsTransportConnectFuture};

type InboundItem = Result<WsFrame, LiveError>;

struct MockShared {
    accept_tx: mpsc::UnboundedSender<MockConnection>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

/// Transport whose connections are in-memory channel pairs.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn channel_pair() -> (Self, MockServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            accept_tx,
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockServer { accept_rx, shared },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        _url: String,
        _buffers: WebSocketBufferConfig,
        _tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = self.shared.clone();
        Box::pin(async move {
            shared.connects.fetch_add(1, Ordering::SeqCst);
            if shared.refuse.load(Ordering::SeqCst) {
                return Err(LiveError::ConnectionFailed(
                    "mock server refused connection".to_string(),
                ));
            }
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            shared
                .accept_tx
                .send(MockConnection {
                    outbound_rx,
                    inbound_tx: Some(inbound_tx),
                })
                .map_err(|_| LiveError::ConnectionFailed("mock server is gone".to_string()))?;
            Ok((MockReader { rx: inbound_rx }, MockWriter { outbound_tx }))
        })
    }
}

/// Test-side handle paired with [`MockTransport`].
pub struct MockServer {
    accept_rx: mpsc::UnboundedReceiver<MockConnection>,
    shared: Arc<MockShared>,
}

impl MockServer {
    /// Wait for the next connection attempt to be accepted.
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.accept_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.accept_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Accepted connections not yet taken by [`accept`](Self::accept).
    pub fn try_accept(&mut self) -> Option<MockConnection> {
        self.accept_rx.try_recv().ok()
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    SocketDropped,
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("client side of the mock socket is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server side of one accepted connection.
pub struct MockConnection {
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<InboundItem>>,
}

impl MockConnection {
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next outbound text frame parsed as JSON; control frames are skipped.
    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.recv_outbound_timeout(remaining).await?;
            if let Some(text) = frame.as_text() {
                return serde_json::from_str(text).ok();
            }
        }
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::text(text))
    }

    pub fn send_json(&self, value: &Value) -> Result<(), MockServerError> {
        self.send_text(value.to_string())
    }

    /// Send a close frame; code 1000 is a clean close.
    pub fn close(&self, code: u16, reason: &'static str) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::close(code, reason.as_bytes()))
    }

    /// Surface a read error on the client's reader.
    pub fn fail(&self, error: impl Into<String>) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(LiveError::TransportError {
            context: "mock_transport_read",
            error: error.into(),
        }))
        .map_err(|_| MockServerError::ChannelClosed)
    }

    /// End the inbound stream without a close frame.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

pub struct MockReader {
    rx: mpsc::UnboundedReceiver<InboundItem>,
}

impl futures_util::Stream for MockReader {
    type Item = InboundItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

pub struct MockWriter {
    outbound_tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = LiveError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .outbound_tx
            .send(item)
            .map_err(|_| LiveError::TransportError {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Reconnect strategy that never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn next_delay(&mut self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    fn reset(&mut self) {}

    fn should_retry(&self, _attempts: u32) -> bool {
        false
    }
}

/// Spawn a client over a fresh [`MockTransport`].
pub fn mock_client(config: TransportConfig) -> (TransportClient<MockTransport>, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    (TransportClient::spawn_with(config, transport), server)
}

/// Listener that forwards every event it sees into a channel. Register it for as many kinds
/// as needed with `on_shared`.
pub fn event_recorder() -> (Arc<dyn EventListener>, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |event: &TransportEvent| {
        let _ = tx.send(event.clone());
    };
    (Arc::new(listener), rx)
}

/// One call observed by [`MockDataSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub method: &'static str,
    pub endpoint: String,
    pub body: Option<Value>,
    pub at: Instant,
}

#[derive(Default)]
struct MockDataState {
    scripted: HashMap<String, VecDeque<LiveResult<Value>>>,
    standing: HashMap<String, LiveResult<Value>>,
    calls: Vec<MockCall>,
    latency: Option<Duration>,
}

/// Scripted REST backend.
///
/// Responses queued with [`respond_once`](Self::respond_once) are used first, then the standing
/// response set with [`respond`](Self::respond). Unknown endpoints answer HTTP 404.
#[derive(Clone, Default)]
pub struct MockDataSource {
    state: Arc<Mutex<MockDataState>>,
}

impl MockDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockDataState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn respond(&self, endpoint: impl Into<String>, value: Value) -> &Self {
        self.lock().standing.insert(endpoint.into(), Ok(value));
        self
    }

    pub fn fail(&self, endpoint: impl Into<String>, error: LiveError) -> &Self {
        self.lock().standing.insert(endpoint.into(), Err(error));
        self
    }

    pub fn respond_once(&self, endpoint: impl Into<String>, result: LiveResult<Value>) -> &Self {
        self.lock()
            .scripted
            .entry(endpoint.into())
            .or_default()
            .push_back(result);
        self
    }

    /// Delay every response by `latency`.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        self.lock().latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .count()
    }

    fn answer(&self, method: &'static str, endpoint: &str, body: Option<Value>) -> DataFuture {
        let (result, latency) = {
            let mut state = self.lock();
            state.calls.push(MockCall {
                method,
                endpoint: endpoint.to_string(),
                body,
                at: Instant::now(),
            });
            let scripted = state
                .scripted
                .get_mut(endpoint)
                .and_then(VecDeque::pop_front);
            let result = scripted
                .or_else(|| state.standing.get(endpoint).cloned())
                .unwrap_or_else(|| {
                    Err(LiveError::Http {
                        status: 404,
                        message: format!("no mock response for {endpoint}"),
                    })
                });
            (result, state.latency)
        };
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            result
        })
    }
}

impl DataSource for MockDataSource {
    fn get(&self, endpoint: &str) -> DataFuture {
        self.answer("GET", endpoint, None)
    }

    fn post(&self, endpoint: &str, body: Option<Value>) -> DataFuture {
        self.answer("POST", endpoint, body)
    }

    fn put(&self, endpoint: &str, body: Value) -> DataFuture {
        self.answer("PUT", endpoint, Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_responses_run_before_standing_ones() {
        let source = MockDataSource::new();
        source
            .respond("/api/alerts", json!([]))
            .respond_once("/api/alerts", Err(LiveError::Request("boom".into())));

        assert!(source.get("/api/alerts").await.is_err());
        assert_eq!(source.get("/api/alerts").await.unwrap(), json!([]));
        assert!(matches!(
            source.get("/api/unknown").await,
            Err(LiveError::Http { status: 404, .. })
        ));
        assert_eq!(source.calls_to("/api/alerts"), 2);
    }

    #[tokio::test]
    async fn refused_connections_are_counted() {
        let (transport, server) = MockTransport::channel_pair();
        server.refuse_connections(true);
        let result = transport
            .connect(
                "ws://mock".to_string(),
                WebSocketBufferConfig::default(),
                WsTlsConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(LiveError::ConnectionFailed(_))));
        assert_eq!(server.connect_count(), 1);
    }
}
