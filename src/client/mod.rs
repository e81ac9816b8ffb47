//! Reconnecting WebSocket client for the agent backend.
//!
//! [`TransportClient`] is a cloneable handle; all state lives in a [`TransportActor`].

mod actor;
pub mod events;
pub mod writer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kameo::actor::ActorRef;
use kameo::error::SendError;
use kameo::prelude::Actor;
use tokio::sync::watch;

pub use actor::{
    AddListener, Connect, Disconnect, GetConnectionState, GetConnectionStats, RemoveListener,
    SendFrame, SendRaw, TransportActor, TransportActorArgs, WatchConnectionState,
};
pub use events::{EventKind, EventListener, ListenerId, TransportErrorEvent, TransportEvent};

use crate::core::{
    ConnectionState, ConnectionStats, FixedDelayReconnect, HeartbeatStrategy, JsonHeartbeat,
    LiveError, LiveResult, OutboundMessage, ReconnectStrategy, WebSocketBufferConfig,
    WsTlsConfig,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

/// Connection settings for a transport actor.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    /// Name used in logs instead of the URL.
    pub label: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Silent heartbeat intervals tolerated before the socket is considered half-open.
    pub heartbeat_missed_intervals: u32,
    pub tls: WsTlsConfig,
    pub buffers: WebSocketBufferConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8081".to_string(),
            label: None,
            reconnect_attempts: FixedDelayReconnect::DEFAULT_MAX_ATTEMPTS,
            reconnect_delay: FixedDelayReconnect::DEFAULT_DELAY,
            heartbeat_interval: JsonHeartbeat::DEFAULT_INTERVAL,
            heartbeat_missed_intervals: JsonHeartbeat::DEFAULT_MISSED_INTERVALS,
            tls: WsTlsConfig::default(),
            buffers: WebSocketBufferConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, missed_intervals: u32) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_missed_intervals = missed_intervals;
        self
    }

    /// Actor arguments using the fixed-delay reconnect and JSON heartbeat strategies.
    pub fn into_args<T: WsTransport>(self, transport: T) -> TransportActorArgs<T> {
        TransportActorArgs {
            reconnect: Box::new(FixedDelayReconnect::new(
                self.reconnect_delay,
                self.reconnect_attempts,
            )),
            heartbeat: Box::new(JsonHeartbeat::new(
                self.heartbeat_interval,
                self.heartbeat_missed_intervals,
            )),
            url: self.url,
            label: self.label,
            tls: self.tls,
            buffers: self.buffers,
            transport,
        }
    }
}

impl<T: WsTransport> TransportActorArgs<T> {
    pub fn with_reconnect_strategy(mut self, strategy: impl ReconnectStrategy) -> Self {
        self.reconnect = Box::new(strategy);
        self
    }

    pub fn with_heartbeat_strategy(mut self, strategy: impl HeartbeatStrategy) -> Self {
        self.heartbeat = Box::new(strategy);
        self
    }
}

pub(crate) fn actor_error<M, E: fmt::Display>(err: SendError<M, E>) -> LiveError {
    LiveError::ActorError(err.to_string())
}

fn flatten_error<M>(err: SendError<M, LiveError>) -> LiveError {
    match err {
        SendError::HandlerError(err) => err,
        other => actor_error(other),
    }
}

/// Cloneable handle to a running [`TransportActor`].
pub struct TransportClient<T: WsTransport = TungsteniteTransport> {
    actor: ActorRef<TransportActor<T>>,
}

impl<T: WsTransport> Clone for TransportClient<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl TransportClient<TungsteniteTransport> {
    /// Spawn a client over tokio-tungstenite. Nothing connects until [`connect`](Self::connect).
    pub fn spawn(config: TransportConfig) -> Self {
        Self::spawn_with(config, TungsteniteTransport::default())
    }
}

impl<T: WsTransport> TransportClient<T> {
    pub fn spawn_with(config: TransportConfig, transport: T) -> Self {
        Self::spawn_with_args(config.into_args(transport))
    }

    pub fn spawn_with_args(args: TransportActorArgs<T>) -> Self {
        Self {
            actor: TransportActor::spawn(args),
        }
    }

    pub fn actor_ref(&self) -> &ActorRef<TransportActor<T>> {
        &self.actor
    }

    /// Start connecting. Returns once the attempt is under way; the outcome arrives as a
    /// `Connected`, `Error` or `Reconnecting` event. A no-op while connected or connecting.
    pub async fn connect(&self) -> LiveResult<()> {
        self.actor.ask(Connect).await.map_err(flatten_error)
    }

    /// Close the socket and drop every listener. Completes after teardown.
    pub async fn disconnect(&self) -> LiveResult<()> {
        self.actor.ask(Disconnect).await.map_err(actor_error)
    }

    /// Send a chat-style message, returning the generated message id.
    pub async fn send_raw_message(&self, message: OutboundMessage) -> LiveResult<String> {
        self.actor.ask(SendRaw(message)).await.map_err(flatten_error)
    }

    pub(crate) async fn send_frame(&self, frame: String) -> LiveResult<()> {
        self.actor.ask(SendFrame(frame)).await.map_err(flatten_error)
    }

    pub async fn on(
        &self,
        kind: EventKind,
        listener: impl EventListener,
    ) -> LiveResult<ListenerId> {
        self.on_shared(kind, Arc::new(listener)).await
    }

    pub async fn on_shared(
        &self,
        kind: EventKind,
        listener: Arc<dyn EventListener>,
    ) -> LiveResult<ListenerId> {
        self.actor
            .ask(AddListener { kind, listener })
            .await
            .map_err(actor_error)
    }

    pub async fn off(&self, id: ListenerId) -> LiveResult<bool> {
        self.actor
            .ask(RemoveListener(id))
            .await
            .map_err(actor_error)
    }

    pub async fn state(&self) -> LiveResult<ConnectionState> {
        self.actor.ask(GetConnectionState).await.map_err(actor_error)
    }

    /// `false` when the actor is gone.
    pub async fn is_connected(&self) -> bool {
        matches!(self.state().await, Ok(ConnectionState::Connected))
    }

    /// Receiver that follows every state change, including across `disconnect`.
    pub async fn watch_state(&self) -> LiveResult<watch::Receiver<ConnectionState>> {
        self.actor
            .ask(WatchConnectionState)
            .await
            .map_err(flatten_error)
    }

    pub async fn stats(&self) -> LiveResult<ConnectionStats> {
        self.actor.ask(GetConnectionStats).await.map_err(actor_error)
    }

    /// Disconnect and stop the actor.
    pub async fn shutdown(&self) -> LiveResult<()> {
        if self.actor.is_alive() {
            self.disconnect().await?;
            let _ = self.actor.stop_gracefully().await;
            self.actor.wait_for_shutdown().await;
        }
        Ok(())
    }
}
