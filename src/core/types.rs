use std::fmt;
use std::time::Duration;

use kameo::Reply;
use thiserror::Error;

/// Convenience result alias for real-time client operations.
pub type LiveResult<T> = Result<T, LiveError>;

/// Canonical error surface shared across the transport, correlator and live-data layers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LiveError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("WebSocket not connected to agent backend")]
    NotConnected,

    #[error("Connection to agent backend lost")]
    Disconnected,

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Too many pending requests")]
    TooManyPending,

    #[error("{0}")]
    Backend(String),

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Actor error: {0}")]
    ActorError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LiveError {
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Whether the error came from the connection rather than the backend's answer.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LiveError::ConnectionFailed(_)
                | LiveError::TransportError { .. }
                | LiveError::NotConnected
                | LiveError::Disconnected
        )
    }
}

impl From<sonic_rs::Error> for LiveError {
    fn from(err: sonic_rs::Error) -> Self {
        LiveError::ParseFailed(err.to_string())
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        LiveError::ParseFailed(err.to_string())
    }
}

/// Lifecycle state of the single connection owned by the transport actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Reply)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 8 * 1024 * 1024,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// TLS configuration for websocket connections.
///
/// Certificate validation is on unless explicitly disabled for development environments.
#[derive(Clone, Copy, Debug)]
pub struct WsTlsConfig {
    pub validate_certs: bool,
}

impl Default for WsTlsConfig {
    fn default() -> Self {
        Self {
            validate_certs: true,
        }
    }
}

/// Basic connection statistics snapshot.
#[derive(Clone, Debug, Reply)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub uptime: Duration,
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_message_age: Duration,
    pub last_sent_age: Option<Duration>,
    pub recent_internal_errors: usize,
    pub p50_rtt_us: u64,
    pub p99_rtt_us: u64,
    pub rtt_samples: u64,
}

/// Why an established or pending connection went away.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectCause {
    /// The server sent a close frame (or the stream ended without one).
    RemoteClosed { code: Option<u16>, reason: String },
    ReadFailure { error: String },
    WriteFailure { error: String },
    HandshakeFailed { message: String },
    /// No inbound traffic within the heartbeat liveness window.
    LivenessTimeout { silent_for: Duration },
}

impl DisconnectCause {
    /// A close with code 1000 is treated as deliberate and is not retried.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            DisconnectCause::RemoteClosed {
                code: Some(super::frame::CLOSE_NORMAL),
                ..
            }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            DisconnectCause::RemoteClosed { code, reason } => match code {
                Some(code) => format!("remote closed: code={code} reason={reason}"),
                None => format!("remote closed: {reason}"),
            },
            DisconnectCause::ReadFailure { error } => format!("read error: {error}"),
            DisconnectCause::WriteFailure { error } => format!("write error: {error}"),
            DisconnectCause::HandshakeFailed { message } => format!("handshake failed: {message}"),
            DisconnectCause::LivenessTimeout { silent_for } => {
                format!("no inbound traffic for {}ms", silent_for.as_millis())
            }
        }
    }
}

/// Abstract reconnect strategy.
///
/// The attempt ceiling lives in the strategy so the actor only asks whether another attempt
/// is allowed and how long to wait for it.
pub trait ReconnectStrategy: Send + Sync + 'static {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
    /// `attempts` is the number of reconnects already scheduled since the last successful open.
    fn should_retry(&self, attempts: u32) -> bool;
}

impl ReconnectStrategy for Box<dyn ReconnectStrategy> {
    fn next_delay(&mut self) -> Duration {
        (**self).next_delay()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn should_retry(&self, attempts: u32) -> bool {
        (**self).should_retry(attempts)
    }
}
