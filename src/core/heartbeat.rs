use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::time::Instant;

use super::frame::WsFrame;

/// Application heartbeat understood by the agent backend.
pub const HEARTBEAT_PING: &str = r#"{"type":"ping"}"#;

/// Frames longer than this are never heartbeat acknowledgements, so they skip the type probe.
const MAX_ACK_FRAME_BYTES: usize = 256;

/// Result emitted by heartbeat strategies when processing inbound frames.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatResult {
    /// Regular traffic; continue normal handling.
    NotHeartbeat,
    /// Heartbeat acknowledgement, with round-trip time when a ping was outstanding.
    Ack(Option<Duration>),
    /// The peer pinged us; send this frame back.
    Reply(WsFrame),
}

/// Heartbeat and liveness contract used by the transport actor.
pub trait HeartbeatStrategy: Send + Sync + 'static {
    fn create_ping(&mut self) -> Option<WsFrame>;
    fn handle_inbound(&mut self, frame: &WsFrame) -> HeartbeatResult;
    /// Returns how long the connection has been silent once that exceeds the liveness window.
    fn is_stale(&self) -> Option<Duration>;
    fn reset(&mut self);
    fn interval(&self) -> Duration;
}

impl HeartbeatStrategy for Box<dyn HeartbeatStrategy> {
    fn create_ping(&mut self) -> Option<WsFrame> {
        (**self).create_ping()
    }

    fn handle_inbound(&mut self, frame: &WsFrame) -> HeartbeatResult {
        (**self).handle_inbound(frame)
    }

    fn is_stale(&self) -> Option<Duration> {
        (**self).is_stale()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn interval(&self) -> Duration {
        (**self).interval()
    }
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Whether a data frame is an application-level heartbeat acknowledgement.
pub fn is_heartbeat_ack(payload: &[u8]) -> bool {
    if payload.len() > MAX_ACK_FRAME_BYTES {
        return false;
    }
    match sonic_rs::from_slice::<TypeTag>(payload) {
        Ok(TypeTag { kind: Some(kind) }) => kind == "pong" || kind == "heartbeat_ack",
        _ => false,
    }
}

/// JSON heartbeat with an explicit liveness deadline.
///
/// Sends `{"type":"ping"}` every `interval`. Any inbound frame counts as proof of life; if
/// nothing arrives for `missed_intervals` consecutive intervals the connection is reported stale
/// so the actor can tear it down and reconnect instead of waiting on the socket's own close.
pub struct JsonHeartbeat {
    interval: Duration,
    missed_intervals: u32,
    last_ping: Option<Instant>,
    last_inbound: Instant,
}

impl JsonHeartbeat {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_MISSED_INTERVALS: u32 = 3;

    pub fn new(interval: Duration, missed_intervals: u32) -> Self {
        Self {
            interval,
            missed_intervals: missed_intervals.max(1),
            last_ping: None,
            last_inbound: Instant::now(),
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.interval.saturating_mul(self.missed_intervals)
    }

    fn rtt(&mut self, now: Instant) -> Option<Duration> {
        self.last_ping
            .take()
            .map(|sent| now.saturating_duration_since(sent))
    }
}

impl Default for JsonHeartbeat {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_MISSED_INTERVALS)
    }
}

impl HeartbeatStrategy for JsonHeartbeat {
    fn create_ping(&mut self) -> Option<WsFrame> {
        self.last_ping = Some(Instant::now());
        Some(WsFrame::Text(Bytes::from_static(HEARTBEAT_PING.as_bytes())))
    }

    fn handle_inbound(&mut self, frame: &WsFrame) -> HeartbeatResult {
        let now = Instant::now();
        self.last_inbound = now;
        match frame {
            WsFrame::Pong(_) => HeartbeatResult::Ack(self.rtt(now)),
            WsFrame::Ping(payload) => HeartbeatResult::Reply(WsFrame::Pong(payload.clone())),
            WsFrame::Text(payload) | WsFrame::Binary(payload) if is_heartbeat_ack(payload) => {
                HeartbeatResult::Ack(self.rtt(now))
            }
            _ => HeartbeatResult::NotHeartbeat,
        }
    }

    fn is_stale(&self) -> Option<Duration> {
        let silent_for = self.last_inbound.elapsed();
        (silent_for > self.liveness_window()).then_some(silent_for)
    }

    fn reset(&mut self) {
        self.last_ping = None;
        self.last_inbound = Instant::now();
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
