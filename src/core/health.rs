use std::collections::VecDeque;
use std::time::Duration;

use hdrhistogram::Histogram;
use tokio::time::Instant;

use super::types::{ConnectionState, ConnectionStats};

const RECENT_ERROR_CAPACITY: usize = 100;
const MAX_ERROR_TEXT_BYTES: usize = 1024;
/// Heartbeat RTTs above one minute are clamped into the top bucket.
const MAX_TRACKED_RTT_US: u64 = 60_000_000;

#[derive(Debug, Clone)]
struct RecentError {
    at: Instant,
    context: String,
    error: String,
}

/// Cut to at most `MAX_ERROR_TEXT_BYTES` on a char boundary.
fn clip(text: &str) -> String {
    let mut end = text.len().min(MAX_ERROR_TEXT_BYTES);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Connection health owned by the transport actor.
///
/// Counters survive reconnects; uptime and last-message age restart on every successful open.
#[derive(Debug)]
pub struct HealthMonitor {
    connection_started: Instant,
    last_message_received: Instant,
    last_message_sent: Option<Instant>,
    message_count: u64,
    error_count: u64,
    reconnect_count: u64,
    recent_errors: VecDeque<RecentError>,
    rtt_histogram: Option<Histogram<u64>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            connection_started: now,
            last_message_received: now,
            last_message_sent: None,
            message_count: 0,
            error_count: 0,
            reconnect_count: 0,
            recent_errors: VecDeque::with_capacity(RECENT_ERROR_CAPACITY),
            rtt_histogram: Histogram::new_with_bounds(1, MAX_TRACKED_RTT_US, 3).ok(),
        }
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        self.connection_started = now;
        self.last_message_received = now;
    }

    pub fn record_message(&mut self) {
        self.last_message_received = Instant::now();
        self.message_count = self.message_count.saturating_add(1);
    }

    pub fn record_sent(&mut self) {
        self.last_message_sent = Some(Instant::now());
    }

    pub fn record_error(&mut self, context: &str, error: &str) {
        self.error_count = self.error_count.saturating_add(1);
        if self.recent_errors.len() == RECENT_ERROR_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(RecentError {
            at: Instant::now(),
            context: clip(context),
            error: clip(error),
        });
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let micros = (rtt.as_micros().min(MAX_TRACKED_RTT_US as u128) as u64).max(1);
        if let Some(histogram) = self.rtt_histogram.as_mut() {
            let _ = histogram.record(micros);
        }
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    /// Most recent recorded error as `(context, error, age)`.
    pub fn last_error(&self) -> Option<(&str, &str, Duration)> {
        self.recent_errors
            .back()
            .map(|rec| (rec.context.as_str(), rec.error.as_str(), rec.at.elapsed()))
    }

    pub fn get_stats(&self, state: ConnectionState) -> ConnectionStats {
        let (samples, p50, p99) = match self.rtt_histogram.as_ref() {
            Some(h) if h.len() > 0 => (
                h.len(),
                h.value_at_percentile(50.0),
                h.value_at_percentile(99.0),
            ),
            _ => (0, 0, 0),
        };

        ConnectionStats {
            state,
            uptime: self.connection_started.elapsed(),
            messages: self.message_count,
            errors: self.error_count,
            reconnects: self.reconnect_count,
            last_message_age: self.last_message_received.elapsed(),
            last_sent_age: self.last_message_sent.map(|at| at.elapsed()),
            recent_internal_errors: self.recent_errors.len(),
            p50_rtt_us: p50,
            p99_rtt_us: p99,
            rtt_samples: samples,
        }
    }
}
