use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kameo::Reply;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::source::DataSource;
use crate::core::{LiveError, PushTopic, generate_id};

pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&LiveError) + Send + Sync>;

/// `sub_<unix millis>_<9 base36 chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Reply)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(generate_id("sub"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a subscription is fed and what it does with each payload.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Fetch once over REST right away.
    pub immediate: bool,
    /// Poll period; the service default applies when unset.
    pub interval: Option<Duration>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub transform: Option<Transform>,
    pub filter: Option<Filter>,
    pub on_error: Option<ErrorCallback>,
    /// Push topic to listen on instead of inferring it from the endpoint.
    pub topic: Option<PushTopic>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            immediate: false,
            interval: None,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            transform: None,
            filter: None,
            on_error: None,
            topic: None,
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("immediate", &self.immediate)
            .field("interval", &self.interval)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("transform", &self.transform.is_some())
            .field("filter", &self.filter.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("topic", &self.topic)
            .finish()
    }
}

impl SubscriptionOptions {
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn transform(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn filter(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&LiveError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn topic(mut self, topic: PushTopic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Transform first, then filter the transformed value.
    pub fn apply(&self, data: Value) -> Option<Value> {
        let data = match self.transform.as_ref() {
            Some(transform) => transform(data),
            None => data,
        };
        match self.filter.as_ref() {
            Some(filter) if !filter(&data) => None,
            _ => Some(data),
        }
    }

    pub(crate) fn matches_topic(&self, topic: PushTopic, endpoint: &str) -> bool {
        match self.topic {
            Some(explicit) => explicit == topic,
            None => topic.matches_endpoint(endpoint),
        }
    }
}

/// Everything a poll task needs, detached from the actor.
#[derive(Clone)]
pub(crate) struct PollContext {
    pub id: SubscriptionId,
    pub endpoint: String,
    pub callback: DataCallback,
    pub options: SubscriptionOptions,
    pub interval: Duration,
    pub active: Arc<AtomicBool>,
    pub source: Arc<dyn DataSource>,
}

impl PollContext {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deliver(&self, data: Value) {
        if !self.is_active() {
            return;
        }
        if let Some(data) = self.options.apply(data) {
            (self.callback)(data);
        }
    }

    fn report(&self, err: &LiveError) {
        if !self.is_active() {
            return;
        }
        if let Some(on_error) = self.options.on_error.as_ref() {
            on_error(err);
        }
    }

    /// One fetch with inline linear retries. Never overlaps with another fetch of the same
    /// subscription because the poll loop awaits it.
    pub(crate) async fn fetch_with_retry(&self) {
        let mut attempt: u32 = 0;
        loop {
            if !self.is_active() {
                return;
            }
            match self.source.get(&self.endpoint).await {
                Ok(data) => {
                    self.deliver(data);
                    return;
                }
                Err(err) if attempt < self.options.retry_count => {
                    attempt += 1;
                    let delay = self.options.retry_delay.saturating_mul(attempt);
                    debug!(
                        subscription = %self.id,
                        endpoint = %self.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        subscription = %self.id,
                        endpoint = %self.endpoint,
                        attempts = attempt + 1,
                        error = %err,
                        "polling error"
                    );
                    self.report(&err);
                    return;
                }
            }
        }
    }
}

/// Spawn the poll loop. With `immediate`, the first fetch runs before the first tick.
pub(crate) fn spawn_poller(ctx: PollContext, immediate: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        if immediate {
            ctx.fetch_with_retry().await;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + ctx.interval, ctx.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !ctx.is_active() {
                break;
            }
            ctx.fetch_with_retry().await;
        }
    })
}

/// Spawn a single REST fetch, used for `immediate` on push-fed subscriptions.
pub(crate) fn spawn_fetch_once(ctx: PollContext) -> JoinHandle<()> {
    tokio::spawn(async move { ctx.fetch_with_retry().await })
}
