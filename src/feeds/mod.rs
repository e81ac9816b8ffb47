//! Consumer-facing feeds: one endpoint, one subscription, state published on a `watch` channel.

mod actions;
mod dashboard;
mod entities;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::debug;

pub use actions::RealTimeActions;
pub use dashboard::DashboardFeeds;
pub use entities::{AgentMetricsFeed, AlertFilter, AlertsFeed, SystemHealthFeed};

use crate::core::{LiveError, LiveResult};
use crate::live::{LiveDataService, SubscriptionId, SubscriptionOptions};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

/// Snapshot of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedState<T> {
    /// Last payload that decoded; kept across later errors.
    pub data: Option<T>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// A subscription is active.
    pub is_connected: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl<T> Default for FeedState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
            is_connected: false,
            last_update: None,
        }
    }
}

/// Typed view of one live endpoint.
///
/// The owner calls [`stop`](Self::stop) when done; dropping the feed leaves the subscription
/// running until the service shuts down.
pub struct LiveFeed<D, T: WsTransport = TungsteniteTransport> {
    service: LiveDataService<T>,
    endpoint: String,
    options: SubscriptionOptions,
    state: Arc<watch::Sender<FeedState<D>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    enabled: AtomicBool,
    _payload: PhantomData<fn() -> D>,
}

impl<D, T> LiveFeed<D, T>
where
    D: DeserializeOwned + Send + Sync + 'static,
    T: WsTransport,
{
    pub fn new(
        service: LiveDataService<T>,
        endpoint: impl Into<String>,
        options: SubscriptionOptions,
    ) -> Self {
        let (state, _) = watch::channel(FeedState::default());
        Self {
            service,
            endpoint: endpoint.into(),
            options,
            state: Arc::new(state),
            subscription: Mutex::new(None),
            enabled: AtomicBool::new(true),
            _payload: PhantomData,
        }
    }

    /// A disabled feed ignores [`start`](Self::start) until [`resume`](Self::resume).
    pub fn with_enabled(self, enabled: bool) -> Self {
        self.set_enabled(enabled);
        self
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn watch(&self) -> watch::Receiver<FeedState<D>> {
        self.state.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().last_update
    }

    pub async fn start(&self) -> LiveResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut slot = self.subscription.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        self.state.send_modify(|state| {
            state.is_loading = true;
            state.error = None;
        });

        let result = self
            .service
            .subscribe(self.endpoint.clone(), self.data_handler(), self.feed_options())
            .await;
        match result {
            Ok(id) => {
                debug!(endpoint = %self.endpoint, subscription = %id, "feed started");
                *slot = Some(id);
                self.state.send_modify(|state| state.is_connected = true);
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.state.send_modify(|state| {
                    state.error = Some(message);
                    state.is_loading = false;
                });
                Err(err)
            }
        }
    }

    pub async fn stop(&self) -> LiveResult<()> {
        let Some(id) = self.subscription.lock().await.take() else {
            return Ok(());
        };
        self.state.send_modify(|state| state.is_connected = false);
        self.service.unsubscribe(&id).await?;
        debug!(endpoint = %self.endpoint, subscription = %id, "feed stopped");
        Ok(())
    }

    pub async fn pause(&self) -> LiveResult<()> {
        self.enabled.store(false, Ordering::Release);
        self.stop().await
    }

    pub async fn resume(&self) -> LiveResult<()> {
        self.enabled.store(true, Ordering::Release);
        self.start().await
    }

    /// Recreate the subscription so the immediate fetch runs again. No-op when stopped.
    pub async fn refresh(&self) -> LiveResult<()> {
        if self.subscription.lock().await.is_none() {
            return Ok(());
        }
        self.stop().await?;
        self.start().await
    }

    fn feed_options(&self) -> SubscriptionOptions {
        let mut options = self.options.clone();
        options.immediate = true;

        let state = self.state.clone();
        let user_on_error = options.on_error.take();
        options.on_error = Some(Arc::new(move |err: &LiveError| {
            let message = err.to_string();
            state.send_modify(|s| {
                s.error = Some(message);
                s.is_loading = false;
            });
            if let Some(on_error) = user_on_error.as_ref() {
                on_error(err);
            }
        }));
        options
    }

    fn data_handler(&self) -> impl Fn(Value) + Send + Sync + 'static {
        let state = self.state.clone();
        let on_error = self.options.on_error.clone();
        let endpoint = self.endpoint.clone();
        move |value| match serde_json::from_value::<D>(value) {
            Ok(data) => state.send_modify(|s| {
                s.data = Some(data);
                s.is_loading = false;
                s.error = None;
                s.last_update = Some(Utc::now());
            }),
            Err(err) => {
                let err = LiveError::from(err);
                debug!(endpoint = %endpoint, error = %err, "feed payload did not decode");
                let message = err.to_string();
                state.send_modify(|s| {
                    s.error = Some(message);
                    s.is_loading = false;
                });
                if let Some(on_error) = on_error.as_ref() {
                    on_error(&err);
                }
            }
        }
    }
}

impl<D, T> LiveFeed<D, T>
where
    D: DeserializeOwned + Clone + Send + Sync + 'static,
    T: WsTransport,
{
    pub fn data(&self) -> Option<D> {
        self.state.borrow().data.clone()
    }

    pub fn snapshot(&self) -> FeedState<D> {
        self.state.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_feed_state_is_loading_and_disconnected() {
        let state: FeedState<Vec<u32>> = FeedState::default();
        assert!(state.is_loading);
        assert!(!state.is_connected);
        assert!(state.data.is_none());
        assert!(state.last_update.is_none());
    }
}
