//! Live data subscriptions fed by transport pushes, with REST polling as the fallback.
//!
//! [`LiveDataService`] is a cloneable handle. Subscription bookkeeping lives in a
//! [`LiveDataActor`]; transport events reach it through an ordered channel pump so listener
//! callbacks never wait on the actor.

mod actor;
pub mod records;
pub mod source;
pub mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use kameo::prelude::{Actor, ActorRef};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use actor::{LiveDataActor, LiveStatus};
pub use records::{
    AgentMetrics, AgentPerformance, AgentResources, Alert, ErrorMetrics, ProjectMetrics,
    ProjectResources, RealTimeMetrics, ServiceHealth, SystemHealth,
};
pub use source::{DataFuture, DataSource, HttpDataSource, HttpSourceConfig};
pub use subscription::{SubscriptionId, SubscriptionOptions};

use actor::{GetStatus, LiveDataActorArgs, Subscribe, TransportSignal, Unsubscribe, UnsubscribeAll};
use crate::client::{EventKind, ListenerId, TransportClient, TransportEvent, actor_error};
use crate::core::{LiveError, LiveResult, OutboundMessage};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

pub const SYSTEM_METRICS_ENDPOINT: &str = "/api/metrics/system";
pub const AGENT_METRICS_ENDPOINT: &str = "/api/agents/metrics";
pub const PROJECT_METRICS_ENDPOINT: &str = "/api/projects/metrics";
pub const SYSTEM_HEALTH_ENDPOINT: &str = "/api/health/detailed";
pub const ALERTS_ENDPOINT: &str = "/api/alerts";

pub const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_millis(2000);
pub const AGENT_METRICS_INTERVAL: Duration = Duration::from_millis(3000);
pub const PROJECT_METRICS_INTERVAL: Duration = Duration::from_millis(5000);
pub const SYSTEM_HEALTH_INTERVAL: Duration = Duration::from_millis(10000);
pub const ALERTS_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct LiveServiceConfig {
    /// Period of the `{"type":"heartbeat"}` system notice sent while connected.
    pub heartbeat_interval: Duration,
    /// Poll period for subscriptions that do not set one.
    pub default_poll_interval: Duration,
}

impl Default for LiveServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            default_poll_interval: Duration::from_millis(5000),
        }
    }
}

struct ServiceInner<T: WsTransport> {
    actor: ActorRef<LiveDataActor>,
    client: TransportClient<T>,
    source: Arc<dyn DataSource>,
    listeners: Mutex<Vec<ListenerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Cloneable handle to the live data layer.
pub struct LiveDataService<T: WsTransport = TungsteniteTransport> {
    inner: Arc<ServiceInner<T>>,
}

impl<T: WsTransport> Clone for LiveDataService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

const FORWARDED_EVENTS: [EventKind; 4] = [
    EventKind::Message,
    EventKind::Connected,
    EventKind::Reconnecting,
    EventKind::Disconnected,
];

impl<T: WsTransport> LiveDataService<T> {
    /// Wire the service to `client`, ask it to connect and start the service heartbeat.
    pub async fn init(
        config: LiveServiceConfig,
        client: TransportClient<T>,
        source: Arc<dyn DataSource>,
    ) -> LiveResult<Self> {
        // Listeners go in before the state snapshot so no transition is missed; a duplicate
        // `Connected` is harmless.
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let mut listeners = Vec::with_capacity(FORWARDED_EVENTS.len());
        for kind in FORWARDED_EVENTS {
            let tx = events_tx.clone();
            let id = client
                .on(kind, move |event: &TransportEvent| {
                    let _ = tx.send(event.clone());
                })
                .await?;
            listeners.push(id);
        }
        drop(events_tx);

        let connected = client.is_connected().await;
        let actor = LiveDataActor::spawn(LiveDataActorArgs {
            source: source.clone(),
            default_interval: config.default_poll_interval,
            connected,
        });

        let pump = tokio::spawn(pump_events(events_rx, actor.clone()));
        let service = Self {
            inner: Arc::new(ServiceInner {
                actor,
                client,
                source,
                listeners: Mutex::new(listeners),
                tasks: Mutex::new(vec![pump]),
                closed: AtomicBool::new(false),
            }),
        };

        if let Err(err) = service.inner.client.connect().await {
            let _ = service.shutdown().await;
            return Err(err);
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            service.inner.client.clone(),
            config.heartbeat_interval,
        ));
        service.track(heartbeat);

        info!(connected, "live data service started");
        Ok(service)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn ensure_open(&self) -> LiveResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LiveError::InvalidState(
                "live data service is shut down".to_string(),
            ));
        }
        Ok(())
    }

    pub fn client(&self) -> &TransportClient<T> {
        &self.inner.client
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.inner.source
    }

    /// Deliver data for `endpoint` to `callback` until unsubscribed.
    pub async fn subscribe(
        &self,
        endpoint: impl Into<String>,
        callback: impl Fn(Value) + Send + Sync + 'static,
        options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        self.ensure_open()?;
        self.inner
            .actor
            .ask(Subscribe {
                endpoint: endpoint.into(),
                callback: Arc::new(callback),
                options,
            })
            .await
            .map_err(actor_error)
    }

    /// `false` when `id` is unknown or already removed.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> LiveResult<bool> {
        if !self.inner.actor.is_alive() {
            return Ok(false);
        }
        self.inner
            .actor
            .ask(Unsubscribe(id.clone()))
            .await
            .map_err(actor_error)
    }

    pub async fn status(&self) -> LiveResult<LiveStatus> {
        self.inner.actor.ask(GetStatus).await.map_err(actor_error)
    }

    pub async fn connection_status(&self) -> bool {
        self.inner.client.is_connected().await
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.status().await.map(|s| s.subscriptions).unwrap_or(0)
    }

    pub async fn subscribe_to_system_metrics(
        &self,
        callback: impl Fn(RealTimeMetrics) + Send + Sync + 'static,
        options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        self.subscribe_typed(SYSTEM_METRICS_ENDPOINT, SYSTEM_METRICS_INTERVAL, callback, options)
            .await
    }

    pub async fn subscribe_to_agent_metrics(
        &self,
        callback: impl Fn(Vec<AgentMetrics>) + Send + Sync + 'static,
        options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        self.subscribe_typed(AGENT_METRICS_ENDPOINT, AGENT_METRICS_INTERVAL, callback, options)
            .await
    }

    pub async fn subscribe_to_project_metrics(
        &self,
        callback: impl Fn(Vec<ProjectMetrics>) + Send + Sync + 'static,
        options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        self.subscribe_typed(PROJECT_METRICS_ENDPOINT, PROJECT_METRICS_INTERVAL, callback, options)
            .await
    }

    pub async fn subscribe_to_system_health(
        &self,
        callback: impl Fn(SystemHealth) + Send + Sync + 'static,
        options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        self.subscribe_typed(SYSTEM_HEALTH_ENDPOINT, SYSTEM_HEALTH_INTERVAL, callback, options)
            .await
    }

    pub async fn subscribe_to_alerts(
        &self,
        callback: impl Fn(Vec<Alert>) + Send + Sync + 'static,
        options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        self.subscribe_typed(ALERTS_ENDPOINT, ALERTS_INTERVAL, callback, options)
            .await
    }

    /// Always fetches immediately; payloads that do not decode into `R` go to `on_error`.
    async fn subscribe_typed<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        interval: Duration,
        callback: impl Fn(R) + Send + Sync + 'static,
        mut options: SubscriptionOptions,
    ) -> LiveResult<SubscriptionId> {
        options.immediate = true;
        options.interval.get_or_insert(interval);
        let on_error = options.on_error.clone();
        let name = endpoint.to_string();

        self.subscribe(
            endpoint,
            move |value| match serde_json::from_value::<R>(value) {
                Ok(record) => callback(record),
                Err(err) => {
                    let err = LiveError::from(err);
                    warn!(endpoint = %name, error = %err, "live payload did not decode");
                    if let Some(on_error) = on_error.as_ref() {
                        on_error(&err);
                    }
                }
            },
            options,
        )
        .await
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> LiveResult<()> {
        self.inner
            .source
            .post(&format!("/api/alerts/{alert_id}/acknowledge"), None)
            .await?;
        self.notify(json!({"type": "alert_acknowledged", "alertId": alert_id}))
            .await;
        Ok(())
    }

    pub async fn restart_agent(&self, agent_id: &str) -> LiveResult<()> {
        self.inner
            .source
            .post(&format!("/api/agents/{agent_id}/restart"), None)
            .await?;
        self.notify(json!({"type": "agent_restart", "agentId": agent_id}))
            .await;
        Ok(())
    }

    pub async fn update_project_configuration(
        &self,
        project_id: &str,
        config: Value,
    ) -> LiveResult<()> {
        self.inner
            .source
            .put(&format!("/api/projects/{project_id}/config"), config.clone())
            .await?;
        self.notify(json!({
            "type": "project_config_updated",
            "projectId": project_id,
            "config": config,
        }))
        .await;
        Ok(())
    }

    /// Best-effort system notice; skipped while disconnected.
    async fn notify(&self, notice: Value) {
        if !self.inner.client.is_connected().await {
            return;
        }
        if let Err(err) = self
            .inner
            .client
            .send_raw_message(OutboundMessage::system_notice(&notice))
            .await
        {
            debug!(error = %err, "system notice not sent");
        }
    }

    /// Drop every subscription, stop background tasks and disconnect the transport.
    /// Later calls return `Ok(())` without doing anything.
    pub async fn shutdown(&self) -> LiveResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let listeners = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in listeners {
            let _ = self.inner.client.off(id).await;
        }

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }

        if self.inner.actor.is_alive() {
            let cancelled = self.inner.actor.ask(UnsubscribeAll).await.unwrap_or(0);
            let _ = self.inner.actor.stop_gracefully().await;
            self.inner.actor.wait_for_shutdown().await;
            debug!(subscriptions = cancelled, "live data actor stopped");
        }

        self.inner.client.disconnect().await?;
        info!("live data service shut down");
        Ok(())
    }
}

/// Forward transport events to the actor in emission order.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    actor: ActorRef<LiveDataActor>,
) {
    while let Some(event) = events.recv().await {
        if actor.tell(TransportSignal(event)).send().await.is_err() {
            break;
        }
    }
}

async fn heartbeat_loop<T: WsTransport>(client: TransportClient<T>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !client.is_connected().await {
            continue;
        }
        let notice = json!({"type": "heartbeat", "timestamp": Utc::now().to_rfc3339()});
        if let Err(err) = client
            .send_raw_message(OutboundMessage::system_notice(&notice))
            .await
        {
            debug!(error = %err, "service heartbeat not sent");
        }
    }
}
