use super::{AgentMetricsFeed, AlertFilter, AlertsFeed, LiveFeed, SystemHealthFeed};
use crate::core::LiveResult;
use crate::live::{LiveDataService, RealTimeMetrics, SubscriptionOptions};
use crate::transport::WsTransport;

/// The feeds behind an operations dashboard, driven together.
pub struct DashboardFeeds<T: WsTransport> {
    pub system_metrics: LiveFeed<RealTimeMetrics, T>,
    pub agents: AgentMetricsFeed<T>,
    pub system_health: SystemHealthFeed<T>,
    pub alerts: AlertsFeed<T>,
    service: LiveDataService<T>,
}

/// Run every step, then report the first failure.
fn first_error(results: [LiveResult<()>; 4]) -> LiveResult<()> {
    results.into_iter().collect()
}

impl<T: WsTransport> DashboardFeeds<T> {
    /// Build the feeds without subscribing; a disabled dashboard waits for `resume_all`.
    pub fn new(service: LiveDataService<T>, enabled: bool) -> Self {
        let dashboard = Self {
            system_metrics: LiveFeed::system_metrics(service.clone(), SubscriptionOptions::default()),
            agents: AgentMetricsFeed::new(service.clone(), SubscriptionOptions::default()),
            system_health: SystemHealthFeed::new(service.clone(), false, SubscriptionOptions::default()),
            alerts: AlertsFeed::new(service.clone(), AlertFilter::All, SubscriptionOptions::default()),
            service,
        };
        dashboard.system_metrics.set_enabled(enabled);
        dashboard.agents.feed().set_enabled(enabled);
        dashboard.system_health.feed().set_enabled(enabled);
        dashboard.alerts.feed().set_enabled(enabled);
        dashboard
    }

    pub async fn start_all(&self) -> LiveResult<()> {
        first_error([
            self.system_metrics.start().await,
            self.agents.feed().start().await,
            self.system_health.feed().start().await,
            self.alerts.feed().start().await,
        ])
    }

    pub async fn stop_all(&self) -> LiveResult<()> {
        first_error([
            self.system_metrics.stop().await,
            self.agents.feed().stop().await,
            self.system_health.feed().stop().await,
            self.alerts.feed().stop().await,
        ])
    }

    pub async fn refresh_all(&self) -> LiveResult<()> {
        first_error([
            self.system_metrics.refresh().await,
            self.agents.feed().refresh().await,
            self.system_health.feed().refresh().await,
            self.alerts.feed().refresh().await,
        ])
    }

    pub async fn pause_all(&self) -> LiveResult<()> {
        first_error([
            self.system_metrics.pause().await,
            self.agents.feed().pause().await,
            self.system_health.feed().pause().await,
            self.alerts.feed().pause().await,
        ])
    }

    pub async fn resume_all(&self) -> LiveResult<()> {
        first_error([
            self.system_metrics.resume().await,
            self.agents.feed().resume().await,
            self.system_health.feed().resume().await,
            self.alerts.feed().resume().await,
        ])
    }

    pub fn is_loading(&self) -> bool {
        self.system_metrics.is_loading()
            || self.agents.feed().is_loading()
            || self.system_health.feed().is_loading()
            || self.alerts.feed().is_loading()
    }

    pub fn has_error(&self) -> bool {
        self.system_metrics.error().is_some()
            || self.agents.feed().error().is_some()
            || self.system_health.feed().error().is_some()
            || self.alerts.feed().error().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.system_metrics.is_connected()
            && self.agents.feed().is_connected()
            && self.system_health.feed().is_connected()
            && self.alerts.feed().is_connected()
    }

    /// Transport state as seen by the live data service, independent of any feed.
    pub async fn connection_status(&self) -> bool {
        self.service.connection_status().await
    }

    pub fn unacknowledged_alerts(&self) -> usize {
        self.alerts.unacknowledged_count()
    }

    pub fn critical_alerts(&self) -> usize {
        self.alerts.critical_count()
    }
}
