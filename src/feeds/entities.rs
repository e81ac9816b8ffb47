use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::warn;

use super::LiveFeed;
use crate::core::LiveResult;
use crate::live::{
    AGENT_METRICS_ENDPOINT, AGENT_METRICS_INTERVAL, ALERTS_ENDPOINT, ALERTS_INTERVAL,
    AgentMetrics, Alert, LiveDataService, PROJECT_METRICS_ENDPOINT, PROJECT_METRICS_INTERVAL,
    ProjectMetrics, RealTimeMetrics, SYSTEM_HEALTH_ENDPOINT, SYSTEM_HEALTH_INTERVAL,
    SYSTEM_METRICS_ENDPOINT, SYSTEM_METRICS_INTERVAL, SubscriptionOptions, SystemHealth,
};
use crate::transport::WsTransport;

fn with_default_interval(
    mut options: SubscriptionOptions,
    interval: std::time::Duration,
) -> SubscriptionOptions {
    options.interval.get_or_insert(interval);
    options
}

fn is_critical(alert: &Value) -> bool {
    alert.get("severity").and_then(Value::as_str) == Some("critical")
}

fn is_acknowledged(alert: &Value) -> bool {
    alert
        .get("acknowledged")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn retain_array(value: Value, keep: impl Fn(&Value) -> bool) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().filter(|item| keep(item)).collect()),
        other => other,
    }
}

fn has_id(item: &Value, id: &str) -> bool {
    item.get("id").and_then(Value::as_str) == Some(id)
}

impl<T: WsTransport> LiveFeed<RealTimeMetrics, T> {
    pub fn system_metrics(service: LiveDataService<T>, options: SubscriptionOptions) -> Self {
        LiveFeed::new(
            service,
            SYSTEM_METRICS_ENDPOINT,
            with_default_interval(options, SYSTEM_METRICS_INTERVAL),
        )
    }
}

impl<T: WsTransport> LiveFeed<Vec<ProjectMetrics>, T> {
    /// All projects, or only `project_id` via `/api/projects/{id}/metrics`.
    pub fn project_metrics(
        service: LiveDataService<T>,
        project_id: Option<&str>,
        options: SubscriptionOptions,
    ) -> Self {
        let mut options = with_default_interval(options, PROJECT_METRICS_INTERVAL);
        let endpoint = match project_id {
            Some(id) => {
                if options.transform.is_none() {
                    let keep = id.to_string();
                    options = options.transform(move |value| retain_array(value, |p| has_id(p, &keep)));
                }
                if options.filter.is_none() {
                    let wanted = id.to_string();
                    options = options.filter(move |value| {
                        value
                            .as_array()
                            .is_some_and(|items| items.iter().any(|p| has_id(p, &wanted)))
                    });
                }
                format!("/api/projects/{id}/metrics")
            }
            None => PROJECT_METRICS_ENDPOINT.to_string(),
        };
        LiveFeed::new(service, endpoint, options)
    }
}

/// Agent metrics plus a selected agent.
pub struct AgentMetricsFeed<T: WsTransport> {
    feed: LiveFeed<Vec<AgentMetrics>, T>,
    selected: Mutex<Option<String>>,
}

impl<T: WsTransport> AgentMetricsFeed<T> {
    pub fn new(service: LiveDataService<T>, options: SubscriptionOptions) -> Self {
        Self {
            feed: LiveFeed::new(
                service,
                AGENT_METRICS_ENDPOINT,
                with_default_interval(options, AGENT_METRICS_INTERVAL),
            ),
            selected: Mutex::new(None),
        }
    }

    pub fn feed(&self) -> &LiveFeed<Vec<AgentMetrics>, T> {
        &self.feed
    }

    pub fn agents(&self) -> Vec<AgentMetrics> {
        self.feed.data().unwrap_or_default()
    }

    pub fn select_agent(&self, agent_id: Option<&str>) {
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) =
            agent_id.map(str::to_string);
    }

    /// The selected agent when it is present in the latest payload.
    pub fn selected_agent(&self) -> Option<AgentMetrics> {
        let selected = self
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        self.agents().into_iter().find(|agent| agent.id == selected)
    }
}

/// Detailed system health, optionally trimmed to critical alerts.
pub struct SystemHealthFeed<T: WsTransport> {
    feed: LiveFeed<SystemHealth, T>,
    critical_only: Arc<AtomicBool>,
}

impl<T: WsTransport> SystemHealthFeed<T> {
    pub fn new(
        service: LiveDataService<T>,
        critical_alerts_only: bool,
        options: SubscriptionOptions,
    ) -> Self {
        let critical_only = Arc::new(AtomicBool::new(critical_alerts_only));
        let mut options = with_default_interval(options, SYSTEM_HEALTH_INTERVAL);
        if options.transform.is_none() {
            let critical_only = critical_only.clone();
            options = options.transform(move |mut health| {
                if critical_only.load(Ordering::Acquire) {
                    if let Some(alerts) = health.get_mut("alerts") {
                        let all = alerts.take();
                        *alerts = retain_array(all, is_critical);
                    }
                }
                health
            });
        }
        Self {
            feed: LiveFeed::new(service, SYSTEM_HEALTH_ENDPOINT, options),
            critical_only,
        }
    }

    pub fn feed(&self) -> &LiveFeed<SystemHealth, T> {
        &self.feed
    }

    pub fn system_health(&self) -> Option<SystemHealth> {
        self.feed.data()
    }

    pub fn critical_alerts_only(&self) -> bool {
        self.critical_only.load(Ordering::Acquire)
    }

    /// Applies from the next payload on.
    pub fn set_critical_alerts_only(&self, critical_only: bool) {
        self.critical_only.store(critical_only, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertFilter {
    #[default]
    All = 0,
    Unacknowledged = 1,
    Critical = 2,
}

impl AlertFilter {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AlertFilter::Unacknowledged,
            2 => AlertFilter::Critical,
            _ => AlertFilter::All,
        }
    }

    fn keeps(self, alert: &Value) -> bool {
        match self {
            AlertFilter::All => true,
            AlertFilter::Unacknowledged => !is_acknowledged(alert),
            AlertFilter::Critical => is_critical(alert),
        }
    }
}

/// Alert list with a switchable filter and acknowledge action.
pub struct AlertsFeed<T: WsTransport> {
    feed: LiveFeed<Vec<Alert>, T>,
    service: LiveDataService<T>,
    filter: Arc<AtomicU8>,
}

impl<T: WsTransport> AlertsFeed<T> {
    pub fn new(
        service: LiveDataService<T>,
        filter: AlertFilter,
        options: SubscriptionOptions,
    ) -> Self {
        let filter = Arc::new(AtomicU8::new(filter as u8));
        let mut options = with_default_interval(options, ALERTS_INTERVAL);
        if options.transform.is_none() {
            let filter = filter.clone();
            options = options.transform(move |alerts| {
                let current = AlertFilter::from_u8(filter.load(Ordering::Acquire));
                retain_array(alerts, |alert| current.keeps(alert))
            });
        }
        Self {
            feed: LiveFeed::new(service.clone(), ALERTS_ENDPOINT, options),
            service,
            filter,
        }
    }

    pub fn feed(&self) -> &LiveFeed<Vec<Alert>, T> {
        &self.feed
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.feed.data().unwrap_or_default()
    }

    pub fn filter(&self) -> AlertFilter {
        AlertFilter::from_u8(self.filter.load(Ordering::Acquire))
    }

    /// Applies from the next payload on.
    pub fn set_filter(&self, filter: AlertFilter) {
        self.filter.store(filter as u8, Ordering::Release);
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.alerts().iter().filter(|a| !a.acknowledged).count()
    }

    pub fn critical_count(&self) -> usize {
        self.alerts().iter().filter(|a| a.is_critical()).count()
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> LiveResult<()> {
        let result = self.service.acknowledge_alert(alert_id).await;
        if let Err(err) = &result {
            warn!(alert_id, error = %err, "failed to acknowledge alert");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn alert_filters_select_by_flag_and_severity() {
        let alerts = json!([
            {"id": "a1", "severity": "critical", "acknowledged": false},
            {"id": "a2", "severity": "low", "acknowledged": true},
            {"id": "a3", "severity": "high", "acknowledged": false},
        ]);

        let ids = |value: Value| -> Vec<String> {
            value
                .as_array()
                .unwrap()
                .iter()
                .map(|a| a["id"].as_str().unwrap().to_string())
                .collect()
        };

        let unacked = retain_array(alerts.clone(), |a| AlertFilter::Unacknowledged.keeps(a));
        assert_eq!(ids(unacked), ["a1", "a3"]);
        let critical = retain_array(alerts.clone(), |a| AlertFilter::Critical.keeps(a));
        assert_eq!(ids(critical), ["a1"]);
        assert_eq!(ids(retain_array(alerts, |a| AlertFilter::All.keeps(a))).len(), 3);
    }

    #[test]
    fn filter_round_trips_through_its_tag() {
        for filter in [AlertFilter::All, AlertFilter::Unacknowledged, AlertFilter::Critical] {
            assert_eq!(AlertFilter::from_u8(filter as u8), filter);
        }
    }

    #[test]
    fn non_array_payloads_pass_through() {
        assert_eq!(retain_array(json!({"x": 1}), |_| false), json!({"x": 1}));
    }
}
