//! Typed views of the live-data payloads.
//!
//! Subscriptions deliver `serde_json::Value`; these records are for consumers that want to
//! decode it. Enumerated fields stay strings so an unexpected value never drops a payload.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealTimeMetrics {
    pub timestamp: String,
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub disk: f64,
    pub agents: Vec<AgentMetrics>,
    pub errors: Vec<ErrorMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentPerformance {
    pub response_time: f64,
    pub success_rate: f64,
    pub throughput: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentResources {
    pub cpu: f64,
    pub memory: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentMetrics {
    pub id: String,
    pub name: String,
    /// `active | idle | error | offline`.
    pub status: String,
    pub last_seen: String,
    pub performance: AgentPerformance,
    pub resources: AgentResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorMetrics {
    pub timestamp: String,
    /// `error | warning | info`.
    pub level: String,
    pub service: String,
    pub message: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectResources {
    pub allocated: f64,
    pub used: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectMetrics {
    pub id: String,
    pub name: String,
    /// `active | paused | completed | error`.
    pub status: String,
    pub progress: f64,
    pub resources: ProjectResources,
    pub last_activity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceHealth {
    pub name: String,
    /// `up | down | degraded`.
    pub status: String,
    pub response_time: f64,
    pub uptime: f64,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Alert {
    pub id: String,
    /// `low | medium | high | critical`.
    pub severity: String,
    pub title: String,
    pub description: String,
    pub timestamp: String,
    pub acknowledged: bool,
}

impl Alert {
    pub fn is_critical(&self) -> bool {
        self.severity == "critical"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemHealth {
    /// `healthy | degraded | critical`.
    pub overall: String,
    pub services: Vec<ServiceHealth>,
    pub alerts: Vec<Alert>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn health_payload_decodes_nested_records() {
        let health: SystemHealth = serde_json::from_value(json!({
            "overall": "degraded",
            "services": [{"name": "api", "status": "up", "responseTime": 12.5}],
            "alerts": [{"id": "a1", "severity": "critical", "acknowledged": false}],
        }))
        .unwrap();
        assert_eq!(health.services[0].response_time, 12.5);
        assert!(health.alerts[0].is_critical());
        assert!(health.timestamp.is_empty());
    }
}
