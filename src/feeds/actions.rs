use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::{error, info};

use crate::core::LiveResult;
use crate::live::LiveDataService;
use crate::transport::WsTransport;

/// Service actions with execution tracking.
pub struct RealTimeActions<T: WsTransport> {
    service: LiveDataService<T>,
    in_flight: AtomicUsize,
    last_action: Mutex<Option<String>>,
}

/// Decrements the in-flight count even when the action future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: WsTransport> RealTimeActions<T> {
    pub fn new(service: LiveDataService<T>) -> Self {
        Self {
            service,
            in_flight: AtomicUsize::new(0),
            last_action: Mutex::new(None),
        }
    }

    pub fn is_executing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    pub fn last_action(&self) -> Option<String> {
        self.last_action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `action` under `name`, logging the outcome.
    pub async fn execute_action<F>(&self, name: impl Into<String>, action: F) -> LiveResult<()>
    where
        F: Future<Output = LiveResult<()>>,
    {
        self.execute_action_with(name, || {}, action).await
    }

    /// Like [`execute_action`](Self::execute_action), applying `optimistic` before the action runs.
    pub async fn execute_action_with<F>(
        &self,
        name: impl Into<String>,
        optimistic: impl FnOnce(),
        action: F,
    ) -> LiveResult<()>
    where
        F: Future<Output = LiveResult<()>>,
    {
        let name = name.into();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlight(&self.in_flight);
        *self
            .last_action
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(name.clone());

        optimistic();
        match action.await {
            Ok(()) => {
                info!(action = %name, "action completed");
                Ok(())
            }
            Err(err) => {
                error!(action = %name, error = %err, "action failed");
                Err(err)
            }
        }
    }

    pub async fn restart_agent(&self, agent_id: &str) -> LiveResult<()> {
        self.execute_action(
            format!("restart-agent-{agent_id}"),
            self.service.restart_agent(agent_id),
        )
        .await
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> LiveResult<()> {
        self.execute_action(
            format!("acknowledge-alert-{alert_id}"),
            self.service.acknowledge_alert(alert_id),
        )
        .await
    }

    pub async fn update_project_config(&self, project_id: &str, config: Value) -> LiveResult<()> {
        self.execute_action(
            format!("update-project-{project_id}"),
            self.service.update_project_configuration(project_id, config),
        )
        .await
    }
}
