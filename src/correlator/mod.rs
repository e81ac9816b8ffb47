//! Request/response correlation over the transport.
//!
//! Each request carries a `requestId`; the backend echoes it in its response. Pending requests
//! live in a [`PendingTable`] shared with a transport listener, which completes them on a
//! matching response and fails them all when the connection drops.

mod models;
mod pending;

pub use models::*;
pub use pending::{PendingExpired, PendingInsertOutcome, PendingTable};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::client::{EventKind, ListenerId, TransportClient, TransportEvent};
use crate::core::{
    AgentAction, AgentRequest, AgentResponse, ConnectionState, InboundMessage, LiveError,
    LiveResult, generate_message_id,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

type Waiter = oneshot::Sender<LiveResult<AgentResponse>>;
type SharedTable = Arc<Mutex<PendingTable<Waiter>>>;

#[derive(Debug, Clone, Copy)]
pub struct CorrelatorConfig {
    pub request_timeout: Duration,
    pub max_pending: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_pending: 1024,
        }
    }
}

fn lock(table: &SharedTable) -> MutexGuard<'_, PendingTable<Waiter>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fail_all(table: &SharedTable, reason: &str) {
    let drained = lock(table).drain();
    if drained.is_empty() {
        return;
    }
    debug!(pending = drained.len(), reason, "failing pending requests");
    for (_, waiter) in drained {
        let _ = waiter.send(Err(LiveError::Disconnected));
    }
}

fn route_event(table: &SharedTable, event: &TransportEvent) {
    match event {
        TransportEvent::Message(InboundMessage::Response(response)) => {
            let waiter = lock(table).complete(&response.request_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(Ok(response.clone()));
                }
                None => debug!(
                    request_id = %response.request_id,
                    "response for unknown or expired request dropped"
                ),
            }
        }
        TransportEvent::Reconnecting { .. } => fail_all(table, "reconnecting"),
        TransportEvent::Disconnected { .. } => fail_all(table, "disconnected"),
        _ => {}
    }
}

/// Resolves once the transport is anywhere but `Connected`, or the actor is gone.
async fn connection_lost(mut state: watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|state| *state != ConnectionState::Connected)
        .await;
}

/// Correlated request API over a [`TransportClient`].
pub struct RequestCorrelator<T: WsTransport = TungsteniteTransport> {
    client: TransportClient<T>,
    config: CorrelatorConfig,
    pending: SharedTable,
    listeners: Vec<ListenerId>,
    state: watch::Receiver<ConnectionState>,
}

impl<T: WsTransport> RequestCorrelator<T> {
    /// Register the response and connection-loss listeners on `client`.
    ///
    /// `TransportClient::disconnect` drops all listeners, so a correlator must be attached again
    /// after a manual disconnect; use [`close`](Self::close) to do both sides at once. Requests
    /// in flight during the disconnect still fail with `Disconnected`: each waiter also follows
    /// the transport's state channel, which outlives the listeners.
    pub async fn attach(client: TransportClient<T>, config: CorrelatorConfig) -> LiveResult<Self> {
        let pending: SharedTable = Arc::new(Mutex::new(PendingTable::new(config.max_pending)));
        let mut listeners = Vec::with_capacity(3);
        for kind in [
            EventKind::Message,
            EventKind::Reconnecting,
            EventKind::Disconnected,
        ] {
            let table = pending.clone();
            let id = client
                .on(kind, move |event: &TransportEvent| route_event(&table, event))
                .await?;
            listeners.push(id);
        }
        let state = client.watch_state().await?;

        Ok(Self {
            client,
            config,
            pending,
            listeners,
            state,
        })
    }

    pub fn client(&self) -> &TransportClient<T> {
        &self.client
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Remove this correlator's listeners and fail whatever is still pending.
    pub async fn detach(&self) -> LiveResult<()> {
        for id in &self.listeners {
            self.client.off(*id).await?;
        }
        fail_all(&self.pending, "detached");
        Ok(())
    }

    /// Fail pending requests, then disconnect the transport.
    pub async fn close(&self) -> LiveResult<()> {
        fail_all(&self.pending, "closed");
        self.client.disconnect().await
    }

    /// Build an envelope with a fresh request id and send it.
    pub async fn request(
        &self,
        action: AgentAction,
        session_id: Option<&str>,
        agent_id: Option<&str>,
        data: Value,
    ) -> LiveResult<AgentResponse> {
        let request = AgentRequest {
            request_id: generate_message_id(),
            action,
            session_id: session_id.map(str::to_string),
            agent_id: agent_id.map(str::to_string),
            data,
        };
        self.send_agent_request(request).await
    }

    /// Send an envelope and wait for the response with the same request id.
    ///
    /// A response with `success: false` becomes `LiveError::Backend` carrying the backend's
    /// error text, or the action's default failure message.
    pub async fn send_agent_request(&self, request: AgentRequest) -> LiveResult<AgentResponse> {
        let action = request.action;
        let request_id = request.request_id.clone();
        let encoded = sonic_rs::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let now = Instant::now();
            let mut table = lock(&self.pending);
            let sweep_due = table.next_deadline().is_some_and(|deadline| deadline <= now);
            let expired = if sweep_due { table.expire_due(now) } else { Vec::new() };
            for expired in expired {
                debug!(
                    request_id = %expired.request_id,
                    age_ms = expired.age.as_millis() as u64,
                    "sweeping orphaned request"
                );
                let _ = expired
                    .waiter
                    .send(Err(LiveError::timeout(format!("{} request", action.as_str()))));
            }
            match table.insert(request_id.clone(), now + self.config.request_timeout, tx) {
                (PendingInsertOutcome::Inserted, _) => {}
                (PendingInsertOutcome::TooManyPending, _) => return Err(LiveError::TooManyPending),
                (PendingInsertOutcome::Duplicate, _) => {
                    return Err(LiveError::InvalidState(format!(
                        "request id {request_id} already in flight"
                    )));
                }
            }
        }

        if let Err(err) = self.client.send_frame(encoded).await {
            lock(&self.pending).complete(&request_id);
            return Err(err);
        }

        let waited = tokio::select! {
            biased;
            waited = tokio::time::timeout(self.config.request_timeout, rx) => waited,
            () = connection_lost(self.state.clone()) => {
                lock(&self.pending).complete(&request_id);
                debug!(request_id = %request_id, action = action.as_str(), "connection lost while waiting");
                return Err(LiveError::Disconnected);
            }
        };

        let response = match waited {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(LiveError::Disconnected),
            Err(_) => {
                lock(&self.pending).complete(&request_id);
                debug!(request_id = %request_id, action = action.as_str(), "request timed out");
                return Err(LiveError::timeout(format!("{} request", action.as_str())));
            }
        };

        if response.success {
            Ok(response)
        } else {
            Err(LiveError::Backend(
                response
                    .error
                    .unwrap_or_else(|| action.failure_message().to_string()),
            ))
        }
    }

    async fn request_data<R: DeserializeOwned>(
        &self,
        action: AgentAction,
        session_id: Option<&str>,
        agent_id: Option<&str>,
        data: Value,
    ) -> LiveResult<R> {
        let response = self.request(action, session_id, agent_id, data).await?;
        Ok(serde_json::from_value(response.data.unwrap_or(Value::Null))?)
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        context: HashMap<String, String>,
        config: Option<SessionConfig>,
    ) -> LiveResult<AgentSession> {
        let data = json!({ "userId": user_id, "context": context, "config": config });
        self.request_data(AgentAction::CreateSession, None, None, data)
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> LiveResult<SessionDetails> {
        self.request_data(AgentAction::GetSession, Some(session_id), None, json!({}))
            .await
    }

    pub async fn delete_session(&self, session_id: &str) -> LiveResult<()> {
        self.request(AgentAction::DeleteSession, Some(session_id), None, json!({}))
            .await
            .map(|_| ())
    }

    pub async fn create_agent(
        &self,
        session_id: &str,
        agent_type: &str,
        config: Option<AgentConfig>,
        context: HashMap<String, String>,
    ) -> LiveResult<CreatedAgent> {
        let data = json!({ "agentType": agent_type, "config": config, "context": context });
        self.request_data(AgentAction::CreateAgent, Some(session_id), None, data)
            .await
    }

    pub async fn get_agent(&self, session_id: &str, agent_id: &str) -> LiveResult<AgentDetails> {
        self.request_data(
            AgentAction::GetAgent,
            Some(session_id),
            Some(agent_id),
            json!({}),
        )
        .await
    }

    pub async fn list_agents(
        &self,
        session_id: &str,
        page_size: u32,
        page_token: Option<&str>,
        filter: Option<&str>,
    ) -> LiveResult<AgentList> {
        let data = json!({ "pageSize": page_size, "pageToken": page_token, "filter": filter });
        self.request_data(AgentAction::ListAgents, Some(session_id), None, data)
            .await
    }

    /// `agent` is a partial update; `update_mask` names the fields to apply.
    pub async fn update_agent(
        &self,
        session_id: &str,
        agent_id: &str,
        agent: Value,
        update_mask: Option<Vec<String>>,
    ) -> LiveResult<SubAgent> {
        let data = json!({ "agent": agent, "updateMask": update_mask });
        self.request_data(AgentAction::UpdateAgent, Some(session_id), Some(agent_id), data)
            .await
    }

    pub async fn delete_agent(&self, session_id: &str, agent_id: &str) -> LiveResult<()> {
        self.request(
            AgentAction::DeleteAgent,
            Some(session_id),
            Some(agent_id),
            json!({}),
        )
        .await
        .map(|_| ())
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        agent_id: &str,
        message: MessageInput,
        options: Option<MessageOptions>,
    ) -> LiveResult<SendMessageResult> {
        let data = json!({ "message": message, "options": options });
        self.request_data(AgentAction::SendMessage, Some(session_id), Some(agent_id), data)
            .await
    }

    pub async fn get_suggestions(
        &self,
        session_id: &str,
        agent_id: &str,
        context: SuggestionContext,
        max_suggestions: u32,
    ) -> LiveResult<SuggestionsResult> {
        let data = json!({ "context": context, "maxSuggestions": max_suggestions });
        self.request_data(
            AgentAction::GetSuggestions,
            Some(session_id),
            Some(agent_id),
            data,
        )
        .await
    }

    pub async fn get_agent_status(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> LiveResult<AgentStatusReport> {
        self.request_data(
            AgentAction::GetAgentStatus,
            Some(session_id),
            Some(agent_id),
            json!({}),
        )
        .await
    }

    pub async fn get_system_health(&self, include_metrics: bool) -> LiveResult<SystemHealthReport> {
        let data = json!({ "includeMetrics": include_metrics });
        self.request_data(AgentAction::GetSystemHealth, None, None, data)
            .await
    }

    pub async fn start_agent_session(
        &self,
        user_id: &str,
        context: HashMap<String, String>,
    ) -> LiveResult<AgentSession> {
        self.create_session(user_id, context, None).await
    }

    /// Create an agent whose config parameters are `config`.
    pub async fn spawn_sub_agent(
        &self,
        session_id: &str,
        agent_type: &str,
        config: HashMap<String, String>,
    ) -> LiveResult<SubAgent> {
        let config = AgentConfig {
            parameters: config,
            ..AgentConfig::default()
        };
        let created = self
            .create_agent(session_id, agent_type, Some(config), HashMap::new())
            .await?;
        Ok(created.agent)
    }

    /// Returns `(response id, response text, suggestions)`.
    pub async fn send_agent_message(
        &self,
        session_id: &str,
        agent_id: &str,
        message: &str,
        context: HashMap<String, String>,
    ) -> LiveResult<(String, String, Vec<AgentSuggestion>)> {
        let options = MessageOptions {
            context: Some(context),
            ..MessageOptions::default()
        };
        let result = self
            .send_message(session_id, agent_id, MessageInput::text(message), Some(options))
            .await?;
        Ok((result.message_id, result.response.content, result.suggestions))
    }

    pub async fn get_agent_suggestions(
        &self,
        session_id: &str,
        agent_id: &str,
        suggestion_type: &str,
        context: HashMap<String, String>,
    ) -> LiveResult<Vec<AgentSuggestion>> {
        let context = SuggestionContext {
            context_type: suggestion_type.to_string(),
            context_data: context,
            tags: None,
        };
        let result = self.get_suggestions(session_id, agent_id, context, 10).await?;
        Ok(result.suggestions)
    }

    pub async fn stop_agent_session(&self, session_id: &str) -> LiveResult<()> {
        self.delete_session(session_id).await
    }
}
