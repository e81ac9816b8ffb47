//! Wire messages exchanged with the agent backend.
//!
//! Field names are camelCase on the wire. Payloads the client layer does not interpret stay as
//! `serde_json::Value`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{LiveError, LiveResult};

const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `<prefix>_<unix millis>_<9 base36 chars>`.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{prefix}_{}_{suffix}", Utc::now().timestamp_millis())
}

/// Id attached to every outbound message and correlated request.
pub fn generate_message_id() -> String {
    generate_id("msg")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Agent,
    System,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Chat-style frame used for raw sends and unsolicited backend messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// An `AgentMessage` before the transport stamps its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub content: String,
    pub agent_name: Option<String>,
    pub metadata: Option<MessageMetadata>,
    pub attachments: Option<Vec<Attachment>>,
    pub priority: Option<Priority>,
}

impl OutboundMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            agent_name: None,
            metadata: None,
            attachments: None,
            priority: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, content)
    }

    /// System message whose content is a JSON-encoded notice, e.g. `{"type":"heartbeat",...}`.
    pub fn system_notice(notice: &Value) -> Self {
        Self::new(MessageKind::System, notice.to_string())
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn stamp(self, id: String, timestamp: DateTime<Utc>) -> AgentMessage {
        AgentMessage {
            id,
            kind: self.kind,
            content: self.content,
            timestamp,
            agent_name: self.agent_name,
            metadata: self.metadata,
            attachments: self.attachments,
            priority: self.priority,
        }
    }
}

/// Named backend operations reachable through the request correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    CreateSession,
    GetSession,
    DeleteSession,
    CreateAgent,
    GetAgent,
    ListAgents,
    UpdateAgent,
    DeleteAgent,
    SendMessage,
    GetSuggestions,
    GetAgentStatus,
    GetSystemHealth,
}

impl AgentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentAction::CreateSession => "create_session",
            AgentAction::GetSession => "get_session",
            AgentAction::DeleteSession => "delete_session",
            AgentAction::CreateAgent => "create_agent",
            AgentAction::GetAgent => "get_agent",
            AgentAction::ListAgents => "list_agents",
            AgentAction::UpdateAgent => "update_agent",
            AgentAction::DeleteAgent => "delete_agent",
            AgentAction::SendMessage => "send_message",
            AgentAction::GetSuggestions => "get_suggestions",
            AgentAction::GetAgentStatus => "get_agent_status",
            AgentAction::GetSystemHealth => "get_system_health",
        }
    }

    /// Error text used when the backend rejects without saying why.
    pub fn failure_message(self) -> &'static str {
        match self {
            AgentAction::CreateSession => "Failed to create agent session",
            AgentAction::GetSession => "Failed to get session",
            AgentAction::DeleteSession => "Failed to delete session",
            AgentAction::CreateAgent => "Failed to create agent",
            AgentAction::GetAgent => "Failed to get agent",
            AgentAction::ListAgents => "Failed to list agents",
            AgentAction::UpdateAgent => "Failed to update agent",
            AgentAction::DeleteAgent => "Failed to delete agent",
            AgentAction::SendMessage => "Failed to send message to agent",
            AgentAction::GetSuggestions => "Failed to get suggestions",
            AgentAction::GetAgentStatus => "Failed to get agent status",
            AgentAction::GetSystemHealth => "Failed to get system health",
        }
    }
}

/// Correlated request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub request_id: String,
    pub action: AgentAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub data: Value,
}

/// Correlated response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub request_id: String,
    #[serde(default)]
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Logical type tag carried by push updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushTopic {
    SystemMetrics,
    AgentUpdates,
    ProjectUpdates,
    Alerts,
}

impl PushTopic {
    pub const ALL: [PushTopic; 4] = [
        PushTopic::SystemMetrics,
        PushTopic::AgentUpdates,
        PushTopic::ProjectUpdates,
        PushTopic::Alerts,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            PushTopic::SystemMetrics => "system_metrics",
            PushTopic::AgentUpdates => "agent_updates",
            PushTopic::ProjectUpdates => "project_updates",
            PushTopic::Alerts => "alerts",
        }
    }

    /// REST endpoints whose data this topic pushes.
    pub fn rest_prefixes(self) -> &'static [&'static str] {
        match self {
            PushTopic::SystemMetrics => &["/api/metrics/system"],
            PushTopic::AgentUpdates => &["/api/agents"],
            PushTopic::ProjectUpdates => &["/api/projects"],
            PushTopic::Alerts => &["/api/alerts"],
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.wire_name() == name)
    }

    /// Whether a subscription on `endpoint` is fed by this topic.
    pub fn matches_endpoint(self, endpoint: &str) -> bool {
        endpoint.contains(self.wire_name())
            || self
                .rest_prefixes()
                .iter()
                .any(|prefix| endpoint.starts_with(prefix))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub topic: PushTopic,
    pub content: Value,
}

/// Classified inbound data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Agent(AgentMessage),
    Push(PushUpdate),
    Response(AgentResponse),
    Other(Value),
}

/// Decode and classify one inbound JSON frame.
pub fn decode_inbound(payload: &[u8]) -> LiveResult<InboundMessage> {
    let value: Value = sonic_rs::from_slice(payload)?;
    classify(value)
}

fn classify(value: Value) -> LiveResult<InboundMessage> {
    if let Value::Object(map) = &value {
        if map.contains_key("requestId") && map.contains_key("success") {
            let response: AgentResponse = serde_json::from_value(value)?;
            return Ok(InboundMessage::Response(response));
        }

        let topic = map
            .get("type")
            .and_then(Value::as_str)
            .and_then(PushTopic::from_wire);
        if let Some(topic) = topic {
            let content = match map.get("content") {
                Some(Value::String(encoded)) => serde_json::from_str(encoded).map_err(|err| {
                    LiveError::ParseFailed(format!("{} content: {err}", topic.wire_name()))
                })?,
                Some(structured) => structured.clone(),
                None => Value::Null,
            };
            return Ok(InboundMessage::Push(PushUpdate { topic, content }));
        }
    }

    match serde_json::from_value::<AgentMessage>(value.clone()) {
        Ok(message) => Ok(InboundMessage::Agent(message)),
        Err(_) => Ok(InboundMessage::Other(value)),
    }
}
