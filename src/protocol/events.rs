//! Transport wire events exchanged between endpoints and the hub.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Message, MessageType, Priority};

/// Events an endpoint emits towards the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Register(RegisterPayload),
    Send(SendPayload),
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Outbound message from a registered endpoint; the sender is the registered identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub to: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// Events the hub pushes to endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Registered(RegisteredPayload),
    Message(Message),
    Sent(SentPayload),
    AgentStatus(AgentStatusPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Registered(_) => "registered",
            ServerEvent::Message(_) => "message",
            ServerEvent::Sent(_) => "sent",
            ServerEvent::AgentStatus(_) => "agent_status",
            ServerEvent::Error(_) => "error",
        }
    }
}

/// Online peer as listed in the `registered` roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub agent_id: String,
    /// Messages flushed from the offline queue on this registration.
    pub queued_messages: usize,
    pub connected_agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SentPayload {
    pub message_id: String,
    pub delivered: bool,
    #[serde(default)]
    pub queued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusPayload {
    pub agent_id: String,
    pub name: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}
