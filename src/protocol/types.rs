//! Message types carried by the relay.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Message type classification.
///
/// Types the relay does not know are carried through unchanged; a blank type
/// on the wire means `task`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageType {
    /// Work request
    #[default]
    Task,
    /// Reply to an earlier message
    Response,
    /// Status update
    Notification,
    /// Question expecting a response
    Query,
    /// Acknowledgment of a tracked task
    TaskAck,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Task => "task",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Query => "query",
            MessageType::TaskAck => "task-ack",
            MessageType::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err("Message type cannot be empty".to_string()),
            "task" => Ok(MessageType::Task),
            "response" => Ok(MessageType::Response),
            "notification" => Ok(MessageType::Notification),
            "query" => Ok(MessageType::Query),
            "task-ack" | "task_ack" => Ok(MessageType::TaskAck),
            _ => Ok(MessageType::Other(trimmed.to_string())),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().is_empty() {
            return Ok(MessageType::default());
        }
        raw.parse().map_err(de::Error::custom)
    }
}

/// Message priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// A relayed message. Immutable once created; delivery state lives in the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    pub from_name: String,
    pub to: String,
    pub to_name: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Short human-readable preview of the content.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = match &self.content {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("message") {
                Some(Value::String(s)) => s.clone(),
                _ => self.content.to_string(),
            },
            other => other.to_string(),
        };
        if text.chars().count() > max_chars {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        } else {
            text
        }
    }
}
