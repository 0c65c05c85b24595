//! Message submission: one-shot requests that do not need a live connection.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::protocol::{Message, MessageType, Priority};

/// A request to relay one message.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl SendRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: Value) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            content,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Reject requests missing `from`, `to` or `content`.
    pub fn validate(&self) -> Result<()> {
        if self.from.trim().is_empty() {
            return Err(Error::validation("from is required"));
        }
        if self.to.trim().is_empty() {
            return Err(Error::validation("to is required"));
        }
        match &self.content {
            Value::Null => Err(Error::validation("content is required")),
            Value::String(s) if s.trim().is_empty() => {
                Err(Error::validation("content is required"))
            }
            _ => Ok(()),
        }
    }

    /// Validate and turn the request into a relayable message.
    pub fn into_message(self, from_name: String, to_name: String) -> Result<Message> {
        self.validate()?;
        let content = match self.content {
            Value::String(raw) => parse_content(&raw),
            other => other,
        };
        Ok(Message {
            id: uuid::Uuid::new_v4().to_string(),
            from: self.from.trim().to_string(),
            from_name,
            to: self.to.trim().to_string(),
            to_name,
            message_type: self.message_type.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            subject: self.subject.filter(|s| !s.trim().is_empty()),
            content,
            timestamp: Utc::now(),
        })
    }
}

/// Parse raw content as JSON, wrapping it as `{"message": raw}` when it is not JSON.
pub fn parse_content(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "message": raw }))
}

/// Outcome of a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub message_id: String,
    pub delivered: bool,
    #[serde(default)]
    pub queued: bool,
}

/// Anything that can accept a message for relaying.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, request: SendRequest) -> Result<SubmitReceipt>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_json() {
        assert_eq!(parse_content(r#"{"msg":"hello"}"#), json!({"msg": "hello"}));
    }

    #[test]
    fn test_parse_content_falls_back_to_wrapping() {
        assert_eq!(
            parse_content("pull the latest {skills"),
            json!({"message": "pull the latest {skills"})
        );
    }

    #[test]
    fn test_missing_fields_rejected() {
        let missing_from = SendRequest::new("", "sam", json!("hi"));
        assert!(matches!(missing_from.validate(), Err(Error::Validation(_))));

        let missing_to = SendRequest::new("sybil", "  ", json!("hi"));
        assert!(matches!(missing_to.validate(), Err(Error::Validation(_))));

        let missing_content = SendRequest::new("sybil", "sam", Value::Null);
        assert!(matches!(missing_content.validate(), Err(Error::Validation(_))));

        let blank_content = SendRequest::new("sybil", "sam", json!(""));
        assert!(matches!(blank_content.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_into_message_defaults() {
        let msg = SendRequest::new("sybil", "sam", json!("not json at all"))
            .into_message("Sybil".to_string(), "Sam".to_string())
            .unwrap();

        assert_eq!(msg.message_type, MessageType::Task);
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(msg.content, json!({"message": "not json at all"}));
        assert!(msg.subject.is_none());
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_request_body_shape() {
        let body: SendRequest = serde_json::from_value(json!({
            "from": "sybil",
            "to": "sam",
            "content": {"message": "hi"},
            "type": "query",
            "priority": "urgent"
        }))
        .unwrap();

        assert_eq!(body.message_type, Some(MessageType::Query));
        assert_eq!(body.priority, Some(Priority::Urgent));
        assert!(body.validate().is_ok());
    }
}
