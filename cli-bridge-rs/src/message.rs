//! Validated chat messages
//!
//! A [`ValidatedMessage`] can only be produced by a constructor that checks
//! it, and exposes no mutation afterwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message kinds as they appear in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
}

/// Severity of a system message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

/// Kind-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    User {
        #[serde(default)]
        files: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Assistant { streaming: bool, is_complete: bool },
    System { level: SystemLevel },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::User { .. } => MessageKind::User,
            MessageBody::Assistant { .. } => MessageKind::Assistant,
            MessageBody::System { .. } => MessageKind::System,
        }
    }
}

/// Rejected input, with a stable code and the offending value
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    pub input: serde_json::Value,
}

impl ValidationError {
    pub const CODE: &'static str = "VALIDATION_ERROR";

    pub fn new(message: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            code: Self::CODE.to_string(),
            message: message.into(),
            input,
        }
    }
}

/// A chat message that passed schema validation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedMessage {
    id: String,
    session_id: String,
    content: String,
    timestamp: i64,
    #[serde(flatten)]
    body: MessageBody,
}

impl ValidatedMessage {
    /// Builds and validates a message with a fresh id
    pub fn new(
        session_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
        body: MessageBody,
        max_content_chars: usize,
    ) -> Result<Self, ValidationError> {
        let message = Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            timestamp,
            body,
        };
        message.check(max_content_chars)?;
        Ok(message)
    }

    /// A system notice stamped with the current time
    pub fn system(
        session_id: impl Into<String>,
        content: impl Into<String>,
        level: SystemLevel,
    ) -> Result<Self, ValidationError> {
        Self::new(
            session_id,
            content,
            chrono::Utc::now().timestamp_millis(),
            MessageBody::System { level },
            usize::MAX,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    fn check(&self, max_content_chars: usize) -> Result<(), ValidationError> {
        let reject = |message: &str| {
            Err(ValidationError::new(
                message,
                serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
            ))
        };

        if self.id.trim().is_empty() {
            return reject("id must not be empty");
        }
        if self.session_id.trim().is_empty() {
            return reject("sessionId must not be empty");
        }
        if self.timestamp < 0 {
            return reject("timestamp must not be negative");
        }
        if self.content.chars().count() > max_content_chars {
            return reject("content exceeds the maximum message size");
        }
        if let MessageBody::User { files } = &self.body {
            if files.iter().any(|f| f.trim().is_empty()) {
                return reject("files must not contain empty paths");
            }
        }
        Ok(())
    }
}
