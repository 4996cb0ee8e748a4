//! Response envelopes handed to the consumer
//!
//! Every unit of work, successful or not, reaches the UI as one envelope.
//! The constructors are the only way to build one, so exactly one of `data`
//! and `error` is ever present.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use resilience::{CallError, CircuitState};

use crate::message::ValidationError;

/// Value of `metadata.source` on every envelope
pub const ENVELOPE_SOURCE: &str = "extension";

/// Consumer-facing error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StructuredError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: None,
        }
    }

    /// Adds a context entry
    pub fn with_context<V: Serialize>(mut self, key: impl Into<String>, value: V) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.context
                .get_or_insert_with(serde_json::Map::new)
                .insert(key.into(), value);
        }
        self
    }

    /// Payload for a call the breaker refused or that failed under it
    ///
    /// Blocked calls carry the breaker state and, when open, `retryInMs` so
    /// the consumer can offer a timed retry.
    pub fn from_call_error<E: std::fmt::Display>(err: &CallError<E>, state: CircuitState) -> Self {
        let error = StructuredError::new(err.code(), err.to_string());
        if !err.is_blocked() {
            return error;
        }

        let error = error.with_context("breakerState", state);
        match err.retry_in() {
            Some(retry_in) => error.with_context("retryInMs", retry_in.as_millis() as u64),
            None => error,
        }
    }
}

impl From<&ValidationError> for StructuredError {
    fn from(err: &ValidationError) -> Self {
        StructuredError::new(err.code.clone(), err.message.clone()).with_context("input", &err.input)
    }
}

/// Envelope metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub version: String,
}

impl EnvelopeMetadata {
    pub fn new(session_id: Option<&str>, version: &str) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            source: ENVELOPE_SOURCE.to_string(),
            session_id: session_id.map(str::to_string),
            version: version.to_string(),
        }
    }
}

/// The unit handed to the consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope<T> {
    request_id: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StructuredError>,
    metadata: EnvelopeMetadata,
}

impl<T> ResponseEnvelope<T> {
    /// Successful envelope carrying `data`
    pub fn success(request_id: impl Into<String>, data: T, metadata: EnvelopeMetadata) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    /// Failed envelope carrying `error`
    pub fn failure(request_id: impl Into<String>, error: StructuredError, metadata: EnvelopeMetadata) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error),
            metadata,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&StructuredError> {
        self.error.as_ref()
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    /// Splits the envelope into its payload
    pub fn into_result(self) -> std::result::Result<T, StructuredError> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            // Unreachable through the constructors
            (None, None) => Err(StructuredError::new("EMPTY_ENVELOPE", "envelope carries neither data nor error")),
        }
    }
}
