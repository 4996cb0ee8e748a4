//! Record normalizer
//!
//! Maps framed chunks onto the validated message model. Pure apart from
//! logging: no state is kept between calls.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::framer::{ChunkKind, LogicalChunk, DEFAULT_MAX_MESSAGE_SIZE};
use crate::message::{MessageBody, SystemLevel, ValidatedMessage, ValidationError};

/// Characters of chunk content echoed back in a validation error
const INPUT_PREVIEW_CHARS: usize = 200;

/// How chunks seen before any speaker boundary are presented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Streaming assistant output
    #[default]
    Assistant,
    /// Warning-level system notice
    System,
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub max_message_size: usize,
    pub orphan_policy: OrphanPolicy,
    /// Calls slower than this are logged as warnings
    pub slow_threshold: Duration,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            orphan_policy: OrphanPolicy::default(),
            slow_threshold: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordNormalizer {
    config: NormalizerConfig,
}

impl RecordNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Converts one chunk into a validated message for `session_id`
    pub fn normalize(&self, chunk: &LogicalChunk, session_id: &str) -> Result<ValidatedMessage, ValidationError> {
        let started = Instant::now();
        let result = self.check_chunk(chunk).and_then(|()| self.build(chunk, session_id));
        let elapsed = started.elapsed();

        if elapsed > self.config.slow_threshold {
            warn!(
                correlation_id = %chunk.correlation_id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.slow_threshold.as_millis() as u64,
                "Slow chunk normalization"
            );
        }

        if let Err(err) = &result {
            debug!(
                correlation_id = %chunk.correlation_id,
                session_id = %session_id,
                error = %err,
                "Chunk failed validation"
            );
        }

        result
    }

    /// Normalizes a synthetic chunk; used as a no-op recovery probe
    pub fn health_check(&self) -> Result<(), ValidationError> {
        let probe = LogicalChunk::new(ChunkKind::Assistant, "health check");
        self.normalize(&probe, "health-check").map(|_| ())
    }

    fn check_chunk(&self, chunk: &LogicalChunk) -> Result<(), ValidationError> {
        if chunk.correlation_id.trim().is_empty() {
            return Err(ValidationError::new("chunk has no correlation id", chunk_input(chunk)));
        }
        if chunk.timestamp < 0 {
            return Err(ValidationError::new("chunk timestamp must not be negative", chunk_input(chunk)));
        }
        if chunk.content.chars().count() > self.config.max_message_size {
            return Err(ValidationError::new(
                format!("chunk content exceeds {} characters", self.config.max_message_size),
                chunk_input(chunk),
            ));
        }
        Ok(())
    }

    fn build(&self, chunk: &LogicalChunk, session_id: &str) -> Result<ValidatedMessage, ValidationError> {
        let body = match (chunk.kind, self.config.orphan_policy) {
            (ChunkKind::User, _) => MessageBody::User { files: Vec::new() },
            (ChunkKind::Assistant, _) => MessageBody::Assistant {
                streaming: !chunk.is_complete,
                is_complete: chunk.is_complete,
            },
            (ChunkKind::Partial, OrphanPolicy::Assistant) => MessageBody::Assistant {
                streaming: true,
                is_complete: chunk.is_complete,
            },
            (ChunkKind::Partial, OrphanPolicy::System) => MessageBody::System {
                level: SystemLevel::Warning,
            },
        };

        ValidatedMessage::new(
            session_id,
            chunk.content.clone(),
            chunk.timestamp,
            body,
            self.config.max_message_size,
        )
    }
}

fn chunk_input(chunk: &LogicalChunk) -> serde_json::Value {
    let preview: String = chunk.content.chars().take(INPUT_PREVIEW_CHARS).collect();
    serde_json::json!({
        "kind": chunk.kind,
        "correlationId": chunk.correlation_id,
        "timestamp": chunk.timestamp,
        "isComplete": chunk.is_complete,
        "contentLength": chunk.content.chars().count(),
        "contentPreview": preview,
    })
}
