//! Line framer
//!
//! Turns the CLI's raw stdout bytes into speaker-attributed logical chunks.
//! A line starting with `User:` or `Assistant:` opens a new chunk; every
//! other line continues the open one. Output does not depend on how the
//! byte stream was split into fragments.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default bound on a chunk's content, in characters
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 50_000;

const USER_PREFIX: &str = "User:";
const ASSISTANT_PREFIX: &str = "Assistant:";

/// Who produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    User,
    Assistant,
    /// Text seen before any speaker boundary
    Partial,
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkKind::User => write!(f, "user"),
            ChunkKind::Assistant => write!(f, "assistant"),
            ChunkKind::Partial => write!(f, "partial"),
        }
    }
}

/// A speaker-attributed piece of CLI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalChunk {
    pub kind: ChunkKind,
    pub content: String,
    pub is_complete: bool,
    /// Unique per chunk
    pub correlation_id: String,
    /// Milliseconds since the Unix epoch, taken when the chunk opened
    pub timestamp: i64,
}

impl LogicalChunk {
    /// Creates a complete chunk with a fresh correlation id
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            is_complete: true,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Errors that stop the framer
#[derive(Debug, Clone, Error)]
pub enum FramingError {
    /// A line was not valid UTF-8
    #[error("line {line} is not valid UTF-8: {reason}")]
    InvalidUtf8 { line: u64, reason: String },
}

#[derive(Debug)]
struct OpenChunk {
    kind: ChunkKind,
    content: String,
    chars: usize,
    correlation_id: String,
    timestamp: i64,
}

impl OpenChunk {
    fn new(kind: ChunkKind) -> Self {
        Self {
            kind,
            content: String::new(),
            chars: 0,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn close(self) -> LogicalChunk {
        LogicalChunk {
            kind: self.kind,
            content: self.content,
            is_complete: true,
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
        }
    }
}

/// Incremental framer over one CLI output stream
///
/// An unterminated line is held in a buffer of at most
/// [`LineFramer::max_line_bytes`] bytes. Once such a line is known to
/// overflow the size limit it is emitted truncated and the rest of it is
/// skipped up to the next newline.
#[derive(Debug)]
pub struct LineFramer {
    /// Bytes after the last newline
    pending: Vec<u8>,
    /// Skipping the tail of a line that was already emitted truncated
    discarding: bool,
    open: Option<OpenChunk>,
    max_message_size: usize,
    lines_seen: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl LineFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            discarding: false,
            open: None,
            max_message_size,
            lines_seen: 0,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Bound on the buffered bytes of an unterminated line
    pub fn max_line_bytes(&self) -> usize {
        self.max_message_size.saturating_mul(8).saturating_add(64)
    }

    /// True when a chunk is open or bytes are buffered
    pub fn has_pending(&self) -> bool {
        self.open.is_some() || !self.pending.is_empty()
    }

    /// Feeds one fragment and returns the chunks it completed, in order
    pub fn push(&mut self, fragment: &[u8]) -> Result<Vec<LogicalChunk>, FramingError> {
        let mut completed = Vec::new();
        let mut rest = fragment;

        loop {
            if self.discarding {
                match find_newline(rest) {
                    Some(end) => {
                        self.discarding = false;
                        rest = &rest[end + 1..];
                    }
                    None => return Ok(completed),
                }
            }

            match find_newline(rest) {
                Some(end) => {
                    self.pending.extend_from_slice(&rest[..end]);
                    rest = &rest[end + 1..];
                    let bytes = std::mem::take(&mut self.pending);
                    let line = self.decode(&bytes)?;
                    self.process_line(&line, &mut completed);
                }
                None => {
                    self.pending.extend_from_slice(rest);
                    self.bound_pending(&mut completed)?;
                    return Ok(completed);
                }
            }
        }
    }

    /// Convenience wrapper over [`LineFramer::push`]
    pub fn push_str(&mut self, fragment: &str) -> Result<Vec<LogicalChunk>, FramingError> {
        self.push(fragment.as_bytes())
    }

    /// Flushes the trailing partial line and closes the open chunk
    pub fn finish(&mut self) -> Result<Vec<LogicalChunk>, FramingError> {
        let mut completed = Vec::new();
        self.discarding = false;

        if !self.pending.is_empty() {
            let buffer = std::mem::take(&mut self.pending);
            let line = self.decode(&buffer)?;
            self.process_line(&line, &mut completed);
        }

        if let Some(chunk) = self.close_open() {
            completed.push(chunk);
        }

        debug!(lines = self.lines_seen, chunks = completed.len(), "Framer flushed");
        Ok(completed)
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<String, FramingError> {
        self.lines_seen += 1;
        decode_line(bytes, self.lines_seen)
    }

    /// Shrinks an oversized unterminated line without changing what it
    /// will eventually produce
    fn bound_pending(&mut self, completed: &mut Vec<LogicalChunk>) -> Result<(), FramingError> {
        if self.pending.len() <= self.max_line_bytes() {
            return Ok(());
        }

        // Up to three trailing bytes may be an incomplete character
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                return Err(FramingError::InvalidUtf8 {
                    line: self.lines_seen + 1,
                    reason: e.to_string(),
                })
            }
        };
        let tail = self.pending.split_off(valid);
        let head = std::mem::take(&mut self.pending);
        let line = decode_line(&head, self.lines_seen + 1)?;

        if self.overflows(&line) {
            self.lines_seen += 1;
            self.process_line(&line, completed);
            self.discarding = true;
            debug!(line = self.lines_seen, "Skipping remainder of oversized line");
            return Ok(());
        }

        let mut kept = compact_boundary_line(&line, self.max_message_size).into_bytes();
        kept.extend_from_slice(&tail);
        self.pending = kept;
        Ok(())
    }

    /// True when `line` is certain to exceed the size limit however it ends
    fn overflows(&self, line: &str) -> bool {
        let line = line.strip_suffix('\r').unwrap_or(line);
        match speaker_boundary(line) {
            // Trailing whitespace may still be trimmed, so only count up to
            // the last visible character
            Some((_, rest)) => rest.trim().chars().count() > self.max_message_size,
            None => {
                let used = self
                    .open
                    .as_ref()
                    .map_or(0, |open| open.chars + usize::from(!open.content.is_empty()));
                used + line.chars().count() > self.max_message_size
            }
        }
    }

    fn process_line(&mut self, line: &str, completed: &mut Vec<LogicalChunk>) {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some((kind, rest)) = speaker_boundary(line) {
            if let Some(chunk) = self.close_open() {
                completed.push(chunk);
            }
            self.open = Some(OpenChunk::new(kind));
            self.append(rest.trim(), false, completed);
            return;
        }

        if self.open.is_none() {
            if line.is_empty() {
                return;
            }
            self.open = Some(OpenChunk::new(ChunkKind::Partial));
        }
        self.append(line, true, completed);
    }

    fn append(&mut self, text: &str, on_new_line: bool, completed: &mut Vec<LogicalChunk>) {
        let Some(open) = self.open.as_mut() else {
            return;
        };

        let separator = on_new_line && !open.content.is_empty();
        let added = text.chars().count() + usize::from(separator);

        if open.chars + added > self.max_message_size {
            if separator {
                open.content.push('\n');
            }
            open.content.push_str(text);
            truncate_chars(&mut open.content, self.max_message_size);

            warn!(
                kind = %open.kind,
                correlation_id = %open.correlation_id,
                max_message_size = self.max_message_size,
                "Chunk exceeded maximum size, truncated"
            );

            if let Some(open) = self.open.take() {
                completed.push(open.close());
            }
            return;
        }

        if separator {
            open.content.push('\n');
        }
        open.content.push_str(text);
        open.chars += added;
    }

    /// Closes the open chunk; empty chunks are dropped
    fn close_open(&mut self) -> Option<LogicalChunk> {
        self.open
            .take()
            .filter(|open| !open.content.is_empty())
            .map(OpenChunk::close)
    }
}

fn speaker_boundary(line: &str) -> Option<(ChunkKind, &str)> {
    if let Some(rest) = line.strip_prefix(USER_PREFIX) {
        Some((ChunkKind::User, rest))
    } else {
        line.strip_prefix(ASSISTANT_PREFIX)
            .map(|rest| (ChunkKind::Assistant, rest))
    }
}

fn find_newline(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|b| *b == b'\n')
}

fn decode_line(bytes: &[u8], line: u64) -> Result<String, FramingError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| FramingError::InvalidUtf8 {
            line,
            reason: e.to_string(),
        })
}

/// Drops whitespace a boundary line's seed can never include: everything
/// before the first visible character and all but `max_chars` characters
/// after the last one
fn compact_boundary_line(line: &str, max_chars: usize) -> String {
    let Some((_, rest)) = speaker_boundary(line) else {
        return line.to_owned();
    };
    let marker = &line[..line.len() - rest.len()];
    let rest = rest.trim_start();
    let content = rest.trim_end();
    let padding: String = rest[content.len()..].chars().take(max_chars).collect();
    format!("{}{}{}", marker, content, padding)
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((index, _)) = text.char_indices().nth(max_chars) {
        text.truncate(index);
    }
}
