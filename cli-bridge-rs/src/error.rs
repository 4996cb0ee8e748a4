//! Error handling for the CLI bridge
//!
//! Stage-local problems (validation, breaker rejections) travel to the
//! consumer as failed envelopes. `BridgeError` covers what is left: failures
//! that end a session's output or refuse an API call outright.

use thiserror::Error;

use resilience::{CallError, ErrorKind, Severity};

use crate::envelope::StructuredError;
use crate::framer::FramingError;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for the CLI bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Raw CLI output could not be framed
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// The CLI process could not be started
    #[error("Failed to spawn CLI process: {0}")]
    Spawn(String),

    /// The CLI process exited badly or closed its output unexpectedly
    #[error("CLI process failed: {0}")]
    Process(String),

    /// Writing to the CLI's stdin is no longer possible
    #[error("CLI stdin is closed: {0}")]
    StdinClosed(String),

    /// Pipe-level I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No active session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A session with this id is already running
    #[error("Session already active: {0}")]
    SessionExists(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A circuit breaker refused the call
    #[error("Circuit broken: {message}")]
    CircuitBroken {
        code: &'static str,
        message: String,
        retry_in_ms: Option<u64>,
    },

    /// An operation did not finish in time
    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl BridgeError {
    /// Create a process failure error
    pub fn process(message: impl Into<String>) -> Self {
        BridgeError::Process(message.into())
    }

    /// Create a spawn error
    pub fn spawn(message: impl Into<String>) -> Self {
        BridgeError::Spawn(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        BridgeError::Configuration(message.into())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Framing(_) => "FRAMING_ERROR",
            BridgeError::Spawn(_) => "PROCESS_SPAWN_FAILED",
            BridgeError::Process(_) => "PROCESS_FAILED",
            BridgeError::StdinClosed(_) => "STDIN_CLOSED",
            BridgeError::Io(_) => "IO_ERROR",
            BridgeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            BridgeError::SessionExists(_) => "SESSION_EXISTS",
            BridgeError::Configuration(_) => "CONFIGURATION_ERROR",
            BridgeError::CircuitBroken { code, .. } => code,
            BridgeError::Timeout(_) => "TIMEOUT",
        }
    }

    /// Whether this error ends the session's output
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Framing(_) | BridgeError::Spawn(_) | BridgeError::Process(_) | BridgeError::Io(_)
        )
    }

    /// Converts into the structured record kept by circuit breakers
    pub fn to_error(&self) -> resilience::Error {
        let kind = match self {
            BridgeError::Framing(_) => ErrorKind::Framing,
            BridgeError::Spawn(_) | BridgeError::Process(_) => ErrorKind::Process,
            BridgeError::StdinClosed(_) | BridgeError::Io(_) => ErrorKind::IO,
            BridgeError::SessionNotFound(_) | BridgeError::SessionExists(_) => ErrorKind::Internal,
            BridgeError::Configuration(_) => ErrorKind::Configuration,
            BridgeError::CircuitBroken { .. } => ErrorKind::Unavailable,
            BridgeError::Timeout(_) => ErrorKind::Timeout,
        };
        let severity = if self.is_fatal() { Severity::Fatal } else { Severity::Major };

        resilience::Error::new(kind, self.to_string())
            .code(self.code())
            .severity(severity)
    }

    /// Converts into the consumer-facing error payload
    pub fn to_structured(&self) -> StructuredError {
        let error = StructuredError::new(self.code(), self.to_string());
        match self {
            BridgeError::CircuitBroken { retry_in_ms: Some(retry_in_ms), .. } => {
                error.with_context("retryInMs", retry_in_ms)
            }
            _ => error,
        }
    }

    /// Maps a breaker outcome around an operation that itself returns
    /// `BridgeError`
    pub fn from_call(err: CallError<BridgeError>) -> Self {
        match err {
            CallError::Failed(inner) => inner,
            CallError::Panicked(message) => BridgeError::Process(format!("operation panicked: {}", message)),
            blocked => {
                let code = blocked.code();
                let retry_in_ms = blocked.retry_in().map(|d| d.as_millis() as u64);
                BridgeError::CircuitBroken {
                    code,
                    message: blocked.to_string(),
                    retry_in_ms,
                }
            }
        }
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Configuration(err.to_string())
    }
}

impl From<resilience::Error> for BridgeError {
    fn from(err: resilience::Error) -> Self {
        match err.kind {
            ErrorKind::Configuration => BridgeError::Configuration(err.message),
            ErrorKind::Process => BridgeError::Process(err.message),
            ErrorKind::Timeout => BridgeError::Timeout(err.message),
            _ => BridgeError::Process(err.message),
        }
    }
}
