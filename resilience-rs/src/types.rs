//! # Structured Error Types
//!
//! The error record shared by the bridge crates. Failures observed by a
//! circuit breaker are kept as these records so they can be inspected later
//! and turned into consumer-facing error payloads.

use std::fmt;
use std::error::Error as StdError;
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The severity level of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Severity {
    /// Informational, not an actual failure
    Info,
    /// Recovered locally, the stream keeps flowing
    Minor,
    /// Counted against a breaker
    #[default]
    Major,
    /// Ends a session's output
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Minor => write!(f, "MINOR"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Categorizes different kinds of errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Raw output could not be split into records
    Framing,
    /// A record failed schema validation
    Validation,
    /// A guarded unit of work failed
    Operation,
    /// The external process failed to start, exited badly or closed early
    Process,
    /// Input/output error on a process pipe
    IO,
    /// Invalid or missing configuration
    Configuration,
    /// The dependency is being shed by a circuit breaker
    Unavailable,
    /// An operation did not complete in time
    Timeout,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Framing => write!(f, "Framing Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::Operation => write!(f, "Operation Error"),
            ErrorKind::Process => write!(f, "Process Error"),
            ErrorKind::IO => write!(f, "I/O Error"),
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Unavailable => write!(f, "Unavailable Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Structured error record
///
/// `Clone` drops the opaque `cause`; everything else survives the copy.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// The time when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Error severity level
    pub severity: Severity,
    /// Stable machine-readable code, e.g. `PROCESS_EXITED`
    pub code: Option<String>,
    /// Correlation ID for cross-stage tracing
    pub correlation_id: Option<String>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Underlying cause (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind.clone(),
            message: self.message.clone(),
            timestamp: self.timestamp,
            severity: self.severity,
            code: self.code.clone(),
            correlation_id: self.correlation_id.clone(),
            context: self.context.clone(),
            cause: None,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            severity: Severity::default(),
            code: None,
            correlation_id: None,
            context: serde_json::Map::new(),
            cause: None,
        }
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the error code
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the correlation id
    pub fn correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Code if set, otherwise a code derived from the kind
    pub fn code_or_kind(&self) -> String {
        match &self.code {
            Some(code) => code.clone(),
            None => match self.kind {
                ErrorKind::Framing => "FRAMING_ERROR".to_string(),
                ErrorKind::Validation => "VALIDATION_ERROR".to_string(),
                ErrorKind::Operation => "OPERATION_FAILED".to_string(),
                ErrorKind::Process => "PROCESS_FAILED".to_string(),
                ErrorKind::IO => "IO_ERROR".to_string(),
                ErrorKind::Configuration => "CONFIGURATION_ERROR".to_string(),
                ErrorKind::Unavailable => "UNAVAILABLE".to_string(),
                ErrorKind::Timeout => "TIMEOUT".to_string(),
                ErrorKind::Internal => "INTERNAL_ERROR".to_string(),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(code) = &self.code {
            write!(f, " (Code: {})", code)?;
        }

        if let Some(correlation_id) = &self.correlation_id {
            write!(f, " [CorrelationID: {}]", correlation_id)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::IO, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("JSON error: {}", err)).cause(err)
    }
}
