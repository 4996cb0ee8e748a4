//! # Resilience
//!
//! Shared failure handling for the CLI chat bridge:
//!
//! - Structured error records with codes, correlation ids and context
//! - Structured logging bootstrap
//! - A three-state circuit breaker with a sliding failure window and
//!   synchronous transition events

pub mod types;
pub mod logging;
pub mod circuit_breaker;

// Re-export commonly used types
pub use types::{Error, Result, ErrorKind, Severity};
pub use logging::{init_logging, new_correlation_id, LoggingConfig};
pub use circuit_breaker::{
    codes, CallContext, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus,
    CircuitState, FailureRecord, StateTransition,
};
