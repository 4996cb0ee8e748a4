//! Lifecycle events broadcast by the orchestrator

use serde::Serialize;

use resilience::StateTransition;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    SessionStarted {
        session_id: String,
        pid: Option<u32>,
    },
    SessionEnded {
        session_id: String,
    },
    /// A breaker changed state; `session_id` is `None` for the global breaker
    CircuitTransition {
        session_id: Option<String>,
        transition: StateTransition,
    },
    ProcessFailed {
        session_id: String,
        code: String,
        message: String,
    },
    Recovered {
        session_id: Option<String>,
        message: String,
    },
    RecoveryFailed {
        session_id: Option<String>,
        code: String,
        message: String,
    },
}
