//! # Circuit Breaker
//!
//! Gates an arbitrary asynchronous unit of work on its recent failure history.
//!
//! - `CLOSED`: everything runs; failures inside the monitoring window are
//!   counted and the circuit opens once the threshold is reached
//! - `OPEN`: calls are rejected without running until the retry deadline
//! - `HALF_OPEN`: a bounded number of trial calls run; the first success
//!   closes the circuit, the first failure reopens it
//!
//! State changes happen only inside the breaker's own methods and are reported
//! synchronously to an optional transition callback. The internal lock is
//! never held across an `.await`.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{Error, ErrorKind};

/// Stable error codes reported for breaker decisions
pub mod codes {
    /// Rejected because the circuit is open
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    /// Rejected because all half-open trial slots are in flight
    pub const CIRCUIT_BREAKER_HALF_OPEN_LIMIT: &str = "CIRCUIT_BREAKER_HALF_OPEN_LIMIT";
    /// Rejected by a caller-side check of `is_call_allowed`
    pub const CIRCUIT_BREAKER_BLOCKED: &str = "CIRCUIT_BREAKER_BLOCKED";
    /// The guarded operation returned an error
    pub const OPERATION_FAILED: &str = "OPERATION_FAILED";
    /// The guarded operation panicked
    pub const OPERATION_PANICKED: &str = "OPERATION_PANICKED";
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, limited requests allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the monitoring window that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before trial calls are allowed
    pub timeout_ms: u64,
    /// Sliding window over which failures are counted
    pub monitoring_window_ms: u64,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Open-state duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Failure counting window
    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    /// Rejects configurations the state machine cannot honour
    pub fn validate(&self) -> crate::types::Result<()> {
        let invalid = |field: &str| {
            Err(Error::new(ErrorKind::Configuration, format!("{} must be greater than zero", field))
                .code("INVALID_BREAKER_CONFIG")
                .context("field", field))
        };

        if self.failure_threshold == 0 {
            return invalid("failure_threshold");
        }
        if self.timeout_ms == 0 {
            return invalid("timeout_ms");
        }
        if self.monitoring_window_ms == 0 {
            return invalid("monitoring_window_ms");
        }
        if self.half_open_max_calls == 0 {
            return invalid("half_open_max_calls");
        }
        Ok(())
    }
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The circuit is open; the operation was not invoked
    #[error("circuit breaker '{breaker}' is open, retry in {}ms", .retry_in.as_millis())]
    Open { breaker: String, retry_in: Duration },

    /// Every half-open trial slot is taken; the operation was not invoked
    #[error("circuit breaker '{breaker}' has {limit} half-open trial calls in flight")]
    HalfOpenLimit { breaker: String, limit: u32 },

    /// The operation ran and returned an error
    #[error("operation failed: {0}")]
    Failed(E),

    /// The operation ran and panicked
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl<E> CallError<E> {
    /// Stable code for consumer-facing payloads
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Open { .. } => codes::CIRCUIT_BREAKER_OPEN,
            CallError::HalfOpenLimit { .. } => codes::CIRCUIT_BREAKER_HALF_OPEN_LIMIT,
            CallError::Failed(_) => codes::OPERATION_FAILED,
            CallError::Panicked(_) => codes::OPERATION_PANICKED,
        }
    }

    /// True when the breaker refused to run the operation
    pub fn is_blocked(&self) -> bool {
        matches!(self, CallError::Open { .. } | CallError::HalfOpenLimit { .. })
    }

    /// Time until the next trial call is admitted, when known
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            CallError::Open { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}

/// Caller-supplied tracing data attached to a recorded failure
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    correlation_id: Option<String>,
    data: serde_json::Map<String, serde_json::Value>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the correlation id of the unit of work
    pub fn correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Adds a key-value pair
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
        self
    }
}

/// One failure observed by the breaker
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    #[serde(skip)]
    at: Instant,
    /// Wall-clock time of the failure
    pub timestamp: DateTime<Utc>,
    /// The originating error with its correlation id and context
    pub error: Error,
}

/// A state change, reported at the moment it happens
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BreakerStats {
    pub admitted_calls: u64,
    pub rejected_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub times_opened: u64,
}

/// Immutable snapshot returned by [`CircuitBreaker::status`]
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Milliseconds until an open circuit admits a trial call
    pub retry_in_ms: Option<u64>,
    pub half_open_call_count: u32,
    pub recent_failures: Vec<FailureRecord>,
    pub stats: BreakerStats,
    pub config: CircuitBreakerConfig,
}

type TransitionCallback = Arc<dyn Fn(&StateTransition) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<FailureRecord>,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_at: Option<Instant>,
    next_attempt_time: Option<DateTime<Utc>>,
    half_open_call_count: u32,
    /// Bumped on every entry into `HALF_OPEN`
    half_open_epoch: u64,
    stats: BreakerStats,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            failure_count: 0,
            last_failure_time: None,
            next_attempt_at: None,
            next_attempt_time: None,
            half_open_call_count: 0,
            half_open_epoch: 0,
            stats: BreakerStats::default(),
        }
    }
}

enum Rejection {
    Open(Duration),
    HalfOpenLimit,
}

/// Hands a half-open trial slot back if the call is dropped before it settles
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: Option<u64>,
}

impl TrialSlot<'_> {
    fn settle(mut self) {
        self.epoch = None;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.epoch.take() {
            self.breaker.release_trial(epoch);
        }
    }
}

/// Three-state circuit breaker guarding one dependency
pub struct CircuitBreaker {
    /// Name used in logs, metrics and transition events
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    on_transition: Option<TransitionCallback>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            on_transition: None,
        }
    }

    /// Registers a callback invoked synchronously on every state change
    pub fn with_transition_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without triggering time-based transitions
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call made now would be admitted
    ///
    /// Purges expired failures and moves an expired `OPEN` circuit to
    /// `HALF_OPEN`. Does not consume a half-open trial slot.
    pub fn is_call_allowed(&self) -> bool {
        let now = Instant::now();
        let (allowed, transition) = {
            let mut state = self.lock();
            self.purge_expired(&mut state, now);
            let transition = self.check_retry_deadline(&mut state, now);
            let allowed = match state.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => state.half_open_call_count < self.config.half_open_max_calls,
            };
            (allowed, transition)
        };
        self.emit(transition);
        allowed
    }

    /// Runs `operation` under breaker protection
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        self.execute_with(CallContext::default(), operation).await
    }

    /// Runs `operation` under breaker protection, attaching `context` to any
    /// failure it records
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        context: CallContext,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        let slot = match self.admit() {
            Ok(epoch) => TrialSlot { breaker: self, epoch },
            Err(rejection) => return Err(match rejection {
                Rejection::Open(retry_in) => CallError::Open {
                    breaker: self.name.clone(),
                    retry_in,
                },
                Rejection::HalfOpenLimit => CallError::HalfOpenLimit {
                    breaker: self.name.clone(),
                    limit: self.config.half_open_max_calls,
                },
            }),
        };

        // The closure is called inside the guarded future so a panic while
        // building the future is caught as well.
        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;
        slot.settle();

        match outcome {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure(failure_error(&err, &context));
                Err(CallError::Failed(err))
            }
            Err(payload) => {
                let message = panic_message(payload);
                let error = Error::new(ErrorKind::Operation, format!("operation panicked: {}", message))
                    .code(codes::OPERATION_PANICKED);
                self.on_failure(with_call_context(error, &context));
                Err(CallError::Panicked(message))
            }
        }
    }

    /// Forces the circuit closed and clears every counter
    pub fn reset(&self) {
        let transition = {
            let mut state = self.lock();
            let previous = state.state;
            self.close(&mut state);
            info!(
                circuit = %self.name,
                previous_state = %previous,
                "Circuit manually reset to CLOSED state"
            );
            self.transition(previous, CircuitState::Closed, "manual reset")
        };
        self.emit(transition);
    }

    /// Snapshot of the breaker for observability
    pub fn status(&self) -> CircuitBreakerStatus {
        let now = Instant::now();
        let mut state = self.lock();
        self.purge_expired(&mut state, now);

        let retry_in_ms = match (state.state, state.next_attempt_at) {
            (CircuitState::Open, Some(deadline)) => {
                Some(deadline.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            last_failure_time: state.last_failure_time,
            next_attempt_time: state.next_attempt_time,
            retry_in_ms,
            half_open_call_count: state.half_open_call_count,
            recent_failures: state.failures.iter().cloned().collect(),
            stats: state.stats,
            config: self.config.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // No user code runs under this lock, so a poisoned guard still holds
        // consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Window cleanup, retry-deadline check and admission decision
    ///
    /// A half-open admission returns the epoch its trial slot belongs to.
    fn admit(&self) -> Result<Option<u64>, Rejection> {
        let now = Instant::now();
        let (decision, transition) = {
            let mut state = self.lock();
            self.purge_expired(&mut state, now);
            let transition = self.check_retry_deadline(&mut state, now);

            let decision = match state.state {
                CircuitState::Closed => Ok(None),
                CircuitState::Open => {
                    let retry_in = state
                        .next_attempt_at
                        .map(|deadline| deadline.saturating_duration_since(now))
                        .unwrap_or_default();
                    Err(Rejection::Open(retry_in))
                }
                CircuitState::HalfOpen => {
                    if state.half_open_call_count < self.config.half_open_max_calls {
                        state.half_open_call_count += 1;
                        Ok(Some(state.half_open_epoch))
                    } else {
                        Err(Rejection::HalfOpenLimit)
                    }
                }
            };

            match &decision {
                Ok(_) => state.stats.admitted_calls += 1,
                Err(rejection) => {
                    state.stats.rejected_calls += 1;
                    match rejection {
                        Rejection::Open(retry_in) => debug!(
                            circuit = %self.name,
                            remaining_ms = %retry_in.as_millis(),
                            "Circuit open, request rejected"
                        ),
                        Rejection::HalfOpenLimit => debug!(
                            circuit = %self.name,
                            in_flight = %state.half_open_call_count,
                            "Half-open trial limit reached, request rejected"
                        ),
                    }
                }
            }
            (decision, transition)
        };

        self.emit(transition);
        if decision.is_err() {
            counter!("circuit_breaker.rejected_calls", 1, "breaker" => self.name.clone());
        }
        decision
    }

    /// Frees the slot of a trial dropped before completion. Slots from an
    /// earlier half-open period are already gone.
    fn release_trial(&self, epoch: u64) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && state.half_open_epoch == epoch {
            state.half_open_call_count = state.half_open_call_count.saturating_sub(1);
            debug!(
                circuit = %self.name,
                in_flight = %state.half_open_call_count,
                "Half-open trial cancelled, slot released"
            );
        }
    }

    fn on_success(&self) {
        let now = Instant::now();
        let transition = {
            let mut state = self.lock();
            self.purge_expired(&mut state, now);
            state.stats.successes += 1;

            match state.state {
                CircuitState::Closed => {
                    state.failures.clear();
                    state.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    self.close(&mut state);
                    info!(circuit = %self.name, "Circuit CLOSED: trial call succeeded");
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed, "trial call succeeded")
                }
                CircuitState::Open => {
                    // A trial admitted before a sibling trial reopened the circuit
                    debug!(circuit = %self.name, "Success received while OPEN, ignoring");
                    None
                }
            }
        };
        self.emit(transition);
    }

    fn on_failure(&self, error: Error) {
        let now = Instant::now();
        let transition = {
            let mut state = self.lock();
            self.purge_expired(&mut state, now);

            warn!(
                circuit = %self.name,
                state = %state.state,
                code = %error.code_or_kind(),
                correlation_id = ?error.correlation_id,
                message = %error.message,
                "Guarded operation failed"
            );

            let timestamp = Utc::now();
            state.failures.push_back(FailureRecord { at: now, timestamp, error });
            state.last_failure_time = Some(timestamp);
            state.stats.failures += 1;

            match state.state {
                CircuitState::Closed => {
                    state.failure_count = state.failures.len() as u32;
                    if state.failure_count >= self.config.failure_threshold {
                        self.open(&mut state, now);
                        warn!(
                            circuit = %self.name,
                            failure_count = %state.failure_count,
                            threshold = %self.config.failure_threshold,
                            "Circuit OPEN: failure threshold reached"
                        );
                        self.transition(CircuitState::Closed, CircuitState::Open, "failure threshold reached")
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    state.failure_count += 1;
                    self.open(&mut state, now);
                    warn!(
                        circuit = %self.name,
                        retry_in_ms = %self.config.timeout_ms,
                        "Circuit REOPENED: trial call failed"
                    );
                    self.transition(CircuitState::HalfOpen, CircuitState::Open, "trial call failed")
                }
                CircuitState::Open => None,
            }
        };
        self.emit(transition);
        counter!("circuit_breaker.failures", 1, "breaker" => self.name.clone());
    }

    /// Drops failures older than the monitoring window
    fn purge_expired(&self, state: &mut BreakerState, now: Instant) {
        let window = self.config.monitoring_window();
        while let Some(oldest) = state.failures.front() {
            if now.saturating_duration_since(oldest.at) > window {
                state.failures.pop_front();
            } else {
                break;
            }
        }

        // Open and half-open counters only move on explicit transitions
        if state.state == CircuitState::Closed {
            state.failure_count = state.failures.len() as u32;
        }
    }

    /// Lazily moves an expired `OPEN` circuit to `HALF_OPEN`
    fn check_retry_deadline(&self, state: &mut BreakerState, now: Instant) -> Option<StateTransition> {
        if state.state != CircuitState::Open {
            return None;
        }
        match state.next_attempt_at {
            Some(deadline) if now < deadline => None,
            _ => {
                state.state = CircuitState::HalfOpen;
                state.half_open_call_count = 0;
                state.half_open_epoch += 1;
                info!(
                    circuit = %self.name,
                    max_test_calls = %self.config.half_open_max_calls,
                    "Circuit HALF_OPEN: testing recovery"
                );
                self.transition(CircuitState::Open, CircuitState::HalfOpen, "retry timeout elapsed")
            }
        }
    }

    fn open(&self, state: &mut BreakerState, now: Instant) {
        let timeout = self.config.timeout();
        state.state = CircuitState::Open;
        state.half_open_call_count = 0;
        state.next_attempt_at = Some(now + timeout);
        state.next_attempt_time = chrono::Duration::from_std(timeout)
            .ok()
            .map(|timeout| Utc::now() + timeout);
        state.stats.times_opened += 1;
    }

    fn close(&self, state: &mut BreakerState) {
        state.state = CircuitState::Closed;
        state.failures.clear();
        state.failure_count = 0;
        state.half_open_call_count = 0;
        state.next_attempt_at = None;
        state.next_attempt_time = None;
    }

    fn transition(&self, from: CircuitState, to: CircuitState, reason: &str) -> Option<StateTransition> {
        if from == to {
            return None;
        }
        Some(StateTransition {
            breaker: self.name.clone(),
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        })
    }

    /// Reports a transition; called after the state lock is released
    fn emit(&self, transition: Option<StateTransition>) {
        let Some(transition) = transition else {
            return;
        };

        let state_value = match transition.to {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        gauge!("circuit_breaker.state", state_value, "breaker" => self.name.clone());

        if let Some(callback) = &self.on_transition {
            callback(&transition);
        }
    }
}

fn failure_error<E: fmt::Display + 'static>(err: &E, context: &CallContext) -> Error {
    let error = match (err as &dyn Any).downcast_ref::<Error>() {
        Some(structured) => structured.clone(),
        None => Error::new(ErrorKind::Operation, err.to_string()).code(codes::OPERATION_FAILED),
    };
    with_call_context(error, context)
}

fn with_call_context(mut error: Error, context: &CallContext) -> Error {
    if error.correlation_id.is_none() {
        error.correlation_id = context.correlation_id.clone();
    }
    for (key, value) in &context.data {
        error.context.entry(key.clone()).or_insert_with(|| value.clone());
    }
    error
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            timeout_ms: 1_000,
            monitoring_window_ms: 10_000,
            half_open_max_calls: 2,
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let result = cb.execute(|| async { Err::<(), _>("boom") }).await;
        assert!(matches!(result, Err(CallError::Failed("boom"))));
    }

    async fn succeed(cb: &CircuitBreaker) {
        let result = cb.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = CircuitBreaker::new("test", config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_call_allowed());

        let status = cb.status();
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_time.is_none());
        assert!(status.next_attempt_time.is_none());
    }

    #[tokio::test]
    async fn test_threshold_opens_circuit() {
        let cb = CircuitBreaker::new("test", config());

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failure_count, 2);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let status = cb.status();
        assert_eq!(status.failure_count, 3);
        assert!(status.next_attempt_time.is_some());
        assert!(status.last_failure_time.is_some());
        assert_eq!(status.stats.times_opened, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", config());

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failure_count, 0);

        // Two more failures are again below the threshold
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_never_invokes_operation() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            fail(&cb).await;
        }

        let calls = AtomicUsize::new(0);
        for _ in 0..10 {
            let result = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>(())
                })
                .await;
            let err = result.unwrap_err();
            assert_eq!(err.code(), codes::CIRCUIT_BREAKER_OPEN);
            assert!(err.is_blocked());
            assert!(err.retry_in().unwrap() <= Duration::from_millis(1_000));
            tokio::time::advance(Duration::from_millis(50)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!cb.is_call_allowed());
        assert_eq!(cb.status().stats.rejected_calls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;

        let calls = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);

        let status = cb.status();
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.half_open_call_count, 0);
        assert!(status.next_attempt_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_deadline() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            fail(&cb).await;
        }
        let first_deadline = cb.status().next_attempt_time.unwrap();

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(cb.is_call_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().retry_in_ms, Some(1_000));
        assert!(cb.status().next_attempt_time.unwrap() >= first_deadline);

        // Still rejected until the new deadline passes
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.is_call_allowed());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.is_call_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limit_rejects_extra_trials() {
        let cb = Arc::new(CircuitBreaker::new("test", config()));
        for _ in 0..3 {
            fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        // Two slow trials occupy both half-open slots
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let mut trials = Vec::new();
        for _ in 0..2 {
            let cb = Arc::clone(&cb);
            let mut release = release_rx.clone();
            trials.push(tokio::spawn(async move {
                cb.execute(|| async move {
                    while !*release.borrow() {
                        if release.changed().await.is_err() {
                            break;
                        }
                    }
                    Ok::<_, String>(())
                })
                .await
            }));
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.status().half_open_call_count, 2);

        let extra = cb.execute(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(extra.unwrap_err().code(), codes::CIRCUIT_BREAKER_HALF_OPEN_LIMIT);
        assert!(!cb.is_call_allowed());

        release_tx.send(true).unwrap();
        for trial in trials {
            assert!(trial.await.unwrap().is_ok());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    fn pending_trial(cb: &Arc<CircuitBreaker>) -> tokio::task::JoinHandle<Result<(), CallError<String>>> {
        let cb = Arc::clone(cb);
        tokio::spawn(async move {
            cb.execute(|| std::future::pending::<Result<(), String>>()).await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trials_release_their_slots() {
        let cb = Arc::new(CircuitBreaker::new("test", config()));
        for _ in 0..3 {
            fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let trials = vec![pending_trial(&cb), pending_trial(&cb)];
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.status().half_open_call_count, 2);
        assert!(!cb.is_call_allowed());

        for trial in trials {
            trial.abort();
            assert!(trial.await.unwrap_err().is_cancelled());
        }

        let status = cb.status();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!(status.half_open_call_count, 0);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_does_not_free_a_newer_slot() {
        let cb = Arc::new(CircuitBreaker::new("test", config()));
        for _ in 0..3 {
            fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let stale = pending_trial(&cb);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        // A sibling trial fails and the circuit reopens, then half-opens again
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let current = pending_trial(&cb);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.status().half_open_call_count, 1);

        stale.abort();
        let _ = stale.await;
        assert_eq!(cb.status().half_open_call_count, 1);

        current.abort();
        let _ = current.await;
        assert_eq!(cb.status().half_open_call_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_decay_out_of_window() {
        let cb = CircuitBreaker::new("test", config());
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.status().failure_count, 2);

        tokio::time::advance(Duration::from_millis(10_001)).await;
        assert_eq!(cb.status().failure_count, 0);

        // The old failures no longer count toward the threshold
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_purge_does_not_touch_open_counters() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            monitoring_window_ms: 100,
            ..config()
        });
        for _ in 0..3 {
            fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(500)).await;

        let status = cb.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 3);
        assert!(status.recent_failures.is_empty());
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_failure() {
        let cb = CircuitBreaker::new("test", config());

        let result = cb
            .execute(|| async {
                if true {
                    panic!("normalizer exploded");
                }
                Ok::<(), String>(())
            })
            .await;

        match result {
            Err(CallError::Panicked(message)) => assert!(message.contains("normalizer exploded")),
            other => panic!("unexpected result: {:?}", other),
        }
        let status = cb.status();
        assert_eq!(status.failure_count, 1);
        assert_eq!(
            status.recent_failures[0].error.code.as_deref(),
            Some(codes::OPERATION_PANICKED)
        );
    }

    #[tokio::test]
    async fn test_failure_record_keeps_context() {
        let cb = CircuitBreaker::new("test", config());
        let context = CallContext::new().correlation_id("corr-1").with("chunk_kind", "assistant");

        let _ = cb
            .execute_with(context, || async {
                Err::<(), _>(Error::new(ErrorKind::Process, "exited").code("PROCESS_EXITED"))
            })
            .await;

        let record = &cb.status().recent_failures[0];
        assert_eq!(record.error.code.as_deref(), Some("PROCESS_EXITED"));
        assert_eq!(record.error.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(record.error.context.get("chunk_kind"), Some(&serde_json::json!("assistant")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_callback_sees_every_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = CircuitBreaker::new("session-1", config())
            .with_transition_callback(move |t| sink.lock().unwrap().push((t.from, t.to)));

        for _ in 0..3 {
            fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;
        succeed(&cb).await;
        for _ in 0..3 {
            fail(&cb).await;
        }
        cb.reset();
        cb.reset();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::Closed),
        ]);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            fail(&cb).await;
        }
        cb.reset();

        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.half_open_call_count, 0);
        assert!(status.next_attempt_time.is_none());
        assert!(status.recent_failures.is_empty());
        assert!(cb.is_call_allowed());
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let bad = CircuitBreakerConfig { half_open_max_calls: 0, ..Default::default() };
        let err = bad.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.message.contains("half_open_max_calls"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"HALF_OPEN\"");
    }
}
