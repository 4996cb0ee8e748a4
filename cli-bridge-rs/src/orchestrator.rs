//! Session orchestrator
//!
//! Owns one pipeline and one circuit breaker per session, plus a global
//! breaker guarding process launches. All methods take `&self`, so an
//! `Arc<Orchestrator>` can be shared between tasks.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use resilience::{
    codes, new_correlation_id, CallContext, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus,
    CircuitState,
};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::BridgeEvent;
use crate::normalizer::RecordNormalizer;
use crate::pipeline::{spawn_pipeline, PipelineContext, PipelineHandle, PipelineSettings, ResponseStream};
use crate::process::{LaunchSpec, Launcher};

/// Name of the breaker guarding process launches
pub const GLOBAL_BREAKER: &str = "global";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of an explicit recovery probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The probe ran and succeeded
    Recovered { state: CircuitState },
    /// The breaker refused the probe
    Blocked {
        code: String,
        retry_in_ms: Option<u64>,
    },
    /// The probe ran and failed
    Failed { code: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub session_id: String,
    pub pid: Option<u32>,
    pub project_path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// False once the pipeline has stopped on its own
    pub running: bool,
    pub circuit: CircuitBreakerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// No circuit is open
    pub healthy: bool,
    pub active_sessions: usize,
    pub open_circuits: usize,
    pub global: CircuitBreakerStatus,
    pub sessions: Vec<SessionHealth>,
    pub checked_at: DateTime<Utc>,
}

struct Session {
    breaker: Arc<CircuitBreaker>,
    pipeline: PipelineHandle,
    project_path: PathBuf,
    started_at: DateTime<Utc>,
}

/// Session ids whose process is being launched
#[derive(Debug, Default)]
struct Reservations(Mutex<HashSet<String>>);

impl Reservations {
    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reserve(&self, session_id: &str) -> Option<Reservation<'_>> {
        self.ids().insert(session_id.to_string()).then(|| Reservation {
            owner: self,
            session_id: session_id.to_string(),
        })
    }
}

/// Released on drop, including when `start_session` is cancelled
struct Reservation<'a> {
    owner: &'a Reservations,
    session_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.owner.ids().remove(&self.session_id);
    }
}

pub struct Orchestrator {
    config: BridgeConfig,
    launcher: Arc<dyn Launcher>,
    normalizer: Arc<RecordNormalizer>,
    global_breaker: Arc<CircuitBreaker>,
    sessions: RwLock<HashMap<String, Session>>,
    starting: Reservations,
    events: broadcast::Sender<BridgeEvent>,
}

impl Orchestrator {
    pub fn new(config: BridgeConfig, launcher: Arc<dyn Launcher>) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let global_breaker = Arc::new(observed_breaker(GLOBAL_BREAKER, None, &config.breaker, &events));
        let normalizer = Arc::new(RecordNormalizer::new(config.normalizer_config()));

        info!(
            executable = %config.cli.executable.display(),
            version = %config.version,
            "CLI bridge orchestrator initialized"
        );

        Ok(Self {
            config,
            launcher,
            normalizer,
            global_breaker,
            sessions: RwLock::new(HashMap::new()),
            starting: Reservations::default(),
            events,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Receives lifecycle and circuit transition events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Launches the CLI for `session_id` and returns its response stream
    ///
    /// The session map is not locked while the process launches; the id is
    /// reserved instead so a concurrent start for it fails fast.
    pub async fn start_session(&self, session_id: &str, project_path: Option<PathBuf>) -> Result<ResponseStream> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(BridgeError::configuration("session id must not be empty"));
        }

        let (reservation, stale) = {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(session_id)
                .is_some_and(|existing| !existing.pipeline.is_finished())
            {
                return Err(BridgeError::SessionExists(session_id.to_string()));
            }
            let reservation = self
                .starting
                .reserve(session_id)
                .ok_or_else(|| BridgeError::SessionExists(session_id.to_string()))?;
            (reservation, sessions.remove(session_id))
        };

        if let Some(stale) = stale {
            debug!(session_id = %session_id, "Replacing finished session");
            stale.pipeline.shutdown().await;
        }

        let project_path = match project_path.or_else(|| self.config.cli.project_path.clone()) {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        let mut spec = LaunchSpec::new(self.config.cli.executable.clone(), project_path.clone());
        spec.env = self.config.cli.env.clone();

        let launcher = Arc::clone(&self.launcher);
        let launch_spec = spec.clone();
        let context = CallContext::new()
            .correlation_id(new_correlation_id())
            .with("session_id", session_id);
        let process = self
            .global_breaker
            .execute_with(context, move || async move { launcher.launch(&launch_spec).await })
            .await
            .map_err(BridgeError::from_call)?;

        let breaker = Arc::new(observed_breaker(
            &format!("session:{}", session_id),
            Some(session_id.to_string()),
            &self.config.breaker,
            &self.events,
        ));
        let context = PipelineContext::new(
            session_id,
            process,
            Arc::clone(&breaker),
            Arc::clone(&self.normalizer),
            PipelineSettings::from_config(&self.config),
        )
        .with_relaunch(Arc::clone(&self.launcher), spec)
        .with_events(self.events.clone());

        let (stream, pipeline) = spawn_pipeline(context);
        let pid = pipeline.pid();

        self.sessions.write().await.insert(
            session_id.to_string(),
            Session {
                breaker,
                pipeline,
                project_path,
                started_at: Utc::now(),
            },
        );
        drop(reservation);

        info!(session_id = %session_id, pid = ?pid, "Session started");
        self.publish(BridgeEvent::SessionStarted {
            session_id: session_id.to_string(),
            pid,
        });

        Ok(stream)
    }

    /// Writes one line of user input to the session's CLI
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        let stdin = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|session| session.pipeline.stdin().clone())
                .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?
        };

        stdin.send_line(text).await
    }

    /// Stops the session's pipeline and process; ending an unknown or
    /// already ended session is a no-op
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        let session = self.sessions.write().await.remove(session_id);

        let Some(session) = session else {
            debug!(session_id = %session_id, "Session already ended");
            return Ok(());
        };

        session.pipeline.shutdown().await;
        info!(session_id = %session_id, "Session ended");
        self.publish(BridgeEvent::SessionEnded {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Ends every session
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Session)> = self.sessions.write().await.drain().collect();
        info!(count = sessions.len(), "Shutting down sessions");

        for (session_id, session) in sessions {
            session.pipeline.shutdown().await;
            self.publish(BridgeEvent::SessionEnded { session_id });
        }
    }

    /// Ids of the registered sessions, sorted
    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn session_status(&self, session_id: &str) -> Option<CircuitBreakerStatus> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|session| session.breaker.status())
    }

    pub fn global_status(&self) -> CircuitBreakerStatus {
        self.global_breaker.status()
    }

    /// Aggregated breaker and session health
    pub async fn health(&self) -> HealthReport {
        let global = self.global_breaker.status();

        let mut sessions: Vec<SessionHealth> = {
            let guard = self.sessions.read().await;
            guard
                .iter()
                .map(|(session_id, session)| SessionHealth {
                    session_id: session_id.clone(),
                    pid: session.pipeline.pid(),
                    project_path: session.project_path.clone(),
                    started_at: session.started_at,
                    running: !session.pipeline.is_finished(),
                    circuit: session.breaker.status(),
                })
                .collect()
        };
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        let open_circuits = sessions
            .iter()
            .map(|s| s.circuit.state)
            .chain(std::iter::once(global.state))
            .filter(|state| *state == CircuitState::Open)
            .count();

        HealthReport {
            healthy: open_circuits == 0,
            active_sessions: sessions.iter().filter(|s| s.running).count(),
            open_circuits,
            global,
            sessions,
            checked_at: Utc::now(),
        }
    }

    /// Forces a breaker closed; `None` targets the global breaker
    pub async fn reset_breaker(&self, session_id: Option<&str>) -> Result<()> {
        let breaker = self.breaker_for(session_id).await?;
        breaker.reset();
        Ok(())
    }

    /// Runs a no-op probe through a breaker; `None` targets the global
    /// breaker. A successful probe while half-open closes the circuit.
    pub async fn attempt_recovery(&self, session_id: Option<&str>) -> Result<RecoveryOutcome> {
        let breaker = self.breaker_for(session_id).await?;

        if !breaker.is_call_allowed() {
            let status = breaker.status();
            debug!(circuit = %breaker.name(), state = %status.state, "Recovery probe blocked");
            return Ok(RecoveryOutcome::Blocked {
                code: codes::CIRCUIT_BREAKER_BLOCKED.to_string(),
                retry_in_ms: status.retry_in_ms,
            });
        }

        let normalizer = Arc::clone(&self.normalizer);
        let outcome = breaker
            .execute(move || async move { normalizer.health_check() })
            .await;

        match outcome {
            Ok(()) => {
                let state = breaker.state();
                info!(circuit = %breaker.name(), state = %state, "Recovery probe succeeded");
                self.publish(BridgeEvent::Recovered {
                    session_id: session_id.map(str::to_string),
                    message: format!("recovery probe succeeded, circuit {}", state),
                });
                Ok(RecoveryOutcome::Recovered { state })
            }
            Err(err) if err.is_blocked() => Ok(RecoveryOutcome::Blocked {
                code: err.code().to_string(),
                retry_in_ms: err.retry_in().map(|d| d.as_millis() as u64),
            }),
            Err(err) => {
                warn!(circuit = %breaker.name(), error = %err, "Recovery probe failed");
                self.publish(BridgeEvent::RecoveryFailed {
                    session_id: session_id.map(str::to_string),
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                Ok(RecoveryOutcome::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn breaker_for(&self, session_id: Option<&str>) -> Result<Arc<CircuitBreaker>> {
        match session_id {
            None => Ok(Arc::clone(&self.global_breaker)),
            Some(id) => self
                .sessions
                .read()
                .await
                .get(id)
                .map(|session| Arc::clone(&session.breaker))
                .ok_or_else(|| BridgeError::SessionNotFound(id.to_string())),
        }
    }

    fn publish(&self, event: BridgeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// A breaker whose transitions are published as events
fn observed_breaker(
    name: &str,
    session_id: Option<String>,
    config: &CircuitBreakerConfig,
    events: &broadcast::Sender<BridgeEvent>,
) -> CircuitBreaker {
    let events = events.clone();
    CircuitBreaker::new(name, config.clone()).with_transition_callback(move |transition| {
        let _ = events.send(BridgeEvent::CircuitTransition {
            session_id: session_id.clone(),
            transition: transition.clone(),
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessHandle;
    use async_trait::async_trait;

    struct RefusingLauncher;

    #[async_trait]
    impl Launcher for RefusingLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
            Err(BridgeError::spawn(format!("{} not found", spec.executable.display())))
        }
    }

    fn orchestrator(threshold: u32) -> Orchestrator {
        let mut config = BridgeConfig::default();
        config.breaker.failure_threshold = threshold;
        config.cli.project_path = Some(std::env::temp_dir());
        Orchestrator::new(config, Arc::new(RefusingLauncher)).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_failures_open_global_breaker() {
        let orchestrator = orchestrator(2);
        let mut events = orchestrator.subscribe();

        for _ in 0..2 {
            let err = orchestrator.start_session("s-1", None).await.unwrap_err();
            assert_eq!(err.code(), "PROCESS_SPAWN_FAILED");
        }

        let err = orchestrator.start_session("s-1", None).await.unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_BREAKER_OPEN");
        assert!(matches!(err, BridgeError::CircuitBroken { retry_in_ms: Some(_), .. }));
        assert_eq!(orchestrator.global_status().state, CircuitState::Open);

        match events.try_recv().unwrap() {
            BridgeEvent::CircuitTransition { session_id, transition } => {
                assert!(session_id.is_none());
                assert_eq!(transition.to, CircuitState::Open);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let report = orchestrator.health().await;
        assert!(!report.healthy);
        assert_eq!(report.open_circuits, 1);
        assert!(orchestrator.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_blocked_while_open_then_reset() {
        let orchestrator = orchestrator(1);
        let _ = orchestrator.start_session("s-1", None).await;

        match orchestrator.attempt_recovery(None).await.unwrap() {
            RecoveryOutcome::Blocked { code, retry_in_ms } => {
                assert_eq!(code, "CIRCUIT_BREAKER_BLOCKED");
                assert!(retry_in_ms.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        orchestrator.reset_breaker(None).await.unwrap();
        assert_eq!(orchestrator.global_status().state, CircuitState::Closed);
        assert_eq!(
            orchestrator.attempt_recovery(None).await.unwrap(),
            RecoveryOutcome::Recovered { state: CircuitState::Closed }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_probe_closes_half_open_breaker() {
        let orchestrator = orchestrator(1);
        let _ = orchestrator.start_session("s-1", None).await;
        assert_eq!(orchestrator.global_status().state, CircuitState::Open);

        tokio::time::advance(orchestrator.config().breaker.timeout()).await;

        assert_eq!(
            orchestrator.attempt_recovery(None).await.unwrap(),
            RecoveryOutcome::Recovered { state: CircuitState::Closed }
        );
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let orchestrator = orchestrator(5);

        assert!(orchestrator.session_status("missing").await.is_none());
        assert_eq!(
            orchestrator.send_message("missing", "hi").await.unwrap_err().code(),
            "SESSION_NOT_FOUND"
        );
        assert_eq!(
            orchestrator.reset_breaker(Some("missing")).await.unwrap_err().code(),
            "SESSION_NOT_FOUND"
        );
        assert!(orchestrator.end_session("missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_session_id_rejected() {
        let orchestrator = orchestrator(5);
        assert!(orchestrator.start_session("  ", None).await.is_err());
        assert_eq!(orchestrator.global_status().stats.admitted_calls, 0);
    }
}
