//! Resilient streaming pipeline
//!
//! One pipeline task per session:
//!
//! ```text
//! stdout bytes --> LineFramer --> LogicalChunk --> breaker.execute(normalize)
//!                                                        |
//!                       ResponseStream <-- mpsc (bounded) <-- ResponseEnvelope
//! ```
//!
//! Every chunk yields exactly one envelope, in framing order. Validation
//! problems and breaker rejections become failed envelopes and streaming
//! goes on. Process failures are recorded on the session breaker and get one
//! relaunch attempt through it; framing errors end the stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use resilience::{CallContext, CircuitBreaker};

use crate::config::BridgeConfig;
use crate::envelope::{EnvelopeMetadata, ResponseEnvelope, StructuredError};
use crate::error::BridgeError;
use crate::events::BridgeEvent;
use crate::framer::{LineFramer, LogicalChunk};
use crate::message::{SystemLevel, ValidatedMessage};
use crate::normalizer::RecordNormalizer;
use crate::process::{BoxedReader, ChildControl, LaunchSpec, Launcher, ProcessHandle, StdinWriter};

/// Item yielded by a [`ResponseStream`]
pub type StreamItem = Result<ResponseEnvelope<ValidatedMessage>, BridgeError>;

/// Tunables for one pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub channel_capacity: usize,
    pub read_buffer_size: usize,
    pub exit_grace: Duration,
    pub max_restarts: u32,
    pub max_message_size: usize,
    pub stdin_write_timeout: Duration,
    pub version: String,
}

impl PipelineSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            channel_capacity: config.pipeline.channel_capacity,
            read_buffer_size: config.pipeline.read_buffer_size,
            exit_grace: config.pipeline.exit_grace(),
            max_restarts: config.pipeline.max_restarts,
            max_message_size: config.framing.max_message_size,
            stdin_write_timeout: config.pipeline.stdin_write_timeout(),
            version: config.version.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// How to start a replacement process after a failure
#[derive(Clone)]
pub struct Relaunch {
    pub launcher: Arc<dyn Launcher>,
    pub spec: LaunchSpec,
}

/// Inputs for [`spawn_pipeline`]
pub struct PipelineContext {
    session_id: String,
    stdout: BoxedReader,
    child: Box<dyn ChildControl>,
    stdin: StdinWriter,
    breaker: Arc<CircuitBreaker>,
    normalizer: Arc<RecordNormalizer>,
    settings: PipelineSettings,
    relaunch: Option<Relaunch>,
    events: Option<broadcast::Sender<BridgeEvent>>,
}

impl PipelineContext {
    pub fn new(
        session_id: impl Into<String>,
        process: ProcessHandle,
        breaker: Arc<CircuitBreaker>,
        normalizer: Arc<RecordNormalizer>,
        settings: PipelineSettings,
    ) -> Self {
        let ProcessHandle { stdout, stdin, child } = process;
        Self {
            session_id: session_id.into(),
            stdout,
            child,
            stdin: StdinWriter::new(stdin, settings.stdin_write_timeout),
            breaker,
            normalizer,
            settings,
            relaunch: None,
            events: None,
        }
    }

    /// Enables relaunching the process after a failure
    pub fn with_relaunch(mut self, launcher: Arc<dyn Launcher>, spec: LaunchSpec) -> Self {
        self.relaunch = Some(Relaunch { launcher, spec });
        self
    }

    /// Publishes process failure and recovery events on `events`
    pub fn with_events(mut self, events: broadcast::Sender<BridgeEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Consumer side of a session's output
///
/// Ends after the process exits cleanly, after a fatal error item, or when
/// the session is ended.
#[derive(Debug)]
pub struct ResponseStream {
    session_id: String,
    rx: mpsc::Receiver<StreamItem>,
}

impl ResponseStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next envelope; `None` once the stream has ended
    pub async fn next_envelope(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}

impl Stream for ResponseStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Control side of a running pipeline
#[derive(Debug)]
pub struct PipelineHandle {
    session_id: String,
    stdin: StdinWriter,
    pid: Option<u32>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Writer for the session's stdin
    pub fn stdin(&self) -> &StdinWriter {
        &self.stdin
    }

    /// Pid of the first process launched for the session
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the pipeline, terminates the process and waits for cleanup
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(session_id = %self.session_id, error = %e, "Pipeline task ended abnormally");
            }
        }
    }
}

/// Starts the pipeline task for one session
pub fn spawn_pipeline(context: PipelineContext) -> (ResponseStream, PipelineHandle) {
    let (tx, rx) = mpsc::channel(context.settings.channel_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session_id = context.session_id.clone();
    let stdin = context.stdin.clone();
    let pid = context.child.pid();

    let task = PipelineTask {
        framer: LineFramer::new(context.settings.max_message_size),
        session_id: context.session_id,
        stdout: context.stdout,
        child: context.child,
        stdin: context.stdin,
        breaker: context.breaker,
        normalizer: context.normalizer,
        settings: context.settings,
        relaunch: context.relaunch,
        events: context.events,
        tx,
        shutdown: shutdown_rx,
        restarts: 0,
    };
    let task = tokio::spawn(task.run());

    (
        ResponseStream {
            session_id: session_id.clone(),
            rx,
        },
        PipelineHandle {
            session_id,
            stdin,
            pid,
            shutdown: shutdown_tx,
            task: Some(task),
        },
    )
}

struct PipelineTask {
    session_id: String,
    stdout: BoxedReader,
    child: Box<dyn ChildControl>,
    stdin: StdinWriter,
    framer: LineFramer,
    breaker: Arc<CircuitBreaker>,
    normalizer: Arc<RecordNormalizer>,
    settings: PipelineSettings,
    relaunch: Option<Relaunch>,
    events: Option<broadcast::Sender<BridgeEvent>>,
    tx: mpsc::Sender<StreamItem>,
    shutdown: watch::Receiver<bool>,
    restarts: u32,
}

impl PipelineTask {
    async fn run(mut self) {
        info!(session_id = %self.session_id, pid = ?self.child.pid(), "Pipeline started");

        let outcome = self.drive().await;

        if let Err(e) = self.child.terminate().await {
            warn!(session_id = %self.session_id, error = %e, "Failed to terminate CLI process");
        }
        self.stdin.close().await;

        match outcome {
            Ok(()) => info!(session_id = %self.session_id, "Pipeline finished"),
            Err(err) => {
                error!(
                    session_id = %self.session_id,
                    code = err.code(),
                    error = %err,
                    "Pipeline stopped"
                );
                self.send(Err(err)).await;
            }
        }
    }

    /// Reads until the process is done; `Ok` also covers cancellation
    async fn drive(&mut self) -> Result<(), BridgeError> {
        let mut buf = vec![0u8; self.settings.read_buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    debug!(session_id = %self.session_id, "Pipeline cancelled");
                    return Ok(());
                }
                read = self.stdout.read(&mut buf) => read,
            };

            let failure = match read {
                Ok(0) => {
                    if !self.flush_framer().await? {
                        return Ok(());
                    }
                    match self.check_exit().await {
                        Some(reason) => reason,
                        None => return Ok(()),
                    }
                }
                Ok(n) => {
                    let chunks = self.framer.push(&buf[..n])?;
                    if !self.deliver_all(chunks).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    if !self.flush_framer().await? {
                        return Ok(());
                    }
                    format!("reading CLI stdout failed: {}", e)
                }
            };

            if !self.recover(failure).await? {
                return Ok(());
            }
        }
    }

    async fn flush_framer(&mut self) -> Result<bool, BridgeError> {
        let chunks = self.framer.finish()?;
        Ok(self.deliver_all(chunks).await)
    }

    /// Failure reason once stdout has closed, `None` for a clean exit
    async fn check_exit(&mut self) -> Option<String> {
        match tokio::time::timeout(self.settings.exit_grace, self.child.wait()).await {
            Ok(Ok(exit)) if exit.is_success() => {
                info!(session_id = %self.session_id, "CLI process exited");
                None
            }
            Ok(Ok(exit)) => Some(format!("CLI exited with {}", exit)),
            Ok(Err(e)) => Some(format!("waiting for CLI exit failed: {}", e)),
            Err(_) => Some(format!(
                "CLI closed stdout but was still running after {}ms",
                self.settings.exit_grace.as_millis()
            )),
        }
    }

    async fn deliver_all(&mut self, chunks: Vec<LogicalChunk>) -> bool {
        for chunk in chunks {
            if !self.deliver(chunk).await {
                return false;
            }
        }
        true
    }

    /// Normalizes one chunk under the session breaker and sends its envelope
    async fn deliver(&mut self, chunk: LogicalChunk) -> bool {
        let correlation_id = chunk.correlation_id.clone();
        let context = CallContext::new()
            .correlation_id(&correlation_id)
            .with("session_id", &self.session_id)
            .with("chunk_kind", chunk.kind);

        let normalizer = Arc::clone(&self.normalizer);
        let session_id = self.session_id.clone();
        let outcome = self
            .breaker
            .execute_with(context, move || async move {
                Ok::<_, Infallible>(normalizer.normalize(&chunk, &session_id))
            })
            .await;

        let metadata = self.metadata();
        let envelope = match outcome {
            Ok(Ok(message)) => ResponseEnvelope::success(correlation_id, message, metadata),
            Ok(Err(invalid)) => {
                ResponseEnvelope::failure(correlation_id, StructuredError::from(&invalid), metadata)
            }
            Err(call_err) => {
                debug!(
                    session_id = %self.session_id,
                    correlation_id = %correlation_id,
                    code = call_err.code(),
                    "Chunk not normalized"
                );
                let error = StructuredError::from_call_error(&call_err, self.breaker.state());
                ResponseEnvelope::failure(correlation_id, error, metadata)
            }
        };

        self.send(Ok(envelope)).await
    }

    /// Records a process failure and makes one relaunch attempt through the
    /// breaker. `Ok(true)` means streaming continues on a new process.
    async fn recover(&mut self, reason: String) -> Result<bool, BridgeError> {
        let failure = BridgeError::process(reason.clone());
        error!(session_id = %self.session_id, error = %failure, "CLI process failed");
        self.publish(BridgeEvent::ProcessFailed {
            session_id: self.session_id.clone(),
            code: failure.code().to_string(),
            message: reason.clone(),
        });

        let context = CallContext::new()
            .with("session_id", &self.session_id)
            .with("restarts", self.restarts);
        let record = failure.to_error();
        let _ = self
            .breaker
            .execute_with(context.clone(), move || async move { Err::<(), _>(record) })
            .await;

        if let Err(e) = self.child.terminate().await {
            warn!(session_id = %self.session_id, error = %e, "Failed to terminate failed CLI process");
        }

        let Some(relaunch) = self.relaunch.clone() else {
            return Err(failure);
        };
        if self.restarts >= self.settings.max_restarts {
            warn!(
                session_id = %self.session_id,
                restarts = self.restarts,
                "Restart limit reached, not relaunching"
            );
            return Err(failure);
        }
        self.restarts += 1;

        let Relaunch { launcher, spec } = relaunch;
        let probe = self
            .breaker
            .execute_with(context, move || async move { launcher.launch(&spec).await })
            .await;

        match probe {
            Ok(process) => {
                let ProcessHandle { stdout, stdin, child } = process;
                info!(
                    session_id = %self.session_id,
                    pid = ?child.pid(),
                    restarts = self.restarts,
                    "CLI process relaunched"
                );
                self.stdout = stdout;
                self.child = child;
                self.stdin.replace(stdin).await;
                self.framer = LineFramer::new(self.settings.max_message_size);

                let notice = format!("CLI process restarted after failure: {}", reason);
                self.publish(BridgeEvent::Recovered {
                    session_id: Some(self.session_id.clone()),
                    message: notice.clone(),
                });

                match ValidatedMessage::system(&self.session_id, notice, SystemLevel::Warning) {
                    Ok(message) => {
                        let envelope =
                            ResponseEnvelope::success(Uuid::new_v4().to_string(), message, self.metadata());
                        Ok(self.send(Ok(envelope)).await)
                    }
                    Err(e) => {
                        warn!(error = %e, "Recovery notice failed validation");
                        Ok(true)
                    }
                }
            }
            Err(call_err) => {
                let cause = BridgeError::from_call(call_err);
                self.publish(BridgeEvent::RecoveryFailed {
                    session_id: Some(self.session_id.clone()),
                    code: cause.code().to_string(),
                    message: cause.to_string(),
                });
                Err(BridgeError::process(format!("{}; recovery failed: {}", reason, cause)))
            }
        }
    }

    /// Sends one item, waiting for capacity; `false` once cancelled or the
    /// consumer is gone
    async fn send(&mut self, item: StreamItem) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    fn metadata(&self) -> EnvelopeMetadata {
        EnvelopeMetadata::new(Some(&self.session_id), &self.settings.version)
    }

    fn publish(&self, event: BridgeEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
