//! CLI process plumbing
//!
//! ```text
//! Launcher::launch(LaunchSpec) --> ProcessHandle
//!                                   |-- stdout --> pipeline
//!                                   |-- stdin  --> StdinWriter <-- send_message
//!                                   `-- child  --> ChildControl (wait / terminate)
//! ```
//!
//! The [`Launcher`] and [`ChildControl`] traits are the seams tests use to
//! substitute scripted processes for the real CLI.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    /// Terminated without an exit code, e.g. by a signal
    Signal,
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signal => write!(f, "terminated by signal"),
        }
    }
}

/// Control over a launched child process
#[async_trait]
pub trait ChildControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Waits for the process to exit
    async fn wait(&mut self) -> Result<ProcessExit>;

    /// Exit status if the process has already exited
    fn try_exit(&mut self) -> Result<Option<ProcessExit>>;

    /// Kills the process; a no-op once it has exited
    async fn terminate(&mut self) -> Result<()>;
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Pipes and control of one running CLI process
pub struct ProcessHandle {
    pub stdout: BoxedReader,
    pub stdin: BoxedWriter,
    pub child: Box<dyn ChildControl>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.child.pid())
            .finish()
    }
}

/// Everything needed to start the CLI for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub project_path: PathBuf,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            project_path: project_path.into(),
            env: HashMap::new(),
        }
    }

    /// Arguments for an interactive chat in the project directory
    pub fn args(&self) -> Vec<String> {
        vec![
            "chat".to_string(),
            "--project".to_string(),
            self.project_path.display().to_string(),
        ]
    }
}

/// Starts CLI processes
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;
}

/// Launches the real CLI with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        info!(
            executable = %spec.executable.display(),
            project = %spec.project_path.display(),
            "Starting CLI process"
        );

        let mut cmd = Command::new(&spec.executable);
        cmd.args(spec.args())
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if spec.project_path.is_dir() {
            cmd.current_dir(&spec.project_path);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::spawn(format!("{}: {}", spec.executable.display(), e)))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::spawn("stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::spawn("stdin not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "cli_bridge::cli_stderr", pid = ?pid, "{}", line);
                }
            });
        }

        debug!(pid = ?pid, "CLI process started");

        Ok(ProcessHandle {
            stdout: Box::new(stdout),
            stdin: Box::new(stdin),
            child: Box::new(SystemChild { child }),
        })
    }
}

/// [`ChildControl`] over a `tokio::process::Child`
#[derive(Debug)]
pub struct SystemChild {
    child: Child,
}

fn exit_of(status: std::process::ExitStatus) -> ProcessExit {
    status.code().map(ProcessExit::Code).unwrap_or(ProcessExit::Signal)
}

#[async_trait]
impl ChildControl for SystemChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        Ok(exit_of(self.child.wait().await?))
    }

    fn try_exit(&mut self) -> Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(exit_of))
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        let pid = self.child.id();
        match self.child.kill().await {
            Ok(()) => {
                debug!(pid = ?pid, "CLI process killed");
                Ok(())
            }
            // Exited between the check and the kill
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared, replaceable writer for a session's stdin
///
/// Writes fail with `StdinClosed` once the pipe is gone; the pipeline swaps
/// in a new pipe after relaunching the process.
#[derive(Clone)]
pub struct StdinWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
    write_timeout: Duration,
}

impl fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdinWriter")
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl StdinWriter {
    pub fn new(stdin: BoxedWriter, write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stdin))),
            write_timeout,
        }
    }

    /// Writes `text` followed by a newline
    pub async fn send_line(&self, text: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BridgeError::StdinClosed("no running process".to_string()))?;

        let mut payload = String::with_capacity(text.len() + 1);
        payload.push_str(text);
        payload.push('\n');

        let outcome = tokio::time::timeout(self.write_timeout, async {
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(error = %e, "Write to CLI stdin failed, closing pipe");
                *guard = None;
                Err(BridgeError::StdinClosed(e.to_string()))
            }
            Err(_) => Err(BridgeError::Timeout(format!(
                "stdin write did not complete within {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }

    /// Attaches the stdin of a relaunched process
    pub async fn replace(&self, stdin: BoxedWriter) {
        *self.inner.lock().await = Some(stdin);
    }

    /// Shuts the pipe down; later writes fail with `StdinClosed`
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_launch_args() {
        let spec = LaunchSpec::new("assistant", "/work/project");
        assert_eq!(spec.args(), vec!["chat", "--project", "/work/project"]);
    }

    #[test]
    fn test_exit_display() {
        assert!(ProcessExit::Code(0).is_success());
        assert!(!ProcessExit::Code(2).is_success());
        assert!(!ProcessExit::Signal.is_success());
        assert_eq!(ProcessExit::Code(2).to_string(), "exit code 2");
    }

    #[tokio::test]
    async fn test_send_line_appends_newline() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = StdinWriter::new(Box::new(client), Duration::from_secs(1));

        writer.send_line("hello").await.unwrap();

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn test_send_after_peer_closed_fails_immediately() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let writer = StdinWriter::new(Box::new(client), Duration::from_secs(1));

        let err = writer.send_line("hello").await.unwrap_err();
        assert_eq!(err.code(), "STDIN_CLOSED");
        assert!(!writer.is_open().await);

        let err = writer.send_line("again").await.unwrap_err();
        assert_eq!(err.code(), "STDIN_CLOSED");
    }

    #[tokio::test]
    async fn test_replace_reopens_writer() {
        let (client, _server) = tokio::io::duplex(64);
        let writer = StdinWriter::new(Box::new(client), Duration::from_secs(1));
        writer.close().await;
        assert!(writer.send_line("x").await.is_err());

        let (client, mut server) = tokio::io::duplex(64);
        writer.replace(Box::new(client)).await;
        writer.send_line("y").await.unwrap();

        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"y\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_times_out() {
        let (client, _server) = tokio::io::duplex(4);
        let writer = StdinWriter::new(Box::new(client), Duration::from_millis(100));

        let err = writer.send_line("more than four bytes").await.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_launcher_spawn_failure() {
        let spec = LaunchSpec::new("/nonexistent/assistant-cli", "/tmp");
        let err = CommandLauncher::new().launch(&spec).await.unwrap_err();
        assert_eq!(err.code(), "PROCESS_SPAWN_FAILED");
    }
}
