//! Scripted stand-ins for the assistant CLI

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;

use cli_bridge::pipeline::StreamItem;
use cli_bridge::process::BoxedReader;
use cli_bridge::{BridgeError, ChildControl, LaunchSpec, Launcher, ProcessExit, ProcessHandle, ResponseStream};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct FakeChild {
    pid: u32,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ChildControl for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> cli_bridge::Result<ProcessExit> {
        let mut rx = self.exit.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(exit) = current {
                return Ok(exit);
            }
            if rx.changed().await.is_err() {
                return Ok(ProcessExit::Signal);
            }
        }
    }

    fn try_exit(&mut self) -> cli_bridge::Result<Option<ProcessExit>> {
        Ok(*self.exit.borrow())
    }

    async fn terminate(&mut self) -> cli_bridge::Result<()> {
        let running = self.exit.borrow().is_none();
        if running {
            self.killed.store(true, Ordering::SeqCst);
            self.exit.send_replace(Some(ProcessExit::Signal));
        }
        Ok(())
    }
}

/// Test-side controls of a fake process
pub struct FakeProcess {
    stdout: Option<DuplexStream>,
    stdin: BufReader<DuplexStream>,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
    killed: Arc<AtomicBool>,
}

impl FakeProcess {
    /// Writes raw output as the CLI would
    pub async fn write(&mut self, text: impl AsRef<[u8]>) {
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.write_all(text.as_ref()).await.unwrap();
        }
    }

    pub fn exit(&self, code: i32) {
        self.exit.send_replace(Some(ProcessExit::Code(code)));
    }

    pub fn close_stdout(&mut self) {
        self.stdout = None;
    }

    /// Exits with `code` and closes stdout
    pub fn finish(&mut self, code: i32) {
        self.exit(code);
        self.close_stdout();
    }

    /// Next line the pipeline wrote to stdin
    pub async fn read_input(&mut self) -> Option<String> {
        let mut line = String::new();
        match tokio::time::timeout(Duration::from_secs(5), self.stdin.read_line(&mut line)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => None,
            Ok(Ok(_)) => Some(line),
        }
    }

    /// True when the process was killed while still running
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

static NEXT_PID: AtomicUsize = AtomicUsize::new(1000);

fn fake_parts(stdout: BoxedReader, stdout_writer: Option<DuplexStream>) -> (ProcessHandle, FakeProcess) {
    let (stdin_writer, stdin_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (exit, _) = watch::channel(None);
    let exit = Arc::new(exit);
    let killed = Arc::new(AtomicBool::new(false));

    let handle = ProcessHandle {
        stdout,
        stdin: Box::new(stdin_writer),
        child: Box::new(FakeChild {
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst) as u32,
            exit: Arc::clone(&exit),
            killed: Arc::clone(&killed),
        }),
    };
    let fake = FakeProcess {
        stdout: stdout_writer,
        stdin: BufReader::new(stdin_reader),
        exit,
        killed,
    };
    (handle, fake)
}

/// A running fake process whose stdout the test writes to
pub fn fake_process() -> (ProcessHandle, FakeProcess) {
    fake_process_with_pipe(PIPE_CAPACITY)
}

pub fn fake_process_with_pipe(capacity: usize) -> (ProcessHandle, FakeProcess) {
    let (writer, reader) = tokio::io::duplex(capacity);
    fake_parts(Box::new(reader), Some(writer))
}

/// A fake process reading stdout from a prepared reader
pub fn fake_process_from(stdout: BoxedReader) -> (ProcessHandle, FakeProcess) {
    fake_parts(stdout, None)
}

/// Hands out prepared processes in order
#[derive(Default)]
pub struct ScriptedLauncher {
    processes: Mutex<VecDeque<ProcessHandle>>,
    launches: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, process: ProcessHandle) {
        self.processes.lock().unwrap().push_back(process);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> cli_bridge::Result<ProcessHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.processes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BridgeError::spawn(format!("{}: no process available", spec.executable.display())))
    }
}

/// Drains the stream, failing the test if it does not end
pub async fn collect(stream: ResponseStream) -> Vec<StreamItem> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not end")
}

/// Next item, failing the test on timeout
pub async fn next(stream: &mut ResponseStream) -> Option<StreamItem> {
    tokio::time::timeout(Duration::from_secs(5), stream.next_envelope())
        .await
        .expect("no envelope arrived")
}
