//! Shell execution service.
//!
//! `execute` spawns one command and returns immediately with its pid and a
//! handle to the settled result. Output is streamed as [`ShellOutputEvent`]s
//! on a channel owned by the caller; the channel closes when the execution
//! settles. Each execution has exactly one worker task, so chunks are
//! processed strictly in arrival order.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use keel_types::{
    ExecutionMethod, ShellExecutionResult, ShellOutputEvent, SpawnFailure, TerminalGeometry,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::output::{ChunkOutcome, OutputPipeline, OutputStream, combine_plain_output, strip_ansi};
use crate::process::{self, KILL_GRACE, ProcessGroupGuard};
use crate::pty::{self, ActivePtys};
use crate::shell::{ShellError, ShellInvocation};

/// How long to keep reading buffered output after the process exits.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_BUF_SIZE: usize = 8192;

/// Marker and pager settings for every spawned command.
pub(crate) fn child_environment() -> [(&'static str, &'static str); 4] {
    [
        ("KEEL_CLI", "1"),
        ("TERM", "xterm-256color"),
        ("PAGER", "cat"),
        ("GIT_PAGER", "cat"),
    ]
}

pub(crate) async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellExecutionRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub use_terminal_emulation: bool,
    /// Required for PTY execution; defaults to 80x30 when absent.
    pub geometry: Option<TerminalGeometry>,
}

impl ShellExecutionRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            use_terminal_emulation: false,
            geometry: None,
        }
    }

    #[must_use]
    pub fn with_terminal(mut self, geometry: TerminalGeometry) -> Self {
        self.use_terminal_emulation = true;
        self.geometry = Some(geometry);
        self
    }
}

/// A running (or already settled) execution.
#[derive(Debug)]
pub struct ShellExecutionHandle {
    /// `None` when nothing was spawned.
    pub pid: Option<u32>,
    result: oneshot::Receiver<ShellExecutionResult>,
}

impl ShellExecutionHandle {
    /// Wait for the settled result.
    pub async fn wait(self) -> ShellExecutionResult {
        match self.result.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(pid = ?self.pid, "execution worker dropped without settling");
                ShellExecutionResult::spawn_failed(SpawnFailure::new(
                    "execution worker exited before producing a result",
                ))
            }
        }
    }
}

/// Runs shell commands through a PTY or plain pipes.
#[derive(Clone)]
pub struct ShellExecutionService {
    shell: ShellInvocation,
    pty_enabled: bool,
    ptys: ActivePtys,
}

impl std::fmt::Debug for ShellExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellExecutionService")
            .field("shell", &self.shell)
            .field("pty_enabled", &self.pty_enabled)
            .field("active_ptys", &self.ptys.pids())
            .finish()
    }
}

impl ShellExecutionService {
    #[must_use]
    pub fn new(shell: ShellInvocation, pty_enabled: bool) -> Self {
        Self {
            shell,
            pty_enabled,
            ptys: ActivePtys::default(),
        }
    }

    #[must_use]
    pub fn shell(&self) -> &ShellInvocation {
        &self.shell
    }

    #[must_use]
    pub fn pty_enabled(&self) -> bool {
        self.pty_enabled
    }

    /// Spawn `request.command` and start streaming its output.
    ///
    /// Must be called from within a tokio runtime. Never fails: a spawn error
    /// settles the handle immediately with `error` set.
    pub fn execute(
        &self,
        request: ShellExecutionRequest,
        events: mpsc::UnboundedSender<ShellOutputEvent>,
        cancel: CancellationToken,
    ) -> ShellExecutionHandle {
        let (done_tx, done_rx) = oneshot::channel();

        if request.use_terminal_emulation && self.pty_enabled {
            let geometry = request.geometry.unwrap_or_default();
            match pty::spawn(&self.shell, &request, geometry) {
                Ok(process) => {
                    let pid = process.pid();
                    tracing::info!(?pid, command = %request.command, "spawned pty command");
                    pty::drive(process, self.ptys.clone(), events, cancel, done_tx);
                    return ShellExecutionHandle {
                        pid,
                        result: done_rx,
                    };
                }
                Err(err) => {
                    tracing::warn!(error = %err, "pty spawn failed, using plain execution");
                }
            }
        }

        match self.spawn_plain(&request) {
            Ok(child) => {
                let pid = child.id();
                tracing::info!(?pid, command = %request.command, "spawned command");
                tokio::spawn(async move {
                    let result = run_plain(child, pid, events, cancel).await;
                    let _ = done_tx.send(result);
                });
                ShellExecutionHandle {
                    pid,
                    result: done_rx,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, command = %request.command, "failed to spawn command");
                let _ = done_tx.send(ShellExecutionResult::spawn_failed(SpawnFailure::new(
                    err.to_string(),
                )));
                ShellExecutionHandle {
                    pid: None,
                    result: done_rx,
                }
            }
        }
    }

    /// Send input to a running PTY execution.
    pub fn write_to_pty(&self, pid: u32, data: &[u8]) -> Result<(), ShellError> {
        self.ptys.write(pid, data)
    }

    /// Resize a running PTY execution and its emulator.
    pub fn resize_pty(&self, pid: u32, geometry: TerminalGeometry) -> Result<(), ShellError> {
        self.ptys.resize(pid, geometry)
    }

    #[must_use]
    pub fn active_pty_pids(&self) -> Vec<u32> {
        self.ptys.pids()
    }

    fn spawn_plain(&self, request: &ShellExecutionRequest) -> std::io::Result<Child> {
        let mut cmd = tokio::process::Command::new(&self.shell.binary);
        cmd.args(&self.shell.args);
        #[cfg(windows)]
        {
            if self.shell.kind == crate::shell::ShellKind::Cmd {
                // cmd.exe /s strips exactly one pair of outer quotes.
                cmd.raw_arg(format!("\"{}\"", request.command));
            } else {
                cmd.arg(&request.command);
            }
        }
        #[cfg(not(windows))]
        cmd.arg(&request.command);

        cmd.current_dir(&request.cwd)
            .envs(child_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process::set_new_session(&mut cmd);

        cmd.spawn()
    }
}

fn spawn_reader<R>(stream: OutputStream, mut reader: R, tx: mpsc::UnboundedSender<(OutputStream, Vec<u8>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, ?stream, "output stream closed with error");
                    break;
                }
            }
        }
    });
}

/// Accumulated plain-backend text, already stripped of escape sequences.
struct PlainOutput {
    pipeline: OutputPipeline,
    stdout: String,
    stderr: String,
    events: mpsc::UnboundedSender<ShellOutputEvent>,
}

impl PlainOutput {
    fn handle(&mut self, stream: OutputStream, bytes: &[u8]) {
        match self.pipeline.push(stream, bytes) {
            Some(ChunkOutcome::Text(text)) => self.append(stream, &text),
            Some(ChunkOutcome::BinaryDetected { bytes_received }) => {
                let _ = self.events.send(ShellOutputEvent::BinaryDetected);
                let _ = self
                    .events
                    .send(ShellOutputEvent::BinaryProgress { bytes_received });
            }
            Some(ChunkOutcome::BinaryProgress { bytes_received }) => {
                let _ = self
                    .events
                    .send(ShellOutputEvent::BinaryProgress { bytes_received });
            }
            None => {}
        }
    }

    fn append(&mut self, stream: OutputStream, text: &str) {
        let clean = strip_ansi(text);
        if clean.is_empty() {
            return;
        }
        match stream {
            OutputStream::Stdout => self.stdout.push_str(&clean),
            OutputStream::Stderr => self.stderr.push_str(&clean),
        }
        let _ = self.events.send(ShellOutputEvent::Data { chunk: clean });
    }
}

async fn run_plain(
    mut child: Child,
    pid: Option<u32>,
    events: mpsc::UnboundedSender<ShellOutputEvent>,
    cancel: CancellationToken,
) -> ShellExecutionResult {
    let mut guard = ProcessGroupGuard::new(pid);
    let (tx, mut chunks) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(OutputStream::Stdout, stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(OutputStream::Stderr, stderr, tx.clone());
    }
    drop(tx);

    let mut output = PlainOutput {
        pipeline: OutputPipeline::new(),
        stdout: String::new(),
        stderr: String::new(),
        events,
    };
    let mut abort_requested = false;
    let mut kill_deadline: Option<Pin<Box<Sleep>>> = None;

    let status = loop {
        tokio::select! {
            biased;
            Some((stream, bytes)) = chunks.recv() => output.handle(stream, &bytes),
            status = child.wait() => break status,
            () = cancel.cancelled(), if !abort_requested => {
                abort_requested = true;
                tracing::debug!(?pid, "abort requested, terminating process group");
                match pid {
                    Some(pid) => {
                        if let Err(err) = process::terminate(pid) {
                            tracing::warn!(error = %err, pid, "failed to terminate process group");
                        }
                    }
                    None => {
                        let _ = child.start_kill();
                    }
                }
                kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
            }
            () = wait_deadline(&mut kill_deadline) => {
                kill_deadline = None;
                tracing::debug!(?pid, "grace period elapsed, killing process group");
                if let Some(pid) = pid {
                    let _ = process::force_kill(pid);
                }
                let _ = child.start_kill();
            }
        }
    };
    // A cancel that lands together with a natural exit still counts as an abort.
    let aborted = abort_requested || cancel.is_cancelled();
    guard.disarm();

    let _ = tokio::time::timeout(DRAIN_GRACE, async {
        while let Some((stream, bytes)) = chunks.recv().await {
            output.handle(stream, &bytes);
        }
    })
    .await;
    for stream in [OutputStream::Stdout, OutputStream::Stderr] {
        let tail = output.pipeline.finish(stream);
        output.append(stream, &tail);
    }

    let (exit_code, signal) = match status {
        Ok(status) => exit_parts(status),
        Err(err) => {
            tracing::warn!(error = %err, ?pid, "failed to wait for child");
            (None, None)
        }
    };
    tracing::info!(?pid, ?exit_code, ?signal, aborted, "command exited");

    let combined = combine_plain_output(&output.stdout, &output.stderr);
    ShellExecutionResult {
        raw_output: output.pipeline.into_raw_output(),
        output: combined,
        exit_code,
        signal,
        error: None,
        aborted,
        pid,
        execution_method: ExecutionMethod::Plain,
    }
}

fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}
