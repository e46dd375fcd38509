//! PTY-backed execution.
//!
//! The child runs attached to a pseudo-terminal, so stdout and stderr arrive
//! merged. Decoded text is written into a headless vt100 emulator and the
//! rendered buffer becomes the output, which resolves cursor movement and
//! overwrites the way a real terminal would.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_types::{ExecutionMethod, ShellExecutionResult, ShellOutputEvent, TerminalGeometry};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::execution::{DRAIN_GRACE, ShellExecutionRequest, child_environment, wait_deadline};
use crate::output::{ChunkOutcome, OutputPipeline, OutputStream};
use crate::process::{KILL_GRACE, ProcessGroupGuard};
use crate::shell::{ShellError, ShellInvocation};

/// Lines of history kept above the visible screen.
pub const SCROLLBACK_LINES: usize = 10_000;

const READ_BUF_SIZE: usize = 8192;

/// Headless terminal that renders PTY output.
///
/// vt100 can only show scrollback one screen at a time, so rows are copied
/// into `history` as they scroll off the primary screen.
pub struct TerminalBuffer {
    parser: vt100::Parser,
    /// Scrolled-off lines, oldest first, capped at [`SCROLLBACK_LINES`].
    history: VecDeque<String>,
    /// Parser scrollback rows already copied into `history`.
    captured: usize,
    capacity: usize,
}

impl TerminalBuffer {
    #[must_use]
    pub fn new(geometry: TerminalGeometry) -> Self {
        let geometry = geometry.clamped();
        let capacity = parser_capacity(geometry.rows);
        Self {
            parser: vt100::Parser::new(geometry.rows, geometry.cols, capacity),
            history: VecDeque::new(),
            captured: 0,
            capacity,
        }
    }

    /// Feed text in pieces of at most one screen height of characters, so
    /// each piece scrolls at most that many lines into history.
    pub fn write(&mut self, text: &str) {
        let step = usize::from(self.parser.screen().size().0).max(1);
        let mut start = 0;
        for (end, _) in text.char_indices().skip(step).step_by(step) {
            self.feed(&text[start..end]);
            start = end;
        }
        self.feed(&text[start..]);
    }

    pub fn resize(&mut self, geometry: TerminalGeometry) {
        let geometry = geometry.clamped();
        self.parser.set_size(geometry.rows, geometry.cols);
    }

    /// History plus screen, each line right-trimmed, trailing blank lines removed.
    #[must_use]
    pub fn render(&self) -> String {
        let (_, cols) = self.parser.screen().size();
        let screen: Vec<String> = self.parser.screen().rows(0, cols).collect();

        let mut text = self
            .history
            .iter()
            .chain(screen.iter())
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n");
        text.truncate(text.trim_end().len());
        text
    }

    fn feed(&mut self, piece: &str) {
        self.parser.process(piece.as_bytes());
        // The alternate screen has no scrollback.
        if self.parser.screen().alternate_screen() {
            return;
        }

        let total = self.scrollback_len();
        let added = total.saturating_sub(self.captured);
        let (rows, cols) = self.parser.screen().size();
        if added > 0 {
            // Offsets past the screen height are not addressable; a single
            // scroll-up sequence larger than that keeps only its newest rows.
            let visible = added.min(usize::from(rows));
            self.parser.set_scrollback(visible);
            let lines: Vec<String> = self.parser.screen().rows(0, cols).take(visible).collect();
            self.parser.set_scrollback(0);
            self.history.extend(lines);
            while self.history.len() > SCROLLBACK_LINES {
                self.history.pop_front();
            }
        }
        self.captured = total;

        if total + 2 * usize::from(rows) > self.capacity {
            self.restart_parser();
        }
    }

    fn scrollback_len(&mut self) -> usize {
        self.parser.set_scrollback(usize::MAX);
        let len = self.parser.screen().scrollback();
        self.parser.set_scrollback(0);
        len
    }

    /// Replace a parser whose scrollback is nearly full with one holding only
    /// the current screen state; full scrollback would hide new rows.
    fn restart_parser(&mut self) {
        let (rows, cols) = self.parser.screen().size();
        let state = self.parser.screen().state_formatted();
        self.capacity = parser_capacity(rows);
        self.parser = vt100::Parser::new(rows, cols, self.capacity);
        self.parser.process(&state);
        self.captured = self.scrollback_len();
    }
}

fn parser_capacity(rows: u16) -> usize {
    SCROLLBACK_LINES + 2 * usize::from(rows)
}

enum PtyControl {
    Resize(TerminalGeometry),
}

struct ActivePty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    control: mpsc::UnboundedSender<PtyControl>,
}

/// PTYs of running executions, keyed by child pid.
#[derive(Clone, Default)]
pub(crate) struct ActivePtys {
    inner: Arc<Mutex<HashMap<u32, ActivePty>>>,
}

impl ActivePtys {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ActivePty>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, pid: u32, pty: ActivePty) {
        self.lock().insert(pid, pty);
    }

    fn remove(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    pub(crate) fn write(&self, pid: u32, data: &[u8]) -> Result<(), ShellError> {
        let mut ptys = self.lock();
        let pty = ptys.get_mut(&pid).ok_or(ShellError::NoActivePty(pid))?;
        pty.writer.write_all(data)?;
        pty.writer.flush()?;
        Ok(())
    }

    pub(crate) fn resize(&self, pid: u32, geometry: TerminalGeometry) -> Result<(), ShellError> {
        let geometry = geometry.clamped();
        let ptys = self.lock();
        let pty = ptys.get(&pid).ok_or(ShellError::NoActivePty(pid))?;
        pty.master
            .resize(pty_size(geometry))
            .map_err(|e| ShellError::Pty(e.to_string()))?;
        let _ = pty.control.send(PtyControl::Resize(geometry));
        Ok(())
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

/// A child spawned on a fresh PTY, not yet being driven.
pub(crate) struct PtyProcess {
    pid: Option<u32>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    geometry: TerminalGeometry,
}

impl PtyProcess {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn pty_size(geometry: TerminalGeometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Open a PTY and spawn the command on it.
///
/// Errors here are synchronous spawn failures; the caller falls back to plain
/// execution for this call.
pub(crate) fn spawn(
    shell: &ShellInvocation,
    request: &ShellExecutionRequest,
    geometry: TerminalGeometry,
) -> Result<PtyProcess, ShellError> {
    let geometry = geometry.clamped();
    let pair = native_pty_system()
        .openpty(pty_size(geometry))
        .map_err(|e| ShellError::Pty(e.to_string()))?;

    let mut builder = CommandBuilder::new(&shell.binary);
    builder.args(shell.argv(&request.command));
    builder.cwd(&request.cwd);
    for (key, value) in child_environment() {
        builder.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| ShellError::Pty(e.to_string()))?;
    // The child holds its own copy; ours would keep the PTY open after exit.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ShellError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ShellError::Pty(e.to_string()))?;

    Ok(PtyProcess {
        pid: child.process_id(),
        child,
        reader,
        master: pair.master,
        writer,
        geometry,
    })
}

/// Start the reader and waiter threads and the worker task for a spawned PTY.
pub(crate) fn drive(
    process: PtyProcess,
    registry: ActivePtys,
    events: mpsc::UnboundedSender<ShellOutputEvent>,
    cancel: CancellationToken,
    done: oneshot::Sender<ShellExecutionResult>,
) {
    let PtyProcess {
        pid,
        mut child,
        reader,
        master,
        writer,
        geometry,
    } = process;

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let killer = child.clone_killer();

    // Without a pid the PTY cannot be addressed, but it must stay open.
    let unregistered = match pid {
        Some(pid) => {
            registry.insert(
                pid,
                ActivePty {
                    master,
                    writer,
                    control: control_tx,
                },
            );
            None
        }
        None => Some((master, writer)),
    };

    std::thread::spawn(move || read_loop(reader, &output_tx));
    std::thread::spawn(move || {
        let _ = exit_tx.send(child.wait());
    });

    // Travels with the worker future, so a runtime that drops it unfinished
    // still takes the child down.
    let mut guard = ProcessGroupGuard::new(pid);
    tokio::spawn(async move {
        let worker = PtyWorker {
            pid,
            terminal: TerminalBuffer::new(geometry),
            pipeline: OutputPipeline::new(),
            rendered: String::new(),
            events,
        };
        let result = worker
            .run(output_rx, control_rx, exit_rx, killer, &cancel)
            .await;
        guard.disarm();
        if let Some(pid) = pid {
            registry.remove(pid);
        }
        drop(unregistered);
        let _ = done.send(result);
    });
}

fn read_loop(mut reader: Box<dyn Read + Send>, output: &mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // EIO once the child side closes.
            Err(_) => break,
        }
    }
}

struct PtyWorker {
    pid: Option<u32>,
    terminal: TerminalBuffer,
    pipeline: OutputPipeline,
    rendered: String,
    events: mpsc::UnboundedSender<ShellOutputEvent>,
}

impl PtyWorker {
    async fn run(
        mut self,
        mut output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut control_rx: mpsc::UnboundedReceiver<PtyControl>,
        mut exit_rx: oneshot::Receiver<std::io::Result<portable_pty::ExitStatus>>,
        mut killer: Box<dyn ChildKiller + Send + Sync>,
        cancel: &CancellationToken,
    ) -> ShellExecutionResult {
        let mut abort_requested = false;
        let mut kill_deadline: Option<Pin<Box<Sleep>>> = None;

        let exit = loop {
            tokio::select! {
                biased;
                Some(bytes) = output_rx.recv() => self.handle_chunk(&bytes),
                Some(control) = control_rx.recv() => match control {
                    PtyControl::Resize(geometry) => {
                        self.terminal.resize(geometry);
                        if !self.pipeline.is_binary() {
                            self.publish_render();
                        }
                    }
                },
                exit = &mut exit_rx => break exit,
                () = cancel.cancelled(), if !abort_requested => {
                    abort_requested = true;
                    self.hang_up(killer.as_mut());
                    kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
                }
                () = wait_deadline(&mut kill_deadline) => {
                    kill_deadline = None;
                    self.force_kill(killer.as_mut());
                }
            }
        };
        let aborted = abort_requested || cancel.is_cancelled();

        let _ = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(bytes) = output_rx.recv().await {
                self.handle_chunk(&bytes);
            }
        })
        .await;
        let tail = self.pipeline.finish(OutputStream::Stdout);
        if !tail.is_empty() {
            self.terminal.write(&tail);
            self.publish_render();
        }

        let exit_code = match exit {
            Ok(Ok(status)) => Some(status.exit_code() as i32),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, pid = ?self.pid, "failed to wait for pty child");
                None
            }
            Err(_) => None,
        };
        tracing::info!(pid = ?self.pid, ?exit_code, aborted, "pty command exited");

        let output = if self.pipeline.is_binary() {
            self.rendered
        } else {
            self.terminal.render()
        };
        ShellExecutionResult {
            raw_output: self.pipeline.into_raw_output(),
            output,
            exit_code,
            signal: None,
            error: None,
            aborted,
            pid: self.pid,
            execution_method: ExecutionMethod::Pty,
        }
    }

    fn handle_chunk(&mut self, bytes: &[u8]) {
        match self.pipeline.push(OutputStream::Stdout, bytes) {
            Some(ChunkOutcome::Text(text)) => {
                self.terminal.write(&text);
                self.publish_render();
            }
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

    fn publish_render(&mut self) {
        let rendered = self.terminal.render();
        if rendered != self.rendered {
            self.rendered = rendered;
            let _ = self.events.send(ShellOutputEvent::Data {
                chunk: self.rendered.clone(),
            });
        }
    }

    fn hang_up(&self, killer: &mut (dyn ChildKiller + Send + Sync)) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if let Err(err) = crate::process::hang_up(pid) {
                tracing::warn!(error = %err, pid, "failed to send SIGHUP");
            }
            return;
        }
        if let Err(err) = killer.kill() {
            tracing::warn!(error = %err, pid = ?self.pid, "failed to kill pty child");
        }
    }

    fn force_kill(&self, killer: &mut (dyn ChildKiller + Send + Sync)) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let _ = crate::process::force_kill(pid);
            return;
        }
        let _ = killer.kill();
    }
}
