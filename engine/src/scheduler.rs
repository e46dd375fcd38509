//! Tool call scheduler.
//!
//! One actor task owns every [`ToolCall`] of the current batch and the
//! session allowlist. Callers talk to it through [`ToolCallScheduler`];
//! executions run in their own tasks and report back over a private
//! channel. Scheduler state is only touched by the actor, so there are no
//! locks and no mutation happens across an await.
//!
//! Batch lifecycle: a call scheduled while the current batch still has a
//! non-terminal call joins that batch. When every call is terminal the
//! actor emits [`SchedulerEvent::AllToolCallsComplete`] once, in request
//! order, and starts a fresh batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use keel_tools::{
    ApprovalDecision, ApprovalSubject, SessionAllowlist, ToolCtx, ToolError, ToolExecutor,
    ToolOutput, validate_args,
};
use keel_types::{
    ConfirmationOutcome, ShellOutputEvent, ToolCall, ToolCallError, ToolCallRequest,
    ToolCallResult, ToolCallState, ToolErrorKind,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::context::SessionContext;

/// Events emitted by the scheduler, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    StateChanged {
        call_id: String,
        state: ToolCallState,
    },
    ConfirmationRequested(ConfirmationRequest),
    Output {
        call_id: String,
        event: ShellOutputEvent,
    },
    /// Every call of the batch, settled, in request order.
    AllToolCallsComplete(Vec<ToolCall>),
}

/// A call waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub call_id: String,
    pub tool_name: String,
    pub summary: String,
    pub reason: String,
    /// Added to the session allowlist on [`ConfirmationOutcome::ProceedAlways`].
    pub allowlist_entries: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("tool call scheduler has shut down")]
    Closed,
}

enum Command {
    Schedule {
        requests: Vec<ToolCallRequest>,
        cancel: CancellationToken,
    },
    Confirm {
        call_id: String,
        outcome: ConfirmationOutcome,
    },
    Allowlist {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Reports from execution and abort-watch tasks.
enum TaskMessage {
    Output {
        call_id: String,
        event: ShellOutputEvent,
    },
    Finished {
        call_id: String,
        result: Result<ToolOutput, ToolError>,
        /// Whether the abort signal had fired when the tool returned.
        aborted: bool,
    },
    /// The abort signal fired while the call was awaiting approval.
    AbortedWhileWaiting { call_id: String },
}

/// Handle to a running scheduler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ToolCallScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl ToolCallScheduler {
    /// Start the scheduler actor. Must be called within a tokio runtime.
    ///
    /// The actor keeps running until every handle is dropped and the
    /// current batch has settled.
    #[must_use]
    pub fn spawn(ctx: SessionContext) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let actor = SchedulerActor {
            ctx,
            allowlist: SessionAllowlist::new(),
            batch: Vec::new(),
            index: HashMap::new(),
            events: event_tx,
            task_tx,
        };
        tokio::spawn(actor.run(cmd_rx, task_rx));
        (Self { commands: cmd_tx }, event_rx)
    }

    /// Schedule a group of calls sharing one abort signal.
    ///
    /// Returns once the calls are queued; progress arrives as events.
    pub fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        self.send(Command::Schedule { requests, cancel })
    }

    pub fn schedule_one(
        &self,
        request: ToolCallRequest,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        self.schedule(vec![request], cancel)
    }

    /// Answer a [`ConfirmationRequest`]. Answers for unknown calls, or calls
    /// that are no longer awaiting approval, are ignored.
    pub fn confirm(
        &self,
        call_id: impl Into<String>,
        outcome: ConfirmationOutcome,
    ) -> Result<(), SchedulerError> {
        self.send(Command::Confirm {
            call_id: call_id.into(),
            outcome,
        })
    }

    /// Snapshot of the session allowlist.
    pub async fn session_allowlist(&self) -> Result<Vec<String>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Allowlist { reply })?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Closed)
    }
}

struct Entry {
    call: ToolCall,
    cancel: CancellationToken,
    pending: Option<PendingApproval>,
}

struct PendingApproval {
    executor: Arc<dyn ToolExecutor>,
    allowlist_entries: Vec<String>,
    /// Stops the abort watcher once the call leaves `AwaitingApproval`.
    _watch: DropGuard,
}

struct SchedulerActor {
    ctx: SessionContext,
    allowlist: SessionAllowlist,
    /// Current batch in request order.
    batch: Vec<Entry>,
    /// First batch position of each call id.
    index: HashMap<String, usize>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    task_tx: mpsc::UnboundedSender<TaskMessage>,
}

impl SchedulerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut tasks: mpsc::UnboundedReceiver<TaskMessage>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                Some(message) = tasks.recv() => self.handle_task(message),
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
            }
            // Back-to-back schedule calls land in the same batch.
            while commands_open {
                match commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => commands_open = false,
                }
            }
            if !commands_open {
                self.cancel_unanswerable();
            }
            self.complete_batch_if_settled();

            if !commands_open && self.batch.is_empty() {
                break;
            }
        }
        tracing::debug!("tool call scheduler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Schedule { requests, cancel } => {
                for request in requests {
                    self.add(request, cancel.clone());
                }
            }
            Command::Confirm { call_id, outcome } => self.confirm(&call_id, outcome),
            Command::Allowlist { reply } => {
                let _ = reply.send(self.allowlist.entries());
            }
        }
    }

    fn handle_task(&mut self, message: TaskMessage) {
        match message {
            TaskMessage::Output { call_id, event } => {
                let Some(idx) = self.live_index(&call_id) else {
                    return;
                };
                self.batch[idx].call.live_output.push(event.clone());
                self.emit(SchedulerEvent::Output { call_id, event });
            }
            TaskMessage::Finished {
                call_id,
                result,
                aborted,
            } => {
                if let Some(idx) = self.live_index(&call_id) {
                    self.settle(idx, result, aborted);
                }
            }
            TaskMessage::AbortedWhileWaiting { call_id } => {
                if let Some(idx) = self.live_index(&call_id)
                    && self.batch[idx].call.state == ToolCallState::AwaitingApproval
                {
                    self.batch[idx].pending = None;
                    self.finish(
                        idx,
                        ToolCallState::Cancelled,
                        ToolCallResult::error(ToolErrorKind::Aborted, "Cancelled before execution"),
                    );
                }
            }
        }
    }

    /// Validation pipeline. Every failure is a terminal transition of this
    /// call only.
    fn add(&mut self, request: ToolCallRequest, cancel: CancellationToken) {
        let call_id = request.call_id.clone();
        let idx = self.batch.len();
        self.batch.push(Entry {
            call: ToolCall::new(request),
            cancel,
            pending: None,
        });
        tracing::debug!(call_id = %call_id, "validating tool call");
        self.emit(SchedulerEvent::StateChanged {
            call_id: call_id.clone(),
            state: ToolCallState::Validating,
        });

        if self.index.contains_key(&call_id) {
            self.fail(
                idx,
                ToolErrorKind::DuplicateCallId,
                format!("Duplicate tool call id: {call_id}"),
            );
            return;
        }
        self.index.insert(call_id, idx);

        if self.batch[idx].cancel.is_cancelled() {
            self.finish(
                idx,
                ToolCallState::Cancelled,
                ToolCallResult::error(ToolErrorKind::Aborted, "Cancelled before execution"),
            );
            return;
        }

        let request = &self.batch[idx].call.request;
        let executor = match self.ctx.registry().lookup(&request.name) {
            Ok(executor) => executor,
            Err(err) => {
                self.fail(idx, err.kind(), err.to_string());
                return;
            }
        };
        if let Err(err) = validate_args(&executor.schema(), &request.arguments)
            .and_then(|()| executor.validate(&request.arguments, self.ctx.working_dir()))
        {
            self.fail(idx, err.kind(), err.to_string());
            return;
        }

        match self.decide(executor.as_ref(), &request.arguments) {
            ApprovalDecision::HardDeny(reason) => {
                self.fail(idx, ToolErrorKind::PermissionDenied, reason.to_string());
            }
            ApprovalDecision::AutoApprove => self.start(idx, executor),
            ApprovalDecision::RequireConfirmation {
                reason,
                allowlist_entries,
            } => self.request_confirmation(idx, executor, reason, allowlist_entries),
        }
    }

    fn decide(&self, executor: &dyn ToolExecutor, args: &serde_json::Value) -> ApprovalDecision {
        let command = executor.command(args);
        let subject = match command.as_deref() {
            Some(command) => ApprovalSubject::Command {
                tool: executor.name(),
                command,
            },
            None => ApprovalSubject::Tool {
                name: executor.name(),
                kind: executor.kind(),
            },
        };
        self.ctx
            .policy()
            .decide(subject, executor.kind(), &self.allowlist)
    }

    fn request_confirmation(
        &mut self,
        idx: usize,
        executor: Arc<dyn ToolExecutor>,
        reason: String,
        allowlist_entries: Vec<String>,
    ) {
        let summary = match executor.approval_summary(&self.batch[idx].call.request.arguments) {
            Ok(summary) => summary,
            Err(err) => {
                self.fail(idx, err.kind(), err.to_string());
                return;
            }
        };
        if !self.transition(idx, ToolCallState::AwaitingApproval) {
            return;
        }

        let call_id = self.batch[idx].call.call_id().to_string();
        let watch = self.watch_abort(call_id.clone(), self.batch[idx].cancel.clone());
        self.batch[idx].pending = Some(PendingApproval {
            executor: Arc::clone(&executor),
            allowlist_entries: allowlist_entries.clone(),
            _watch: watch,
        });
        self.emit(SchedulerEvent::ConfirmationRequested(ConfirmationRequest {
            call_id,
            tool_name: executor.name().to_string(),
            summary,
            reason,
            allowlist_entries,
        }));
    }

    /// Report an abort while the call waits, until the guard is dropped.
    fn watch_abort(&self, call_id: String, cancel: CancellationToken) -> DropGuard {
        let watch = CancellationToken::new();
        let stopped = watch.clone();
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = tx.send(TaskMessage::AbortedWhileWaiting { call_id });
                }
                () = stopped.cancelled() => {}
            }
        });
        watch.drop_guard()
    }

    fn confirm(&mut self, call_id: &str, outcome: ConfirmationOutcome) {
        let Some(idx) = self.live_index(call_id) else {
            tracing::warn!(call_id, "confirmation for unknown tool call ignored");
            return;
        };
        let Some(pending) = self.batch[idx].pending.take() else {
            tracing::warn!(
                call_id,
                state = %self.batch[idx].call.state,
                "confirmation for tool call not awaiting approval ignored"
            );
            return;
        };

        match outcome {
            ConfirmationOutcome::Cancel => {
                self.finish(
                    idx,
                    ToolCallState::Cancelled,
                    ToolCallResult::error(ToolErrorKind::Aborted, "Cancelled by user"),
                );
            }
            ConfirmationOutcome::ProceedOnce => self.start(idx, pending.executor),
            ConfirmationOutcome::ProceedAlways => {
                self.allowlist.extend(pending.allowlist_entries);
                tracing::debug!(allowlist = ?self.allowlist.entries(), "session allowlist updated");
                self.start(idx, pending.executor);
                self.release_newly_allowed();
            }
        }
    }

    /// With every handle gone, nobody can confirm the waiting calls.
    fn cancel_unanswerable(&mut self) {
        for idx in 0..self.batch.len() {
            if self.batch[idx].pending.take().is_some() {
                self.finish(
                    idx,
                    ToolCallState::Cancelled,
                    ToolCallResult::error(ToolErrorKind::Aborted, "Scheduler shut down"),
                );
            }
        }
    }

    /// Start any waiting call that the grown allowlist now covers.
    fn release_newly_allowed(&mut self) {
        for idx in 0..self.batch.len() {
            let Some(pending) = self.batch[idx].pending.as_ref() else {
                continue;
            };
            let decision = self.decide(
                pending.executor.as_ref(),
                &self.batch[idx].call.request.arguments,
            );
            if decision == ApprovalDecision::AutoApprove
                && let Some(pending) = self.batch[idx].pending.take()
            {
                tracing::debug!(call_id = %self.batch[idx].call.call_id(), "approved by session allowlist");
                self.start(idx, pending.executor);
            }
        }
    }

    fn start(&mut self, idx: usize, executor: Arc<dyn ToolExecutor>) {
        if self.batch[idx].cancel.is_cancelled() {
            self.finish(
                idx,
                ToolCallState::Cancelled,
                ToolCallResult::error(ToolErrorKind::Aborted, "Cancelled before execution"),
            );
            return;
        }
        if !self.transition(idx, ToolCallState::Scheduled)
            || !self.transition(idx, ToolCallState::Executing)
        {
            return;
        }

        let entry = &self.batch[idx];
        let call_id = entry.call.call_id().to_string();
        let tool_name = entry.call.request.name.clone();
        let args = entry.call.request.arguments.clone();
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let tool_ctx = ToolCtx {
            call_id: call_id.clone(),
            working_dir: self.ctx.working_dir().to_path_buf(),
            cancel: entry.cancel.clone(),
            output: output_tx,
        };

        let mut join_handle = tokio::spawn(async move {
            let result = executor.execute(args, &tool_ctx).await;
            (result, tool_ctx.cancel.is_cancelled())
        });
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let joined = loop {
                tokio::select! {
                    biased;
                    Some(event) = output_rx.recv() => {
                        let _ = task_tx.send(TaskMessage::Output { call_id: call_id.clone(), event });
                    }
                    joined = &mut join_handle => break joined,
                }
            };
            // Events produced while the tool was finishing.
            while let Ok(event) = output_rx.try_recv() {
                let _ = task_tx.send(TaskMessage::Output {
                    call_id: call_id.clone(),
                    event,
                });
            }
            let (result, aborted) = joined.unwrap_or_else(|err| {
                tracing::error!(call_id = %call_id, error = %err, "tool task failed");
                let failure = ToolError::ExecutionFailed {
                    tool: tool_name,
                    message: format!("tool task failed: {err}"),
                };
                (Err(failure), false)
            });
            let _ = task_tx.send(TaskMessage::Finished {
                call_id,
                result,
                aborted,
            });
        });
    }

    /// Turn an execution result into the call's terminal state.
    ///
    /// Abort signals that arrive after the tool returned do not change the
    /// outcome. A shell result carries its own abort flag, fixed when the
    /// backend settled; other tools use `aborted_at_return`.
    fn settle(
        &mut self,
        idx: usize,
        result: Result<ToolOutput, ToolError>,
        aborted_at_return: bool,
    ) {
        match result {
            Ok(output) => {
                let aborted = output
                    .shell
                    .as_ref()
                    .map_or(aborted_at_return, |shell| shell.aborted);
                let spawn_failure = output
                    .shell
                    .as_ref()
                    .and_then(|shell| shell.error.as_ref())
                    .map(ToString::to_string);
                let (state, error) = if aborted {
                    (
                        ToolCallState::Cancelled,
                        Some(ToolCallError::new(ToolErrorKind::Aborted, "Cancelled by user")),
                    )
                } else if let Some(message) = spawn_failure {
                    (
                        ToolCallState::Error,
                        Some(ToolCallError::new(ToolErrorKind::SpawnFailure, message)),
                    )
                } else {
                    (ToolCallState::Success, None)
                };
                let result = ToolCallResult {
                    content: output.content,
                    error,
                    shell: output.shell,
                };
                self.finish(idx, state, result);
            }
            Err(err) if aborted_at_return => {
                tracing::debug!(error = %err, "tool failed after abort");
                self.finish(
                    idx,
                    ToolCallState::Cancelled,
                    ToolCallResult::error(ToolErrorKind::Aborted, "Cancelled by user"),
                );
            }
            Err(err) => self.fail(idx, err.kind(), err.to_string()),
        }
    }

    fn fail(&mut self, idx: usize, kind: ToolErrorKind, message: String) {
        tracing::debug!(call_id = %self.batch[idx].call.call_id(), %kind, %message, "tool call failed");
        self.finish(idx, ToolCallState::Error, ToolCallResult::error(kind, message));
    }

    fn finish(&mut self, idx: usize, state: ToolCallState, result: ToolCallResult) {
        let call = &mut self.batch[idx].call;
        call.result = Some(result);
        call.finished_at = Some(SystemTime::now());
        self.transition(idx, state);
    }

    fn transition(&mut self, idx: usize, next: ToolCallState) -> bool {
        let call = &mut self.batch[idx].call;
        if !call.state.can_transition_to(next) {
            tracing::warn!(
                call_id = %call.call_id(),
                from = %call.state,
                to = %next,
                "illegal tool call transition ignored"
            );
            return false;
        }
        tracing::debug!(call_id = %call.call_id(), from = %call.state, to = %next, "tool call transition");
        call.state = next;
        let event = SchedulerEvent::StateChanged {
            call_id: call.call_id().to_string(),
            state: next,
        };
        self.emit(event);
        true
    }

    /// Batch position of a non-terminal call.
    fn live_index(&self, call_id: &str) -> Option<usize> {
        self.index
            .get(call_id)
            .copied()
            .filter(|&idx| !self.batch[idx].call.state.is_terminal())
    }

    fn complete_batch_if_settled(&mut self) {
        if self.batch.is_empty() || self.batch.iter().any(|e| !e.call.state.is_terminal()) {
            return;
        }
        self.index.clear();
        let calls: Vec<ToolCall> = self.batch.drain(..).map(|entry| entry.call).collect();
        tracing::info!(calls = calls.len(), "tool call batch complete");
        self.emit(SchedulerEvent::AllToolCallsComplete(calls));
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{SchedulerEvent, ToolCallScheduler};
    use crate::context::SessionContext;
    use keel_tools::{
        ApprovalPolicy, PermissionRules, ShellExecutionService, ShellInvocation, ShellKind,
        ToolCtx, ToolError, ToolExecutor, ToolFut, ToolOutput, ToolRegistry,
    };
    use keel_types::{
        ApprovalMode, ConfirmationOutcome, ExecutionMethod, ShellExecutionResult,
        ShellOutputEvent, TerminalGeometry, ToolCall, ToolCallRequest, ToolCallState,
        ToolErrorKind, ToolKind,
    };
    use serde_json::{Value, json};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Read-only tool that echoes its `text` argument.
    struct Echo;

    impl ToolExecutor for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &'static str {
            "echo text"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        fn kind(&self) -> ToolKind {
            ToolKind::Read
        }
        fn approval_summary(&self, _args: &Value) -> Result<String, ToolError> {
            Ok("echo".into())
        }
        fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
            Box::pin(async move {
                let text = args["text"].as_str().unwrap_or_default().to_string();
                let _ = ctx.output.send(ShellOutputEvent::Data {
                    chunk: text.clone(),
                });
                Ok(ToolOutput::text(text))
            })
        }
    }

    /// Pretends to run `command`. `wait` blocks until abort; `settle-then-abort`
    /// exits cleanly and fires the abort signal on its way out.
    struct FakeShell;

    impl ToolExecutor for FakeShell {
        fn name(&self) -> &'static str {
            "shell"
        }
        fn description(&self) -> &'static str {
            "fake shell"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            })
        }
        fn kind(&self) -> ToolKind {
            ToolKind::Execute
        }
        fn command(&self, args: &Value) -> Option<String> {
            args["command"].as_str().map(str::to_string)
        }
        fn approval_summary(&self, args: &Value) -> Result<String, ToolError> {
            Ok(format!("Run command: {}", args["command"].as_str().unwrap_or_default()))
        }
        fn validate(&self, args: &Value, _working_dir: &Path) -> Result<(), ToolError> {
            if args["command"].as_str().is_some_and(|c| c.trim().is_empty()) {
                return Err(ToolError::BadArgs {
                    message: "command must not be empty".into(),
                });
            }
            Ok(())
        }
        fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
            Box::pin(async move {
                let command = args["command"].as_str().unwrap_or_default().to_string();
                if command == "settle-then-abort" {
                    let shell = ShellExecutionResult {
                        raw_output: b"done".to_vec(),
                        output: "done".into(),
                        exit_code: Some(0),
                        signal: None,
                        error: None,
                        aborted: false,
                        pid: Some(4242),
                        execution_method: ExecutionMethod::Plain,
                    };
                    ctx.cancel.cancel();
                    return Ok(ToolOutput {
                        content: "done".into(),
                        shell: Some(shell),
                    });
                }
                if command == "wait" {
                    let _ = ctx.output.send(ShellOutputEvent::Data {
                        chunk: "partial".into(),
                    });
                    ctx.cancel.cancelled().await;
                    return Ok(ToolOutput::text("partial"));
                }
                Ok(ToolOutput::text(format!("ran: {command}")))
            })
        }
    }

    /// Edit-class tool.
    struct Touch;

    impl ToolExecutor for Touch {
        fn name(&self) -> &'static str {
            "touch"
        }
        fn description(&self) -> &'static str {
            "pretend edit"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn kind(&self) -> ToolKind {
            ToolKind::Edit
        }
        fn approval_summary(&self, _args: &Value) -> Result<String, ToolError> {
            Ok("touch".into())
        }
        fn execute<'a>(&'a self, _args: Value, _ctx: &'a ToolCtx) -> ToolFut<'a> {
            Box::pin(async { Ok(ToolOutput::text("touched")) })
        }
    }

    fn spawn_scheduler(mode: ApprovalMode) -> (ToolCallScheduler, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let mut registry = ToolRegistry::default();
        registry.register(Arc::new(Echo)).unwrap();
        registry.register(Arc::new(FakeShell)).unwrap();
        registry.register(Arc::new(Touch)).unwrap();
        let mut rules = PermissionRules::with_defaults().unwrap();
        rules.allowed_commands = vec!["ls".into()];
        rules.blocked_commands = vec!["curl".into()];
        let ctx = SessionContext::new(
            std::env::temp_dir(),
            registry,
            ApprovalPolicy::new(mode, rules),
            ShellExecutionService::new(ShellInvocation::new(ShellKind::Sh, "/bin/sh"), false),
            TerminalGeometry::default(),
        );
        ToolCallScheduler::spawn(ctx)
    }

    fn echo(id: &str, text: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "echo", json!({ "text": text }))
    }

    fn shell(id: &str, command: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "shell", json!({ "command": command }))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> SchedulerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("scheduler event within timeout")
            .expect("scheduler running")
    }

    /// Collect events up to and including the batch completion.
    async fn until_complete(
        rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> (Vec<SchedulerEvent>, Vec<ToolCall>) {
        let mut seen = Vec::new();
        loop {
            match next_event(rx).await {
                SchedulerEvent::AllToolCallsComplete(calls) => return (seen, calls),
                other => seen.push(other),
            }
        }
    }

    async fn until_confirmation(
        rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> super::ConfirmationRequest {
        loop {
            if let SchedulerEvent::ConfirmationRequested(request) = next_event(rx).await {
                return request;
            }
        }
    }

    fn states_of(events: &[SchedulerEvent], id: &str) -> Vec<ToolCallState> {
        events
            .iter()
            .filter_map(|event| match event {
                SchedulerEvent::StateChanged { call_id, state } if call_id == id => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn mixed_batch_completes_once_in_request_order() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        let bad = ToolCallRequest::new("bad", "echo", json!({ "text": 42 }));
        scheduler
            .schedule(vec![bad, echo("good", "hi")], CancellationToken::new())
            .unwrap();

        let (events, calls) = until_complete(&mut rx).await;
        let ids: Vec<&str> = calls.iter().map(ToolCall::call_id).collect();
        assert_eq!(ids, vec!["bad", "good"]);
        assert_eq!(calls[0].state, ToolCallState::Error);
        assert_eq!(calls[0].error_kind(), Some(ToolErrorKind::InvalidToolParams));
        assert_eq!(calls[1].state, ToolCallState::Success);
        assert_eq!(calls[1].result.as_ref().unwrap().content, "hi");
        assert!(calls[1].finished_at.is_some());
        assert!(!states_of(&events, "bad").contains(&ToolCallState::Executing));
        assert_eq!(
            states_of(&events, "good"),
            vec![
                ToolCallState::Validating,
                ToolCallState::Scheduled,
                ToolCallState::Executing,
                ToolCallState::Success
            ]
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no second completion");
    }

    #[tokio::test]
    async fn back_to_back_schedules_share_a_batch() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule_one(echo("a", "1"), CancellationToken::new())
            .unwrap();
        scheduler
            .schedule_one(echo("b", "2"), CancellationToken::new())
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_calls_fail_alone() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule(
                vec![
                    echo("same", "first"),
                    echo("same", "second"),
                    ToolCallRequest::new("ghost", "nope", json!({})),
                ],
                CancellationToken::new(),
            )
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].state, ToolCallState::Success);
        assert_eq!(calls[0].result.as_ref().unwrap().content, "first");
        assert_eq!(calls[1].error_kind(), Some(ToolErrorKind::DuplicateCallId));
        assert_eq!(calls[2].error_kind(), Some(ToolErrorKind::ToolNotRegistered));
    }

    #[tokio::test]
    async fn output_events_are_forwarded_and_recorded() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule_one(echo("out", "streamed"), CancellationToken::new())
            .unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        let expected = ShellOutputEvent::Data {
            chunk: "streamed".into(),
        };
        assert!(events.contains(&SchedulerEvent::Output {
            call_id: "out".into(),
            event: expected.clone(),
        }));
        assert_eq!(calls[0].live_output, vec![expected]);
    }

    #[tokio::test]
    async fn hard_denial_beats_yolo() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Yolo);
        scheduler
            .schedule(
                vec![shell("rm", "rm -rf /"), shell("curl", "curl example.com")],
                CancellationToken::new(),
            )
            .unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        for call in &calls {
            assert_eq!(call.error_kind(), Some(ToolErrorKind::PermissionDenied));
            assert!(!states_of(&events, call.call_id()).contains(&ToolCallState::Executing));
        }
    }

    #[tokio::test]
    async fn yolo_and_allowlist_skip_confirmation() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Yolo);
        scheduler
            .schedule_one(shell("c", "cargo test"), CancellationToken::new())
            .unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Success);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SchedulerEvent::ConfirmationRequested(_)))
        );

        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule_one(shell("ls", "ls -la"), CancellationToken::new())
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].result.as_ref().unwrap().content, "ran: ls -la");
    }

    #[tokio::test]
    async fn auto_edit_only_waives_edits() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::AutoEdit);
        scheduler
            .schedule_one(ToolCallRequest::new("t", "touch", json!({})), CancellationToken::new())
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Success);

        scheduler
            .schedule_one(shell("s", "make"), CancellationToken::new())
            .unwrap();
        let request = until_confirmation(&mut rx).await;
        assert_eq!(request.call_id, "s");
    }

    #[tokio::test]
    async fn proceed_once_runs_without_growing_allowlist() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule_one(shell("c", "cargo build"), CancellationToken::new())
            .unwrap();
        let request = until_confirmation(&mut rx).await;
        assert_eq!(request.summary, "Run command: cargo build");
        assert_eq!(request.allowlist_entries, vec!["cargo"]);

        scheduler
            .confirm("c", ConfirmationOutcome::ProceedOnce)
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Success);
        assert!(scheduler.session_allowlist().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proceed_always_allowlists_for_the_session() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule(
                vec![shell("a", "npm test"), shell("b", "npm run build")],
                CancellationToken::new(),
            )
            .unwrap();
        let first = until_confirmation(&mut rx).await;
        assert_eq!(first.call_id, "a");
        let second = until_confirmation(&mut rx).await;
        assert_eq!(second.call_id, "b");

        scheduler
            .confirm("a", ConfirmationOutcome::ProceedAlways)
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert!(calls.iter().all(|c| c.state == ToolCallState::Success));
        assert_eq!(scheduler.session_allowlist().await.unwrap(), vec!["npm"]);

        // A later identical call is approved automatically.
        scheduler
            .schedule_one(shell("c", "npm test"), CancellationToken::new())
            .unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Success);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SchedulerEvent::ConfirmationRequested(_)))
        );
    }

    #[tokio::test]
    async fn cancel_outcome_cancels_only_that_call() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule(
                vec![shell("risky", "make install"), echo("fine", "ok")],
                CancellationToken::new(),
            )
            .unwrap();
        let request = until_confirmation(&mut rx).await;
        scheduler
            .confirm(request.call_id, ConfirmationOutcome::Cancel)
            .unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Cancelled);
        assert_eq!(calls[0].error_kind(), Some(ToolErrorKind::Aborted));
        assert!(!states_of(&events, "risky").contains(&ToolCallState::Executing));
        assert_eq!(calls[1].state, ToolCallState::Success);
    }

    #[tokio::test]
    async fn abort_while_awaiting_approval_never_executes() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        let cancel = CancellationToken::new();
        scheduler
            .schedule_one(shell("w", "make"), cancel.clone())
            .unwrap();
        let _ = until_confirmation(&mut rx).await;
        cancel.cancel();
        let (events, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Cancelled);
        assert!(!states_of(&events, "w").contains(&ToolCallState::Executing));

        // A late confirmation is ignored.
        scheduler
            .confirm("w", ConfirmationOutcome::ProceedOnce)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abort_while_executing_keeps_partial_result() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Yolo);
        let cancel = CancellationToken::new();
        scheduler
            .schedule_one(shell("long", "wait"), cancel.clone())
            .unwrap();
        loop {
            if let SchedulerEvent::Output { .. } = next_event(&mut rx).await {
                break;
            }
        }
        cancel.cancel();
        cancel.cancel();
        let (_, calls) = until_complete(&mut rx).await;
        let call = &calls[0];
        assert_eq!(call.state, ToolCallState::Cancelled);
        assert_eq!(call.error_kind(), Some(ToolErrorKind::Aborted));
        assert_eq!(call.result.as_ref().unwrap().content, "partial");
    }

    #[tokio::test]
    async fn abort_after_the_shell_settled_keeps_success() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Yolo);
        let cancel = CancellationToken::new();
        scheduler
            .schedule_one(shell("late", "settle-then-abort"), cancel.clone())
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert!(cancel.is_cancelled());
        let call = &calls[0];
        assert_eq!(call.state, ToolCallState::Success);
        assert_eq!(call.error_kind(), None);
        let shell = call.result.as_ref().unwrap().shell.as_ref().unwrap();
        assert!(!shell.aborted);
        assert_eq!(shell.exit_code, Some(0));
    }

    #[tokio::test]
    async fn unusable_arguments_fail_before_approval() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule(
                vec![shell("blank", "   "), echo("fine", "ok")],
                CancellationToken::new(),
            )
            .unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Error);
        assert_eq!(calls[0].error_kind(), Some(ToolErrorKind::InvalidToolParams));
        assert_eq!(
            states_of(&events, "blank"),
            vec![ToolCallState::Validating, ToolCallState::Error]
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SchedulerEvent::ConfirmationRequested(_)))
        );
        assert_eq!(calls[1].state, ToolCallState::Success);
    }

    #[tokio::test]
    async fn already_aborted_calls_are_cancelled() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Yolo);
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.schedule_one(echo("x", "never"), cancel).unwrap();
        let (events, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Cancelled);
        assert_eq!(
            states_of(&events, "x"),
            vec![ToolCallState::Validating, ToolCallState::Cancelled]
        );
    }

    #[tokio::test]
    async fn confirmation_for_unknown_call_is_ignored() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .confirm("missing", ConfirmationOutcome::ProceedAlways)
            .unwrap();
        assert!(scheduler.session_allowlist().await.unwrap().is_empty());
        scheduler
            .schedule_one(echo("after", "still works"), CancellationToken::new())
            .unwrap();
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Success);
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_waiting_calls() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler
            .schedule_one(shell("orphan", "make"), CancellationToken::new())
            .unwrap();
        let _ = until_confirmation(&mut rx).await;
        drop(scheduler);
        let (_, calls) = until_complete(&mut rx).await;
        assert_eq!(calls[0].state, ToolCallState::Cancelled);
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(closed, Ok(None)), "actor stops after the last batch");
    }

    #[tokio::test]
    async fn empty_schedule_emits_nothing() {
        let (scheduler, mut rx) = spawn_scheduler(ApprovalMode::Default);
        scheduler.schedule(Vec::new(), CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
