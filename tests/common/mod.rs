//! Shared test utilities and fixtures
//!
//! Sessions over a temporary working directory, plus event collection
//! helpers for driving the scheduler.

#![allow(dead_code)]

use std::time::Duration;

use keel_config::KeelConfig;
use keel_engine::{
    ConfirmationRequest, SchedulerEvent, SessionContext, SessionOverrides, ToolCallScheduler,
};
use keel_types::{ApprovalMode, ToolCall, ToolCallRequest};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

/// A running scheduler bound to its own temp workspace.
pub struct Session {
    pub scheduler: ToolCallScheduler,
    pub events: UnboundedReceiver<SchedulerEvent>,
    pub workspace: TempDir,
}

pub fn session(mode: ApprovalMode) -> Session {
    session_with(mode, false, &KeelConfig::default())
}

pub fn session_with(mode: ApprovalMode, pty: bool, config: &KeelConfig) -> Session {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let ctx = SessionContext::from_config(
        config,
        SessionOverrides {
            approval_mode: Some(mode),
            pty: Some(pty),
            geometry: None,
            working_dir: Some(workspace.path().to_path_buf()),
        },
    )
    .expect("session context");
    let (scheduler, events) = ToolCallScheduler::spawn(ctx);
    Session {
        scheduler,
        events,
        workspace,
    }
}

pub fn shell_call(id: &str, command: &str) -> ToolCallRequest {
    ToolCallRequest::new(id, "run_shell_command", json!({ "command": command }))
}

pub async fn next_event(events: &mut UnboundedReceiver<SchedulerEvent>) -> SchedulerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("scheduler event within timeout")
        .expect("scheduler still running")
}

/// Events before the batch completion, and the completed calls.
pub async fn collect_batch(
    events: &mut UnboundedReceiver<SchedulerEvent>,
) -> (Vec<SchedulerEvent>, Vec<ToolCall>) {
    let mut seen = Vec::new();
    loop {
        match next_event(events).await {
            SchedulerEvent::AllToolCallsComplete(calls) => return (seen, calls),
            other => seen.push(other),
        }
    }
}

pub async fn next_confirmation(
    events: &mut UnboundedReceiver<SchedulerEvent>,
) -> ConfirmationRequest {
    loop {
        if let SchedulerEvent::ConfirmationRequested(request) = next_event(events).await {
            return request;
        }
    }
}
