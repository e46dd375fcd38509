//! Core domain types for Keel.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod approval;
mod shell;
mod state;

pub use approval::{ApprovalMode, ConfirmationOutcome, ParseApprovalModeError, ToolKind};
pub use shell::{
    ExecutionMethod, ShellExecutionResult, ShellOutputEvent, SpawnFailure, TerminalGeometry,
};
pub use state::ToolCallState;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

// ============================================================================
// Tool call requests
// ============================================================================

/// A tool invocation issued by the model.
///
/// Immutable once created; the scheduler wraps it in a [`ToolCall`] to track
/// its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique within a batch.
    pub call_id: String,
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ToolCallRequest {
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

// ============================================================================
// Tool call outcomes
// ============================================================================

/// Classification of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidToolParams,
    PermissionDenied,
    ToolNotRegistered,
    DuplicateCallId,
    SpawnFailure,
    ExecutionFailed,
    Aborted,
}

impl ToolErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidToolParams => "invalid_tool_params",
            Self::PermissionDenied => "permission_denied",
            Self::ToolNotRegistered => "tool_not_registered",
            Self::DuplicateCallId => "duplicate_call_id",
            Self::SpawnFailure => "spawn_failure",
            Self::ExecutionFailed => "execution_failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolCallError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Settled result attached to a [`ToolCall`] once it reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    /// Text handed back to the model.
    pub content: String,
    pub error: Option<ToolCallError>,
    /// Present for shell-backed tools, including aborted ones.
    pub shell: Option<ShellExecutionResult>,
}

impl ToolCallResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
            shell: None,
        }
    }

    pub fn error(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: format!("Error: {message}"),
            error: Some(ToolCallError::new(kind, message)),
            shell: None,
        }
    }

    #[must_use]
    pub fn with_shell(mut self, shell: ShellExecutionResult) -> Self {
        self.shell = Some(shell);
        self
    }
}

// ============================================================================
// Tracked tool calls
// ============================================================================

/// A tool call tracked by the scheduler.
///
/// Only the scheduler mutates these. Callers receive snapshots through
/// scheduler events.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub request: ToolCallRequest,
    pub state: ToolCallState,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    /// Output events in arrival order. Append-only until the call is terminal.
    pub live_output: Vec<ShellOutputEvent>,
    pub result: Option<ToolCallResult>,
}

impl ToolCall {
    #[must_use]
    pub fn new(request: ToolCallRequest) -> Self {
        Self {
            request,
            state: ToolCallState::Validating,
            started_at: SystemTime::now(),
            finished_at: None,
            live_output: Vec::new(),
            result: None,
        }
    }

    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.request.call_id
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.result
            .as_ref()
            .and_then(|r| r.error.as_ref())
            .map(|e| e.kind)
    }
}
