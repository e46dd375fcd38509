//! Tool Executor Framework - core types, the shell execution backend, and approval policy.

pub mod approval;
pub mod builtins;
pub mod command_blacklist;
pub mod execution;
pub mod output;
pub mod process;
pub mod pty;
pub mod shell;

pub use approval::{
    ApprovalDecision, ApprovalPolicy, ApprovalSubject, PermissionCheck, PermissionRules,
    PolicyVerdict, SessionAllowlist, check_command_permissions,
};
pub use command_blacklist::CommandBlacklist;
pub use execution::{ShellExecutionHandle, ShellExecutionRequest, ShellExecutionService};
pub use shell::{ShellError, ShellInvocation, ShellKind, ShellOverride};

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use keel_types::{ShellExecutionResult, ShellOutputEvent, ToolDefinition, ToolErrorKind, ToolKind};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;

/// Successful tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Text returned to the model.
    pub content: String,
    /// Settled shell result for shell-backed tools.
    pub shell: Option<ShellExecutionResult>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            shell: None,
        }
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Permission denied: {0}")]
    PermissionDenied(DenialReason),
    #[error("Tool execution failed: {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
}

impl ToolError {
    #[must_use]
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::BadArgs { .. } => ToolErrorKind::InvalidToolParams,
            ToolError::PermissionDenied(_) => ToolErrorKind::PermissionDenied,
            ToolError::ExecutionFailed { .. } | ToolError::DuplicateTool { .. } => {
                ToolErrorKind::ExecutionFailed
            }
            ToolError::UnknownTool { .. } => ToolErrorKind::ToolNotRegistered,
        }
    }
}

/// Why a call or command was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    Denylisted { tool: String },
    CommandBlacklisted { command: String, reason: String },
    BlockedCommand { command: String, rule: String },
    CommandSubstitution { command: String },
    PathOutsideWorkspace { attempted: PathBuf, root: PathBuf },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::Denylisted { tool } => write!(f, "Tool '{tool}' is denylisted"),
            DenialReason::CommandBlacklisted { command, reason } => {
                write!(f, "Command '{command}' is blocked: {reason}")
            }
            DenialReason::BlockedCommand { command, rule } => {
                write!(f, "Command '{command}' is blocked by rule '{rule}'")
            }
            DenialReason::CommandSubstitution { command } => write!(
                f,
                "Command substitution using $(), <(), or >() or backticks is not allowed: '{command}'"
            ),
            DenialReason::PathOutsideWorkspace { attempted, root } => write!(
                f,
                "Path '{}' is outside the working directory '{}'",
                attempted.display(),
                root.display()
            ),
        }
    }
}

/// Per-call execution context handed to executors.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub call_id: String,
    pub working_dir: PathBuf,
    /// Fires when the caller aborts this call. Executors pass it to their backend unmodified.
    pub cancel: CancellationToken,
    /// Live output sink. Dropped by the scheduler once the call settles.
    pub output: mpsc::UnboundedSender<ShellOutputEvent>,
}

/// Tool executor trait.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> Value;
    fn kind(&self) -> ToolKind;
    /// The shell command this call would run. Tools returning `Some` are
    /// checked against command permission rules instead of tool rules.
    fn command(&self, _args: &Value) -> Option<String> {
        None
    }
    fn approval_summary(&self, args: &Value) -> Result<String, ToolError>;
    /// Argument checks the schema cannot express, run before approval.
    fn validate(&self, _args: &Value, _working_dir: &Path) -> Result<(), ToolError> {
        Ok(())
    }
    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a>;
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// Tool registry keyed by tool name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.executors.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) -> Result<(), ToolError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ToolExecutor>, ToolError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .values()
            .map(|exec| ToolDefinition::new(exec.name(), exec.description(), exec.schema()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Validate tool arguments against the tool's JSON schema.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| ToolError::BadArgs {
        message: format!("Invalid tool schema: {e}"),
    })?;
    if let Err(err) = validator.validate(args) {
        return Err(ToolError::BadArgs {
            message: err.to_string(),
        });
    }
    Ok(())
}
