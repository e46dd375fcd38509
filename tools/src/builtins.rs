//! Built-in tool executors.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use keel_types::{ShellExecutionResult, ShellOutputEvent, TerminalGeometry, ToolKind};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{DenialReason, ToolCtx, ToolError, ToolExecutor, ToolFut, ToolOutput, ToolRegistry, parse_args};
use crate::execution::{ShellExecutionRequest, ShellExecutionService};

pub const SHELL_TOOL_NAME: &str = "run_shell_command";
pub const WRITE_FILE_TOOL_NAME: &str = "write_file";

/// Runs a command through the session's shell execution service.
#[derive(Debug, Clone)]
pub struct ShellTool {
    service: ShellExecutionService,
    geometry: TerminalGeometry,
}

impl ShellTool {
    #[must_use]
    pub fn new(service: ShellExecutionService, geometry: TerminalGeometry) -> Self {
        Self { service, geometry }
    }
}

#[derive(Debug, Default)]
pub struct WriteFileTool;

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

impl ShellArgs {
    /// The directory the command runs in, or why the arguments are unusable.
    fn checked_cwd(&self, root: &Path) -> Result<PathBuf, ToolError> {
        if self.command.trim().is_empty() {
            return Err(ToolError::BadArgs {
                message: "command must not be empty".to_string(),
            });
        }
        let Some(dir) = self.directory.as_deref() else {
            return Ok(root.to_path_buf());
        };
        let resolved = resolve_in_workspace(root, dir)?;
        if !resolved.is_dir() {
            return Err(ToolError::BadArgs {
                message: format!("Directory '{dir}' does not exist"),
            });
        }
        Ok(resolved)
    }
}

impl WriteFileArgs {
    fn target(&self, root: &Path) -> Result<PathBuf, ToolError> {
        if self.path.trim().is_empty() {
            return Err(ToolError::BadArgs {
                message: "path must not be empty".to_string(),
            });
        }
        resolve_in_workspace(root, &self.path)
    }
}

impl ToolExecutor for ShellTool {
    fn name(&self) -> &'static str {
        SHELL_TOOL_NAME
    }

    fn description(&self) -> &'static str {
        "Run a shell command. Output streams while the command runs."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Exact command line to run." },
                "description": { "type": "string", "description": "Brief description of the command for the user." },
                "directory": { "type": "string", "description": "Directory to run in, relative to the working directory." }
            },
            "required": ["command"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }

    fn command(&self, args: &serde_json::Value) -> Option<String> {
        args.get("command")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }

    fn approval_summary(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        let typed: ShellArgs = parse_args(args)?;
        Ok(match typed.description.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => {
                format!("Run command: {} ({description})", typed.command)
            }
            _ => format!("Run command: {}", typed.command),
        })
    }

    fn validate(&self, args: &serde_json::Value, working_dir: &Path) -> Result<(), ToolError> {
        let typed: ShellArgs = parse_args(args)?;
        typed.checked_cwd(working_dir).map(drop)
    }

    fn execute<'a>(&'a self, args: serde_json::Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ShellArgs = parse_args(&args)?;
            let cwd = typed.checked_cwd(&ctx.working_dir)?;

            let mut request = ShellExecutionRequest::new(&typed.command, &cwd);
            if self.service.pty_enabled() {
                request = request.with_terminal(self.geometry);
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            let handle = self.service.execute(request, tx, ctx.cancel.clone());
            tracing::debug!(call_id = %ctx.call_id, pid = ?handle.pid, "shell tool dispatched");

            let forward = async {
                let mut binary_bytes = None;
                while let Some(event) = rx.recv().await {
                    if let ShellOutputEvent::BinaryProgress { bytes_received } = event {
                        binary_bytes = Some(bytes_received);
                    }
                    let _ = ctx.output.send(event);
                }
                binary_bytes
            };
            let (result, binary_bytes) = tokio::join!(handle.wait(), forward);

            let content = format_shell_content(&typed, &result, binary_bytes);
            Ok(ToolOutput {
                content,
                shell: Some(result),
            })
        })
    }
}

fn format_shell_content(
    args: &ShellArgs,
    result: &ShellExecutionResult,
    binary_bytes: Option<u64>,
) -> String {
    let output = match binary_bytes {
        Some(bytes) => format!("[binary output: {bytes} bytes received]"),
        None if result.output.trim().is_empty() => "(empty)".to_string(),
        None => result.output.clone(),
    };

    let mut content = String::new();
    if result.aborted {
        content.push_str("Command was cancelled before it could complete.\n");
    }
    let _ = writeln!(content, "Command: {}", args.command);
    let _ = writeln!(
        content,
        "Directory: {}",
        args.directory.as_deref().unwrap_or("(root)")
    );
    let _ = writeln!(content, "Output: {output}");
    let _ = writeln!(
        content,
        "Error: {}",
        result
            .error
            .as_ref()
            .map_or_else(|| "(none)".to_string(), ToString::to_string)
    );
    let _ = writeln!(
        content,
        "Exit Code: {}",
        result
            .exit_code
            .map_or_else(|| "(none)".to_string(), |code| code.to_string())
    );
    let _ = write!(
        content,
        "Signal: {}",
        result
            .signal
            .map_or_else(|| "(none)".to_string(), |signal| signal.to_string())
    );
    content
}

impl ToolExecutor for WriteFileTool {
    fn name(&self) -> &'static str {
        WRITE_FILE_TOOL_NAME
    }

    fn description(&self) -> &'static str {
        "Write content to a file, creating directories as needed"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the working directory." },
                "content": { "type": "string", "description": "Full file content to write." }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn approval_summary(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        let typed: WriteFileArgs = parse_args(args)?;
        Ok(format!(
            "Write file: {} ({} bytes)",
            typed.path,
            typed.content.len()
        ))
    }

    fn validate(&self, args: &serde_json::Value, working_dir: &Path) -> Result<(), ToolError> {
        let typed: WriteFileArgs = parse_args(args)?;
        typed.target(working_dir).map(drop)
    }

    fn execute<'a>(&'a self, args: serde_json::Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: WriteFileArgs = parse_args(&args)?;
            let resolved = typed.target(&ctx.working_dir)?;
            if let Some(parent) = resolved.parent()
                && !parent.exists()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed {
                        tool: WRITE_FILE_TOOL_NAME.to_string(),
                        message: format!(
                            "failed to create parent directories for {}: {e}",
                            resolved.display()
                        ),
                    })?;
            }

            let byte_len = typed.content.len();
            tokio::fs::write(&resolved, typed.content)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool: WRITE_FILE_TOOL_NAME.to_string(),
                    message: format!("failed to write {}: {e}", resolved.display()),
                })?;
            tracing::info!(path = %resolved.display(), bytes = byte_len, "wrote file");

            Ok(ToolOutput::text(format!(
                "Wrote {byte_len} bytes to {}",
                typed.path
            )))
        })
    }
}

/// Register the built-in tools.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    service: ShellExecutionService,
    geometry: TerminalGeometry,
) -> Result<(), ToolError> {
    registry.register(std::sync::Arc::new(ShellTool::new(service, geometry)))?;
    registry.register(std::sync::Arc::new(WriteFileTool))?;
    Ok(())
}

/// Resolve `requested` against `root`, refusing anything that lands outside it.
///
/// Existing ancestors are canonicalized so symlinks cannot escape the root.
pub fn resolve_in_workspace(root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| normalize_lexically(root));
    let joined = normalize_lexically(&root.join(requested));
    let resolved = canonicalize_existing_prefix(&joined);
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(ToolError::PermissionDenied(DenialReason::PathOutsideWorkspace {
            attempted: PathBuf::from(requested),
            root,
        }))
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(mut canonical) = std::fs::canonicalize(existing) {
            for name in rest.iter().rev() {
                canonical.push(name);
            }
            return canonical;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
