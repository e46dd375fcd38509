//! Keel CLI - runs tool calls through the scheduler from the terminal.
//!
//! ```text
//! keel [OPTIONS] -- <COMMAND>...      one shell command
//! keel [OPTIONS] --requests calls.json  a batch of tool call requests
//! ```
//!
//! Approval prompts are read from stdin. Ctrl-C aborts every running call.
//! The process exit code mirrors the shell's for single commands.

mod prompt;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use keel_config::KeelConfig;
use keel_engine::{SchedulerEvent, SessionContext, SessionOverrides, ToolCallScheduler};
use keel_types::{ApprovalMode, TerminalGeometry, ToolCall, ToolCallRequest, ToolCallState};

use crate::prompt::{Prompter, print_output_event};

const SHELL_TOOL: &str = "run_shell_command";

/// Exit code used when the run was aborted, matching shells on SIGINT.
const ABORTED_EXIT: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "keel", version, about)]
struct Args {
    /// Approval mode: default, auto_edit, or yolo.
    #[arg(long, value_name = "MODE")]
    approval_mode: Option<ApprovalMode>,

    /// Store --approval-mode in the config file.
    #[arg(long, requires = "approval_mode")]
    save_approval_mode: bool,

    /// Run commands inside a pseudo-terminal.
    #[arg(long, overrides_with = "no_pty")]
    pty: bool,

    #[arg(long, overrides_with = "pty")]
    no_pty: bool,

    /// Terminal width for PTY execution.
    #[arg(long)]
    cols: Option<u16>,

    /// Terminal height for PTY execution.
    #[arg(long)]
    rows: Option<u16>,

    /// Working directory for the session.
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// JSON file holding an array of tool call requests. Use `-` for stdin.
    #[arg(long, value_name = "FILE", conflicts_with = "command")]
    requests: Option<PathBuf>,

    /// List registered tools as JSON and exit.
    #[arg(long)]
    list_tools: bool,

    /// Shell command to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn pty_override(&self) -> Option<bool> {
        match (self.pty, self.no_pty) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    fn geometry_override(&self, config: &KeelConfig) -> Option<TerminalGeometry> {
        if self.cols.is_none() && self.rows.is_none() {
            return None;
        }
        let base = config.geometry();
        Some(TerminalGeometry::new(
            self.cols.unwrap_or(base.cols),
            self.rows.unwrap_or(base.rows),
        ))
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_keel_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Command output owns stdout and stderr; no log file means no logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_keel_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in keel_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn keel_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.keel/logs/keel.log
    if let Some(config_path) = KeelConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("keel.log"));
    }

    candidates.push(std::env::temp_dir().join("keel").join("keel.log"));

    candidates
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing();

    let config = match KeelConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("keel: {e}; continuing with defaults");
            tracing::warn!(error = %e, "config ignored");
            KeelConfig::default()
        }
    };

    if args.save_approval_mode
        && let Some(mode) = args.approval_mode
    {
        KeelConfig::persist_approval_mode(mode).context("failed to save approval mode")?;
        eprintln!("keel: approval mode set to {mode}");
    }

    let overrides = SessionOverrides {
        approval_mode: args.approval_mode,
        pty: args.pty_override(),
        geometry: args.geometry_override(&config),
        working_dir: args.cwd.clone(),
    };
    let ctx = SessionContext::from_config(&config, overrides)?;

    if args.list_tools {
        let defs = ctx.registry().definitions();
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(ExitCode::SUCCESS);
    }

    let single_command = !args.command.is_empty();
    let requests = if single_command {
        let command = args.command.join(" ");
        vec![ToolCallRequest::new(
            uuid::Uuid::new_v4().to_string(),
            SHELL_TOOL,
            serde_json::json!({ "command": command }),
        )]
    } else if let Some(path) = args.requests.as_ref() {
        read_requests(path)?
    } else if args.save_approval_mode {
        return Ok(ExitCode::SUCCESS);
    } else {
        bail!("nothing to run: pass a command or --requests FILE");
    };
    if requests.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    // Rendered PTY frames replace each other, so only the final output is shown.
    let stream_output = single_command && !ctx.shell().pty_enabled();

    let cancel = CancellationToken::new();
    let (scheduler, mut events) = ToolCallScheduler::spawn(ctx);
    scheduler.schedule(requests, cancel.clone())?;

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, aborting tool calls");
            interrupt.cancel();
        }
    });

    let mut prompter = Prompter::stdin();
    let calls = loop {
        let Some(event) = events.recv().await else {
            bail!("scheduler stopped before the batch completed");
        };
        match event {
            SchedulerEvent::ConfirmationRequested(request) => {
                let outcome = prompter.ask(&request, &cancel).await;
                scheduler.confirm(request.call_id, outcome)?;
            }
            SchedulerEvent::Output { event, .. } if stream_output => print_output_event(&event),
            SchedulerEvent::StateChanged { call_id, state } => {
                tracing::debug!(call_id = %call_id, state = %state, "state changed");
            }
            SchedulerEvent::AllToolCallsComplete(calls) => break calls,
            SchedulerEvent::Output { .. } => {}
        }
    };

    if single_command {
        Ok(report_single(&calls, stream_output))
    } else {
        report_batch(&calls)?;
        Ok(batch_exit_code(&calls))
    }
}

fn read_requests(path: &Path) -> Result<Vec<ToolCallRequest>> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("failed to read requests from stdin")?
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read requests from {}", path.display()))?
    };
    serde_json::from_str(&raw).context("requests must be a JSON array of tool calls")
}

fn report_single(calls: &[ToolCall], streamed: bool) -> ExitCode {
    let Some(call) = calls.first() else {
        return ExitCode::FAILURE;
    };
    let Some(result) = call.result.as_ref() else {
        return ExitCode::FAILURE;
    };

    match (&result.shell, &result.error) {
        (Some(shell), error) if shell.error.is_none() => {
            if !streamed {
                print!("{}", shell.output);
                if !shell.output.ends_with('\n') && !shell.output.is_empty() {
                    println!();
                }
            }
            if call.state == ToolCallState::Cancelled {
                eprintln!("keel: command aborted");
                return ExitCode::from(ABORTED_EXIT);
            }
            if let Some(error) = error {
                eprintln!("keel: {}", error.message);
            }
            match (shell.exit_code, shell.signal) {
                (Some(code), _) => ExitCode::from(code.clamp(0, 255) as u8),
                (None, Some(signal)) => ExitCode::from((128 + signal).clamp(0, 255) as u8),
                (None, None) => ExitCode::FAILURE,
            }
        }
        (_, Some(error)) => {
            eprintln!("keel: {}", error.message);
            if call.state == ToolCallState::Cancelled {
                ExitCode::from(ABORTED_EXIT)
            } else {
                ExitCode::FAILURE
            }
        }
        (_, None) => {
            println!("{}", result.content);
            ExitCode::SUCCESS
        }
    }
}

fn report_batch(calls: &[ToolCall]) -> Result<()> {
    let summary: Vec<serde_json::Value> = calls
        .iter()
        .map(|call| {
            let result = call.result.as_ref();
            serde_json::json!({
                "call_id": call.call_id(),
                "name": call.request.name,
                "state": call.state,
                "error_kind": call.error_kind(),
                "content": result.map(|r| r.content.as_str()),
                "exit_code": result.and_then(|r| r.shell.as_ref()).and_then(|s| s.exit_code),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn batch_exit_code(calls: &[ToolCall]) -> ExitCode {
    if calls.iter().any(|c| c.state == ToolCallState::Cancelled) {
        ExitCode::from(ABORTED_EXIT)
    } else if calls.iter().all(|c| c.state == ToolCallState::Success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
