//! Shell execution events and results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Incremental output from a running shell command.
///
/// At most one `BinaryDetected` is emitted per execution. After it, only
/// `BinaryProgress` follows, with non-decreasing `bytes_received`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellOutputEvent {
    /// Plain backend: the newly decoded text. PTY backend: the full rendered
    /// terminal buffer after this chunk.
    Data { chunk: String },
    BinaryDetected,
    BinaryProgress { bytes_received: u64 },
}

/// Which backend ran the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMethod {
    Pty,
    Plain,
    /// Nothing was spawned.
    None,
}

/// The shell or binary could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to spawn shell: {message}")]
pub struct SpawnFailure {
    pub message: String,
}

impl SpawnFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The settled outcome of one `execute` call. Produced exactly once, even on
/// abort or spawn failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellExecutionResult {
    pub raw_output: Vec<u8>,
    pub output: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Set only on spawn failure, in which case `exit_code == Some(1)` and
    /// `pid` is `None`.
    pub error: Option<SpawnFailure>,
    pub aborted: bool,
    pub pid: Option<u32>,
    pub execution_method: ExecutionMethod,
}

impl ShellExecutionResult {
    #[must_use]
    pub fn spawn_failed(error: SpawnFailure) -> Self {
        Self {
            raw_output: Vec::new(),
            output: String::new(),
            exit_code: Some(1),
            signal: None,
            error: Some(error),
            aborted: false,
            pid: None,
            execution_method: ExecutionMethod::None,
        }
    }

    /// Exited on its own with status zero and was not aborted.
    #[must_use]
    pub fn is_clean_exit(&self) -> bool {
        !self.aborted && self.error.is_none() && self.exit_code == Some(0) && self.signal.is_none()
    }
}

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalGeometry {
    pub const DEFAULT_COLS: u16 = 80;
    pub const DEFAULT_ROWS: u16 = 30;

    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Clamp zero dimensions to one cell; PTYs reject empty geometry.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            cols: self.cols.max(1),
            rows: self.rows.max(1),
        }
    }
}

impl Default for TerminalGeometry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COLS, Self::DEFAULT_ROWS)
    }
}
