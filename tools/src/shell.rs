//! Shell selection for command execution.
//!
//! Each supported shell family has one invocation template. The shell used by
//! a session is resolved and validated once, when the execution service is
//! built, instead of being assembled from strings on every spawn.

use std::path::{Path, PathBuf};

/// Errors from shell setup and PTY control.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("shell binary not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("no active pty for pid {0}")]
    NoActivePty(u32),
    #[error("pty error: {0}")]
    Pty(String),
    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shell families with distinct invocation syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Sh,
    Cmd,
    PowerShell,
}

impl ShellKind {
    /// Arguments placed before the command string.
    #[must_use]
    pub const fn command_args(self) -> &'static [&'static str] {
        match self {
            ShellKind::Bash | ShellKind::Zsh | ShellKind::Sh => &["-c"],
            ShellKind::Cmd => &["/d", "/s", "/c"],
            ShellKind::PowerShell => &["-NoProfile", "-Command"],
        }
    }

    /// Classify a shell binary by its file stem. Unknown shells are assumed
    /// to be POSIX-like.
    #[must_use]
    pub fn from_binary(binary: &Path) -> Self {
        let stem = binary
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match stem.as_str() {
            "bash" => ShellKind::Bash,
            "zsh" => ShellKind::Zsh,
            "cmd" => ShellKind::Cmd,
            "pwsh" | "powershell" => ShellKind::PowerShell,
            _ => ShellKind::Sh,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Sh => "sh",
            ShellKind::Cmd => "cmd",
            ShellKind::PowerShell => "powershell",
        }
    }
}

/// User override for the shell binary and its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOverride {
    pub binary: Option<String>,
    pub args: Option<Vec<String>>,
}

/// A resolved shell: binary plus the arguments that precede the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub kind: ShellKind,
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl std::fmt::Display for ShellInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.kind.name(), self.binary.display())
    }
}

impl ShellInvocation {
    #[must_use]
    pub fn new(kind: ShellKind, binary: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            binary: binary.into(),
            args: kind
                .command_args()
                .iter()
                .map(|arg| (*arg).to_string())
                .collect(),
        }
    }

    /// Resolve the session shell from an override or the platform default,
    /// and check that the binary exists.
    pub fn resolve(config: Option<&ShellOverride>) -> Result<Self, ShellError> {
        let shell = match config.and_then(|cfg| cfg.binary.as_deref()) {
            Some(binary) => {
                let binary = PathBuf::from(binary);
                let mut shell = Self::new(ShellKind::from_binary(&binary), binary);
                if let Some(args) = config.and_then(|cfg| cfg.args.clone()) {
                    shell.args = args;
                }
                shell
            }
            None => Self::platform_default(),
        };
        shell.validate()?;
        tracing::debug!(shell = %shell, "resolved shell");
        Ok(shell)
    }

    /// Full argument vector for running `command`.
    #[must_use]
    pub fn argv(&self, command: &str) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(command.to_string());
        argv
    }

    pub fn validate(&self) -> Result<(), ShellError> {
        let found = if self.binary.components().count() > 1 {
            self.binary.is_file()
        } else {
            which::which(&self.binary).is_ok()
        };
        if found {
            Ok(())
        } else {
            Err(ShellError::NotFound(self.binary.clone()))
        }
    }

    #[cfg(windows)]
    fn platform_default() -> Self {
        let comspec = std::env::var("ComSpec")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(r"C:\Windows\System32\cmd.exe"));
        Self::new(ShellKind::Cmd, comspec)
    }

    #[cfg(not(windows))]
    fn platform_default() -> Self {
        // $SHELL only when it names a shell with a known invocation template.
        if let Some(path) = std::env::var_os("SHELL").map(PathBuf::from)
            && path.is_file()
            && matches!(
                ShellKind::from_binary(&path),
                ShellKind::Bash | ShellKind::Zsh
            )
        {
            return Self::new(ShellKind::from_binary(&path), path);
        }
        if let Ok(path) = which::which("bash") {
            return Self::new(ShellKind::Bash, path);
        }
        Self::new(ShellKind::Sh, "/bin/sh")
    }
}
