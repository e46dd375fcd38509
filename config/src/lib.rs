//! Configuration loading, parsing, and persistence for Keel.
//!
//! The file lives at `~/.keel/config.toml`. Every section is optional.
//!
//! ```toml
//! [approval]
//! mode = "auto_edit"
//! allowed_commands = ["ls", "git status"]
//! blocked_commands = ["curl"]
//! denied_tools = []
//!
//! [shell]
//! binary = "/bin/zsh"
//! enable_pty = true
//! cols = 120
//! rows = 40
//!
//! [session]
//! working_dir = "${HOME}/src/project"
//! ```

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::{env, fs};

use keel_types::{ApprovalMode, TerminalGeometry};
use serde::Deserialize;

/// Overrides `[approval].mode` when set.
pub const APPROVAL_MODE_ENV: &str = "KEEL_APPROVAL_MODE";

#[derive(Debug, Default, Deserialize)]
pub struct KeelConfig {
    pub approval: Option<ApprovalConfig>,
    pub shell: Option<ShellConfig>,
    pub session: Option<SessionConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write config at {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("could not determine config path")]
    NoPath,
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Persist { path, .. } => Some(path),
            ConfigError::Invalid { .. } | ConfigError::NoPath => None,
        }
    }
}

/// Approval policy configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ApprovalConfig {
    /// `default`, `auto_edit`, or `yolo`.
    pub mode: Option<String>,
    /// Command prefixes that run without confirmation. `"*"` allows all.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Command prefixes that are always refused.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Extra regexes added to the built-in command blacklist.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

/// Shell configuration.
///
/// ```toml
/// [shell]
/// binary = "pwsh"
/// args = ["-NoProfile", "-Command"]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ShellConfig {
    /// Override shell binary (e.g., "pwsh", "/usr/local/bin/zsh").
    pub binary: Option<String>,
    /// Override shell args (e.g., `["-c"]` or `["/d", "/s", "/c"]`).
    pub args: Option<Vec<String>>,
    /// Run commands in a pseudo-terminal when possible.
    #[serde(default)]
    pub enable_pty: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    /// Supports `~` and `${VAR}` expansion.
    pub working_dir: Option<String>,
}

/// Replace `${VAR}` with the variable's value; unset variables become empty.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if var.is_empty() {
                    out.push_str("${}");
                } else {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_path(value: &str) -> PathBuf {
    let expanded = expand_env_vars(value);
    if let Some(stripped) = expanded.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    if expanded == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(expanded)
}

impl KeelConfig {
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Effective approval mode: `KEEL_APPROVAL_MODE`, then `[approval].mode`,
    /// then `default`.
    pub fn approval_mode(&self) -> Result<ApprovalMode, ConfigError> {
        let from_env = env::var(APPROVAL_MODE_ENV).ok();
        self.approval_mode_with(from_env.as_deref())
    }

    fn approval_mode_with(&self, env_value: Option<&str>) -> Result<ApprovalMode, ConfigError> {
        let (key, raw) = match env_value.filter(|v| !v.trim().is_empty()) {
            Some(value) => (APPROVAL_MODE_ENV, value),
            None => match self.approval.as_ref().and_then(|a| a.mode.as_deref()) {
                Some(value) => ("approval.mode", value),
                None => return Ok(ApprovalMode::default()),
            },
        };
        raw.parse().map_err(|err: keel_types::ParseApprovalModeError| ConfigError::Invalid {
            key,
            message: err.to_string(),
        })
    }

    #[must_use]
    pub fn pty_enabled(&self) -> bool {
        self.shell.as_ref().is_some_and(|shell| shell.enable_pty)
    }

    /// Configured terminal size, falling back to 80x30 per dimension.
    #[must_use]
    pub fn geometry(&self) -> TerminalGeometry {
        let default = TerminalGeometry::default();
        let shell = self.shell.as_ref();
        TerminalGeometry::new(
            shell.and_then(|s| s.cols).unwrap_or(default.cols),
            shell.and_then(|s| s.rows).unwrap_or(default.rows),
        )
        .clamped()
    }

    #[must_use]
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.session
            .as_ref()
            .and_then(|s| s.working_dir.as_deref())
            .filter(|dir| !dir.trim().is_empty())
            .map(expand_path)
    }

    /// Shell binary with `${VAR}` expanded.
    #[must_use]
    pub fn shell_binary(&self) -> Option<String> {
        self.shell
            .as_ref()
            .and_then(|s| s.binary.as_deref())
            .map(expand_env_vars)
    }

    /// Persist the approval mode to the config file.
    ///
    /// Uses `toml_edit` to preserve comments and formatting.
    pub fn persist_approval_mode(mode: ApprovalMode) -> Result<(), ConfigError> {
        let path = config_path().ok_or(ConfigError::NoPath)?;
        persist_approval_mode_at(&path, mode)
    }
}

/// Rewrite only `[approval].mode` in the file at `path`, creating the file
/// and its parent directory if needed.
pub fn persist_approval_mode_at(path: &Path, mode: ApprovalMode) -> Result<(), ConfigError> {
    let persist_err = |source: std::io::Error| ConfigError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(persist_err)?;
    }

    let content = if path.exists() {
        fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        String::new()
    };

    let mut doc = content
        .parse::<toml_edit::DocumentMut>()
        .map_err(|e| persist_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    if !doc.contains_key("approval") {
        doc["approval"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    doc["approval"]["mode"] = toml_edit::value(mode.as_str());

    // Write to a sibling temp file and rename over the original.
    let dir = parent.unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    tmp.write_all(doc.to_string().as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(persist_err)?;
    tmp.persist(path).map_err(|e| persist_err(e.error))?;

    #[cfg(unix)]
    restrict_permissions(path).map_err(persist_err)?;

    tracing::info!(path = %path.display(), mode = %mode, "persisted approval mode");
    Ok(())
}

/// Owner-only read/write, when we own the file.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    let metadata = fs::metadata(path)?;
    // SAFETY: getuid has no preconditions and cannot fail.
    let our_uid = unsafe { libc::getuid() };
    if metadata.uid() == our_uid && metadata.permissions().mode() & 0o077 != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".keel").join("config.toml"))
}
