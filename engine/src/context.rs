//! Explicitly constructed session state.

use std::path::{Path, PathBuf};

use keel_config::{ConfigError, KeelConfig};
use keel_tools::builtins::register_builtins;
use keel_tools::command_blacklist::BlacklistError;
use keel_tools::{
    ApprovalPolicy, CommandBlacklist, PermissionRules, ShellError, ShellExecutionService,
    ShellInvocation, ShellOverride, ToolError, ToolRegistry,
};
use keel_types::{ApprovalMode, TerminalGeometry};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Blacklist(#[from] BlacklistError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("invalid working directory {}: {source}", path.display())]
    WorkingDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Values that take precedence over the config file, typically from the
/// command line.
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub approval_mode: Option<ApprovalMode>,
    pub pty: Option<bool>,
    pub geometry: Option<TerminalGeometry>,
    pub working_dir: Option<PathBuf>,
}

/// Everything a scheduler needs for one session.
#[derive(Debug)]
pub struct SessionContext {
    working_dir: PathBuf,
    registry: ToolRegistry,
    policy: ApprovalPolicy,
    shell: ShellExecutionService,
    geometry: TerminalGeometry,
}

impl SessionContext {
    #[must_use]
    pub fn new(
        working_dir: PathBuf,
        registry: ToolRegistry,
        policy: ApprovalPolicy,
        shell: ShellExecutionService,
        geometry: TerminalGeometry,
    ) -> Self {
        Self {
            working_dir,
            registry,
            policy,
            shell,
            geometry,
        }
    }

    /// Build a session from the config file plus overrides, with the
    /// built-in tools registered.
    pub fn from_config(
        config: &KeelConfig,
        overrides: SessionOverrides,
    ) -> Result<Self, ContextError> {
        let mode = match overrides.approval_mode {
            Some(mode) => mode,
            None => config.approval_mode()?,
        };
        let rules = permission_rules(config)?;

        let shell_override = ShellOverride {
            binary: config.shell_binary(),
            args: config.shell.as_ref().and_then(|s| s.args.clone()),
        };
        let shell = ShellInvocation::resolve(Some(&shell_override))?;
        let pty = overrides.pty.unwrap_or_else(|| config.pty_enabled());
        let service = ShellExecutionService::new(shell, pty);
        let geometry = overrides
            .geometry
            .unwrap_or_else(|| config.geometry())
            .clamped();

        let requested = match overrides.working_dir.or_else(|| config.working_dir()) {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|source| ContextError::WorkingDir {
                path: PathBuf::from("."),
                source,
            })?,
        };
        let working_dir = canonical_dir(&requested)?;

        let mut registry = ToolRegistry::default();
        register_builtins(&mut registry, service.clone(), geometry)?;

        tracing::info!(
            mode = %mode,
            pty,
            shell = %service.shell(),
            working_dir = %working_dir.display(),
            "session configured"
        );
        Ok(Self::new(
            working_dir,
            registry,
            ApprovalPolicy::new(mode, rules),
            service,
            geometry,
        ))
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[must_use]
    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// The shell service, for PTY input and resizing.
    #[must_use]
    pub fn shell(&self) -> &ShellExecutionService {
        &self.shell
    }

    #[must_use]
    pub fn geometry(&self) -> TerminalGeometry {
        self.geometry
    }
}

fn permission_rules(config: &KeelConfig) -> Result<PermissionRules, ContextError> {
    let Some(approval) = config.approval.as_ref() else {
        return Ok(PermissionRules::with_defaults()?);
    };
    let mut rules = PermissionRules::new(CommandBlacklist::with_extra_patterns(
        &approval.blocked_patterns,
    )?);
    rules.allowed_commands.clone_from(&approval.allowed_commands);
    rules.blocked_commands.clone_from(&approval.blocked_commands);
    rules.allowed_tools = approval.allowed_tools.iter().cloned().collect();
    rules.denied_tools = approval.denied_tools.iter().cloned().collect();
    Ok(rules)
}

fn canonical_dir(path: &Path) -> Result<PathBuf, ContextError> {
    let canonical = std::fs::canonicalize(path).map_err(|source| ContextError::WorkingDir {
        path: path.to_path_buf(),
        source,
    })?;
    if canonical.is_dir() {
        Ok(canonical)
    } else {
        Err(ContextError::WorkingDir {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
        })
    }
}
