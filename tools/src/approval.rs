//! Approval policy.
//!
//! Everything here is pure: the scheduler passes in the approval mode, the
//! session allowlist, and the static rules, and gets back a decision. Hard
//! denials come from explicit deny rules and are never bypassed; soft
//! denials only ask for confirmation and are waived in YOLO mode.

use std::collections::BTreeSet;

use keel_types::{ApprovalMode, ToolKind};

use crate::DenialReason;
use crate::command_blacklist::{BlacklistError, CommandBlacklist};

/// Commands and tools the user approved with "always" during this session.
///
/// Append-only; inserting an existing entry is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionAllowlist {
    entries: BTreeSet<String>,
}

impl SessionAllowlist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the entry was already present.
    pub fn insert(&mut self, entry: impl Into<String>) -> bool {
        let entry = normalize(&entry.into());
        if entry.is_empty() {
            return false;
        }
        self.entries.insert(entry)
    }

    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for entry in entries {
            self.insert(entry);
        }
    }

    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(&normalize(entry))
    }

    /// Whether a single subcommand is covered by an entry, either by
    /// command prefix or by its root command.
    #[must_use]
    pub fn allows_command(&self, subcommand: &str) -> bool {
        let root = command_root(subcommand);
        self.entries
            .iter()
            .any(|entry| matches_prefix(subcommand, entry) || root.as_deref() == Some(entry))
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Static permission rules from configuration.
#[derive(Debug, Clone)]
pub struct PermissionRules {
    /// Command prefixes that run without confirmation. `*` allows everything.
    pub allowed_commands: Vec<String>,
    /// Command prefixes that are always refused.
    pub blocked_commands: Vec<String>,
    pub allowed_tools: BTreeSet<String>,
    pub denied_tools: BTreeSet<String>,
    pub blacklist: CommandBlacklist,
}

impl PermissionRules {
    pub fn with_defaults() -> Result<Self, BlacklistError> {
        Ok(Self::new(CommandBlacklist::with_defaults()?))
    }

    #[must_use]
    pub fn new(blacklist: CommandBlacklist) -> Self {
        Self {
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
            allowed_tools: BTreeSet::new(),
            denied_tools: BTreeSet::new(),
            blacklist,
        }
    }

    fn allows_command(&self, subcommand: &str) -> bool {
        self.allowed_commands
            .iter()
            .any(|prefix| prefix.trim() == "*" || matches_prefix(subcommand, prefix))
    }

    fn blocking_rule(&self, subcommand: &str) -> Option<&str> {
        self.blocked_commands
            .iter()
            .find(|prefix| matches_prefix(subcommand, prefix))
            .map(String::as_str)
    }
}

/// Outcome of checking a shell command against the rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    pub all_allowed: bool,
    /// Subcommands that need confirmation, in command order.
    pub disallowed_commands: Vec<String>,
    /// Set for hard denials.
    pub block_reason: Option<DenialReason>,
    pub is_hard_denial: bool,
}

impl PermissionCheck {
    fn hard(reason: DenialReason) -> Self {
        Self {
            all_allowed: false,
            disallowed_commands: Vec::new(),
            block_reason: Some(reason),
            is_hard_denial: true,
        }
    }
}

/// Check a full shell command line.
///
/// Command substitution, blacklist matches, and blocked prefixes are hard
/// denials. The session allowlist is consulted before the static allowlist;
/// whatever neither covers is returned as disallowed.
#[must_use]
pub fn check_command_permissions(
    command: &str,
    rules: &PermissionRules,
    session: Option<&SessionAllowlist>,
) -> PermissionCheck {
    if has_command_substitution(command) {
        return PermissionCheck::hard(DenialReason::CommandSubstitution {
            command: command.to_string(),
        });
    }
    if let Some(reason) = rules.blacklist.check(command) {
        return PermissionCheck::hard(reason);
    }

    let subcommands = split_commands(command);
    for sub in &subcommands {
        if let Some(rule) = rules.blocking_rule(sub) {
            return PermissionCheck::hard(DenialReason::BlockedCommand {
                command: sub.clone(),
                rule: rule.to_string(),
            });
        }
    }

    let disallowed_commands: Vec<String> = subcommands
        .into_iter()
        .filter(|sub| {
            let session_ok = session.is_some_and(|allowlist| allowlist.allows_command(sub));
            !(session_ok || rules.allows_command(sub))
        })
        .collect();

    PermissionCheck {
        all_allowed: disallowed_commands.is_empty(),
        disallowed_commands,
        block_reason: None,
        is_hard_denial: false,
    }
}

/// What is being approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSubject<'a> {
    /// A tool that runs a shell command line.
    Command { tool: &'a str, command: &'a str },
    Tool { name: &'a str, kind: ToolKind },
}

/// Mode-independent evaluation of a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub all_allowed: bool,
    pub disallowed: Vec<String>,
    pub hard_denial: Option<DenialReason>,
    pub reason: Option<String>,
    /// What "proceed always" adds to the session allowlist.
    pub allowlist_entries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    AutoApprove,
    RequireConfirmation {
        reason: String,
        allowlist_entries: Vec<String>,
    },
    HardDeny(DenialReason),
}

impl PolicyVerdict {
    /// Apply the approval mode. Hard denials always win.
    #[must_use]
    pub fn decide(self, mode: ApprovalMode, kind: ToolKind) -> ApprovalDecision {
        if let Some(denial) = self.hard_denial {
            return ApprovalDecision::HardDeny(denial);
        }
        if self.all_allowed {
            return ApprovalDecision::AutoApprove;
        }
        match (mode, kind) {
            (ApprovalMode::Yolo, _) | (ApprovalMode::AutoEdit, ToolKind::Edit) => {
                ApprovalDecision::AutoApprove
            }
            _ => ApprovalDecision::RequireConfirmation {
                reason: self
                    .reason
                    .unwrap_or_else(|| "confirmation required".to_string()),
                allowlist_entries: self.allowlist_entries,
            },
        }
    }
}

/// Approval mode plus static rules for one session.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    mode: ApprovalMode,
    rules: PermissionRules,
}

impl ApprovalPolicy {
    #[must_use]
    pub fn new(mode: ApprovalMode, rules: PermissionRules) -> Self {
        Self { mode, rules }
    }

    #[must_use]
    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    #[must_use]
    pub fn rules(&self) -> &PermissionRules {
        &self.rules
    }

    #[must_use]
    pub fn evaluate(&self, subject: ApprovalSubject<'_>, session: &SessionAllowlist) -> PolicyVerdict {
        match subject {
            ApprovalSubject::Command { tool, command } => {
                if self.rules.denied_tools.contains(tool) {
                    return denied(DenialReason::Denylisted {
                        tool: tool.to_string(),
                    });
                }
                let check = check_command_permissions(command, &self.rules, Some(session));
                if let Some(reason) = check.block_reason {
                    return denied(reason);
                }
                let mut allowlist_entries: Vec<String> = Vec::new();
                for sub in &check.disallowed_commands {
                    if let Some(root) = command_root(sub)
                        && !allowlist_entries.contains(&root)
                    {
                        allowlist_entries.push(root);
                    }
                }
                let reason = (!check.all_allowed).then(|| {
                    format!(
                        "Command(s) require approval: {}",
                        check.disallowed_commands.join(", ")
                    )
                });
                PolicyVerdict {
                    all_allowed: check.all_allowed,
                    disallowed: check.disallowed_commands,
                    hard_denial: None,
                    reason,
                    allowlist_entries,
                }
            }
            ApprovalSubject::Tool { name, kind } => {
                if self.rules.denied_tools.contains(name) {
                    return denied(DenialReason::Denylisted {
                        tool: name.to_string(),
                    });
                }
                let allowed = kind == ToolKind::Read
                    || self.rules.allowed_tools.contains(name)
                    || session.contains(name);
                PolicyVerdict {
                    all_allowed: allowed,
                    disallowed: if allowed { Vec::new() } else { vec![name.to_string()] },
                    hard_denial: None,
                    reason: (!allowed).then(|| format!("Tool '{name}' requires approval")),
                    allowlist_entries: vec![name.to_string()],
                }
            }
        }
    }

    #[must_use]
    pub fn decide(
        &self,
        subject: ApprovalSubject<'_>,
        kind: ToolKind,
        session: &SessionAllowlist,
    ) -> ApprovalDecision {
        self.evaluate(subject, session).decide(self.mode, kind)
    }
}

fn denied(reason: DenialReason) -> PolicyVerdict {
    PolicyVerdict {
        all_allowed: false,
        disallowed: Vec::new(),
        reason: Some(reason.to_string()),
        hard_denial: Some(reason),
        allowlist_entries: Vec::new(),
    }
}

// ============================================================================
// Command line parsing
// ============================================================================

/// Split a command line into subcommands on `&&`, `||`, `;`, `|`, `&`, and
/// newlines, ignoring separators inside quotes and redirections like `2>&1`.
#[must_use]
pub fn split_commands(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '&' if !in_single
                && !in_double
                && (current.ends_with('>') || current.ends_with('<') || chars.peek() == Some(&'>')) =>
            {
                current.push(c);
            }
            '&' | '|' | ';' | '\n' if !in_single && !in_double => {
                if (c == '&' || c == '|') && chars.peek() == Some(&c) {
                    chars.next();
                }
                push_part(&mut parts, &mut current);
            }
            _ => current.push(c),
        }
    }
    push_part(&mut parts, &mut current);
    parts
}

fn push_part(parts: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
    current.clear();
}

/// First word of a subcommand with quotes and any directory stripped.
#[must_use]
pub fn command_root(subcommand: &str) -> Option<String> {
    let first = subcommand.split_whitespace().next()?;
    let unquoted = first.trim_matches(|c| c == '"' || c == '\'');
    let root = unquoted.rsplit(['/', '\\']).next().unwrap_or(unquoted);
    (!root.is_empty()).then(|| root.to_string())
}

/// `$()`, backticks, `<()`, and `>()` outside single quotes.
#[must_use]
pub fn has_command_substitution(command: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                chars.next();
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '`' if !in_single => return true,
            '$' if !in_single && chars.peek() == Some(&'(') => return true,
            '<' | '>' if !in_single && !in_double && chars.peek() == Some(&'(') => return true,
            _ => {}
        }
    }
    false
}

fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn matches_prefix(subcommand: &str, prefix: &str) -> bool {
    let subcommand = normalize(subcommand);
    let prefix = normalize(prefix);
    if prefix.is_empty() {
        return false;
    }
    subcommand == prefix
        || subcommand
            .strip_prefix(&prefix)
            .is_some_and(|rest| rest.starts_with(' '))
}
