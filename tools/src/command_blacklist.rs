//! Regex rules for commands that are never allowed to run.
//!
//! A match is a hard denial: no approval mode or allowlist entry overrides
//! it. Prefix-based blocking of whole commands lives in [`crate::approval`].

use regex::RegexSet;

use crate::DenialReason;

/// Built-in patterns: `(regex, reason)`.
///
/// Patterns are case-sensitive unless they carry `(?i)`.
pub const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    // rm -r on / or one of its dot aliases
    (
        r"(?i)\brm\s+(?:-[^\s]*\s+|--[\w-]+\s+)*(?:-[^\s-]*[rR][^\s]*|--recursive)(?:\s+(?:-[^\s]*|--[\w-]+))*\s+(?:--\s+)?/(?:\*|\.{1,2}/?\*?)?/?(?:\s|$|[&|;])",
        "deletes the root filesystem",
    ),
    // rm -r on the home directory
    (
        r"(?i)\brm\s+(?:-[^\s]*\s+|--[\w-]+\s+)*(?:-[^\s-]*[rR][^\s]*|--recursive)(?:\s+(?:-[^\s]*|--[\w-]+))*\s+(?:--\s+)?(?:~|\$HOME|\$\{HOME\})/?(?:\s|$|[&|;])",
        "deletes the home directory",
    ),
    (r":\(\)\s*\{\s*:\|:&\s*\}\s*;:", "fork bomb"),
    (
        r"(?i)\bdd\s+.*of=/dev/(?:sd|hd|nvme|vd|xvd|disk)\w*",
        "overwrites a disk device",
    ),
    (
        r"(?i)\bmkfs(?:\.\w+)?\s+/dev/\w+",
        "formats a disk device",
    ),
    (
        r"(?i)\bchmod\s+-R\s+\d+\s+/(?:\s|$|[&|;])",
        "recursively changes permissions on the root filesystem",
    ),
    // Remove-Item / ri with -Recurse -Force in either order, path first or last
    (
        r"(?i)\b(?:Remove-Item|ri)\s+(?:[A-Z]:\\|~)\s+-(?:Recurse|Force)\s+-(?:Recurse|Force)",
        "deletes a system drive or home directory",
    ),
    (
        r"(?i)\b(?:Remove-Item|ri)\s+-(?:Recurse|Force)\s+-(?:Recurse|Force)\s+(?:[A-Z]:\\|~)(?:\s|$)",
        "deletes a system drive or home directory",
    ),
    (
        r"(?i)\brd\s+/[sq]\s+/[sq]\s+[A-Z]:\\(?:\s|$)",
        "recursively deletes a drive",
    ),
];

#[derive(Debug, thiserror::Error)]
#[error("invalid command blacklist pattern: {0}")]
pub struct BlacklistError(#[from] regex::Error);

/// Compiled blacklist, matched in one pass with a `RegexSet`.
#[derive(Debug, Clone)]
pub struct CommandBlacklist {
    regex_set: RegexSet,
    /// Parallel to the patterns in `regex_set`.
    reasons: Vec<String>,
}

impl CommandBlacklist {
    pub fn new<P, R>(patterns: &[(P, R)]) -> Result<Self, BlacklistError>
    where
        P: AsRef<str>,
        R: AsRef<str>,
    {
        let regex_set = RegexSet::new(patterns.iter().map(|(pattern, _)| pattern.as_ref()))?;
        let reasons = patterns
            .iter()
            .map(|(_, reason)| reason.as_ref().to_string())
            .collect();
        Ok(Self { regex_set, reasons })
    }

    pub fn with_defaults() -> Result<Self, BlacklistError> {
        Self::new(DEFAULT_PATTERNS)
    }

    /// Built-in patterns plus user patterns, each reported as a custom rule.
    pub fn with_extra_patterns(extra: &[String]) -> Result<Self, BlacklistError> {
        let mut patterns: Vec<(String, String)> = DEFAULT_PATTERNS
            .iter()
            .map(|(pattern, reason)| ((*pattern).to_string(), (*reason).to_string()))
            .collect();
        patterns.extend(
            extra
                .iter()
                .map(|pattern| (pattern.clone(), format!("matches blocked pattern '{pattern}'"))),
        );
        Self::new(&patterns)
    }

    /// The denial for `command`, if any pattern matches.
    #[must_use]
    pub fn check(&self, command: &str) -> Option<DenialReason> {
        let idx = self.regex_set.matches(command).iter().next()?;
        Some(DenialReason::CommandBlacklisted {
            command: truncate_command(command, 100),
            reason: self.reasons[idx].clone(),
        })
    }
}

/// Shorten a command for error messages.
fn truncate_command(cmd: &str, max_len: usize) -> String {
    if cmd.len() <= max_len {
        return cmd.to_string();
    }
    let mut end = max_len;
    while end > 0 && !cmd.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &cmd[..end])
}
