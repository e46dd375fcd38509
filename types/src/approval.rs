//! Approval modes and confirmation outcomes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// How much confirmation the user wants before tools run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Confirm anything with side effects that is not allowlisted.
    #[default]
    Default,
    /// Auto-approve edit-class tools.
    AutoEdit,
    /// Auto-approve everything that is not hard-denied.
    Yolo,
}

impl ApprovalMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AutoEdit => "auto_edit",
            Self::Yolo => "yolo",
        }
    }
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown approval mode '{0}' (expected default, auto_edit, or yolo)")]
pub struct ParseApprovalModeError(pub String);

impl FromStr for ApprovalMode {
    type Err = ParseApprovalModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "auto_edit" | "auto-edit" | "autoedit" => Ok(Self::AutoEdit),
            "yolo" => Ok(Self::Yolo),
            _ => Err(ParseApprovalModeError(s.to_string())),
        }
    }
}

/// The user's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    ProceedOnce,
    /// Proceed and add the call's allowlist entries to the session allowlist.
    ProceedAlways,
    Cancel,
}

/// Broad category of a tool, used by approval modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Execute,
    Other,
}
