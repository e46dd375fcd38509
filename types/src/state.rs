//! Tool call lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle of a tool call.
///
/// Transitions are monotonic: `Validating -> (AwaitingApproval | Scheduled) ->
/// Executing -> (Success | Error)`. `Error` is also reachable before execution
/// (validation and permission failures) and `Cancelled` from any non-terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Validating => matches!(
                next,
                Self::AwaitingApproval | Self::Scheduled | Self::Error | Self::Cancelled
            ),
            Self::AwaitingApproval => {
                matches!(next, Self::Scheduled | Self::Error | Self::Cancelled)
            }
            Self::Scheduled => matches!(next, Self::Executing | Self::Error | Self::Cancelled),
            Self::Executing => matches!(next, Self::Success | Self::Error | Self::Cancelled),
            Self::Success | Self::Error | Self::Cancelled => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
