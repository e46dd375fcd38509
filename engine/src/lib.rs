//! Session context and tool call scheduling for Keel.
//!
//! A [`SessionContext`] is built once per session and handed to
//! [`ToolCallScheduler::spawn`]. Nothing here is global.

mod context;
mod scheduler;

pub use context::{ContextError, SessionContext, SessionOverrides};
pub use scheduler::{ConfirmationRequest, SchedulerError, SchedulerEvent, ToolCallScheduler};

pub use keel_tools::{ShellExecutionService, ToolRegistry};
