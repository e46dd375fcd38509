//! Approval flow with the built-in tools and real commands.

use keel_config::{ApprovalConfig, KeelConfig};
use keel_engine::SchedulerEvent;
use keel_types::{ApprovalMode, ConfirmationOutcome, ToolCallRequest, ToolCallState, ToolErrorKind};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::{collect_batch, next_confirmation, session, session_with, shell_call};

fn asked_for_confirmation(events: &[SchedulerEvent]) -> bool {
    events
        .iter()
        .any(|event| matches!(event, SchedulerEvent::ConfirmationRequested(_)))
}

#[tokio::test]
async fn proceed_always_covers_later_commands_with_the_same_root() {
    let mut s = session(ApprovalMode::Default);
    s.scheduler
        .schedule_one(shell_call("c1", "echo one && echo two"), CancellationToken::new())
        .unwrap();

    let request = next_confirmation(&mut s.events).await;
    assert_eq!(request.tool_name, "run_shell_command");
    assert_eq!(request.summary, "Run command: echo one && echo two");
    assert_eq!(request.allowlist_entries, vec!["echo"]);
    s.scheduler
        .confirm(&request.call_id, ConfirmationOutcome::ProceedAlways)
        .unwrap();

    let (_, calls) = collect_batch(&mut s.events).await;
    assert_eq!(calls[0].state, ToolCallState::Success);
    let output = &calls[0].result.as_ref().unwrap().shell.as_ref().unwrap().output;
    assert!(output.contains("one") && output.contains("two"));

    s.scheduler
        .schedule_one(shell_call("c2", "echo three"), CancellationToken::new())
        .unwrap();
    let (events, calls) = collect_batch(&mut s.events).await;
    assert_eq!(calls[0].state, ToolCallState::Success);
    assert!(!asked_for_confirmation(&events));
    assert_eq!(
        s.scheduler.session_allowlist().await.unwrap(),
        vec!["echo".to_string()]
    );
}

#[tokio::test]
async fn proceed_once_asks_again_next_time() {
    let mut s = session(ApprovalMode::Default);
    for id in ["first", "second"] {
        s.scheduler
            .schedule_one(shell_call(id, "echo again"), CancellationToken::new())
            .unwrap();
        let request = next_confirmation(&mut s.events).await;
        assert_eq!(request.call_id, id);
        s.scheduler
            .confirm(id, ConfirmationOutcome::ProceedOnce)
            .unwrap();
        let (_, calls) = collect_batch(&mut s.events).await;
        assert_eq!(calls[0].state, ToolCallState::Success);
    }
}

#[tokio::test]
async fn hard_denials_hold_in_yolo_mode() {
    let mut s = session(ApprovalMode::Yolo);
    s.scheduler
        .schedule(
            vec![
                shell_call("subst", "echo $(whoami)"),
                shell_call("rm", "rm -rf /"),
                shell_call("ok", "echo allowed"),
            ],
            CancellationToken::new(),
        )
        .unwrap();

    let (events, calls) = collect_batch(&mut s.events).await;
    assert_eq!(calls[0].error_kind(), Some(ToolErrorKind::PermissionDenied));
    assert_eq!(calls[1].error_kind(), Some(ToolErrorKind::PermissionDenied));
    assert_eq!(calls[2].state, ToolCallState::Success);
    assert!(!asked_for_confirmation(&events));
}

#[tokio::test]
async fn configured_rules_shape_decisions() {
    let config = KeelConfig {
        approval: Some(ApprovalConfig {
            allowed_commands: vec!["echo".into()],
            blocked_commands: vec!["touch".into()],
            denied_tools: vec!["write_file".into()],
            ..ApprovalConfig::default()
        }),
        ..KeelConfig::default()
    };
    let mut s = session_with(ApprovalMode::Default, false, &config);
    s.scheduler
        .schedule(
            vec![
                shell_call("allowed", "echo configured"),
                shell_call("blocked", "touch marker"),
                ToolCallRequest::new(
                    "denied",
                    "write_file",
                    json!({ "path": "a.txt", "content": "x" }),
                ),
            ],
            CancellationToken::new(),
        )
        .unwrap();

    let (events, calls) = collect_batch(&mut s.events).await;
    assert!(!asked_for_confirmation(&events));
    assert_eq!(calls[0].state, ToolCallState::Success);
    assert_eq!(calls[1].error_kind(), Some(ToolErrorKind::PermissionDenied));
    assert_eq!(calls[2].error_kind(), Some(ToolErrorKind::PermissionDenied));
    assert!(!s.workspace.path().join("marker").exists());
    assert!(!s.workspace.path().join("a.txt").exists());
}

#[tokio::test]
async fn cancelling_a_confirmation_leaves_the_workspace_untouched() {
    let mut s = session(ApprovalMode::Default);
    s.scheduler
        .schedule_one(
            ToolCallRequest::new(
                "w",
                "write_file",
                json!({ "path": "draft.md", "content": "# draft" }),
            ),
            CancellationToken::new(),
        )
        .unwrap();

    let request = next_confirmation(&mut s.events).await;
    assert_eq!(request.summary, "Write file: draft.md (7 bytes)");
    s.scheduler
        .confirm(request.call_id, ConfirmationOutcome::Cancel)
        .unwrap();

    let (_, calls) = collect_batch(&mut s.events).await;
    assert_eq!(calls[0].state, ToolCallState::Cancelled);
    assert!(!s.workspace.path().join("draft.md").exists());
}
