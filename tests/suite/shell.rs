//! Shell commands run end to end through the scheduler.

use std::time::Duration;

use keel_engine::SchedulerEvent;
use keel_types::{
    ApprovalMode, ExecutionMethod, ShellOutputEvent, ToolCallRequest, ToolCallState, ToolErrorKind,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::{collect_batch, next_event, session, shell_call};

#[tokio::test]
async fn echo_streams_and_succeeds() {
    let mut s = session(ApprovalMode::Yolo);
    s.scheduler
        .schedule_one(shell_call("c1", "echo \"hello world\""), CancellationToken::new())
        .unwrap();

    let (events, calls) = collect_batch(&mut s.events).await;
    let call = &calls[0];
    assert_eq!(call.state, ToolCallState::Success);

    let result = call.result.as_ref().unwrap();
    let shell = result.shell.as_ref().unwrap();
    assert_eq!(shell.output.trim_end(), "hello world");
    assert_eq!(shell.exit_code, Some(0));
    assert_eq!(shell.signal, None);
    assert!(!shell.aborted);
    assert_eq!(shell.execution_method, ExecutionMethod::Plain);
    assert!(result.content.contains("Command: echo \"hello world\""));
    assert!(result.content.contains("Directory: (root)"));
    assert!(result.content.contains("Output: hello world"));
    assert!(result.content.contains("Exit Code: 0"));

    let streamed: String = events
        .iter()
        .filter_map(|event| match event {
            SchedulerEvent::Output {
                event: ShellOutputEvent::Data { chunk },
                ..
            } => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert!(streamed.contains("hello world"));
    assert!(!call.live_output.is_empty());
}

#[tokio::test]
async fn nonzero_exit_is_still_a_completed_command() {
    let mut s = session(ApprovalMode::Yolo);
    s.scheduler
        .schedule_one(shell_call("c1", "echo oops >&2; exit 3"), CancellationToken::new())
        .unwrap();

    let (_, calls) = collect_batch(&mut s.events).await;
    let result = calls[0].result.as_ref().unwrap();
    assert_eq!(calls[0].state, ToolCallState::Success);
    let shell = result.shell.as_ref().unwrap();
    assert_eq!(shell.exit_code, Some(3));
    assert!(shell.output.contains("oops"));
    assert!(result.content.contains("Exit Code: 3"));
}

#[tokio::test]
async fn abort_during_execution_settles_as_cancelled() {
    let mut s = session(ApprovalMode::Yolo);
    let cancel = CancellationToken::new();
    s.scheduler
        .schedule_one(shell_call("long", "echo started; sleep 10"), cancel.clone())
        .unwrap();

    loop {
        if let SchedulerEvent::StateChanged {
            state: ToolCallState::Executing,
            ..
        } = next_event(&mut s.events).await
        {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let (_, calls) = collect_batch(&mut s.events).await;
    let call = &calls[0];
    assert_eq!(call.state, ToolCallState::Cancelled);
    assert_eq!(call.error_kind(), Some(ToolErrorKind::Aborted));
    let result = call.result.as_ref().unwrap();
    assert!(result.shell.as_ref().unwrap().aborted);
    assert!(
        result
            .content
            .starts_with("Command was cancelled before it could complete.")
    );
}

#[tokio::test]
async fn directory_argument_is_confined_to_the_workspace() {
    let mut s = session(ApprovalMode::Yolo);
    std::fs::create_dir(s.workspace.path().join("sub")).unwrap();
    let inside = ToolCallRequest::new(
        "in",
        "run_shell_command",
        json!({ "command": "pwd", "directory": "sub" }),
    );
    let outside = ToolCallRequest::new(
        "out",
        "run_shell_command",
        json!({ "command": "pwd", "directory": "../" }),
    );
    s.scheduler
        .schedule(vec![inside, outside], CancellationToken::new())
        .unwrap();

    let (_, calls) = collect_batch(&mut s.events).await;
    let inside = calls[0].result.as_ref().unwrap();
    assert_eq!(calls[0].state, ToolCallState::Success);
    assert!(inside.shell.as_ref().unwrap().output.trim_end().ends_with("sub"));
    assert!(inside.content.contains("Directory: sub"));
    assert_eq!(calls[1].error_kind(), Some(ToolErrorKind::PermissionDenied));
}

#[tokio::test]
async fn invalid_calls_fail_without_blocking_valid_ones() {
    let mut s = session(ApprovalMode::Yolo);
    s.scheduler
        .schedule(
            vec![
                ToolCallRequest::new("missing", "run_shell_command", json!({})),
                shell_call("ok", "echo fine"),
                ToolCallRequest::new("ghost", "no_such_tool", json!({})),
            ],
            CancellationToken::new(),
        )
        .unwrap();

    let (events, calls) = collect_batch(&mut s.events).await;
    let ids: Vec<&str> = calls.iter().map(|c| c.call_id()).collect();
    assert_eq!(ids, vec!["missing", "ok", "ghost"]);
    assert_eq!(calls[0].error_kind(), Some(ToolErrorKind::InvalidToolParams));
    assert_eq!(calls[1].state, ToolCallState::Success);
    assert_eq!(calls[2].error_kind(), Some(ToolErrorKind::ToolNotRegistered));
    assert!(!events.iter().any(|event| matches!(
        event,
        SchedulerEvent::StateChanged { call_id, state: ToolCallState::Executing }
            if call_id != "ok"
    )));
}

#[tokio::test]
async fn unusable_arguments_fail_without_prompting_or_running() {
    let mut s = session(ApprovalMode::Default);
    let call = |id: &str, args: serde_json::Value| ToolCallRequest::new(id, "run_shell_command", args);
    s.scheduler
        .schedule(
            vec![
                call("blank", json!({ "command": "   " })),
                call("escape", json!({ "command": "true", "directory": "../.." })),
                call("missing", json!({ "command": "true", "directory": "nope" })),
            ],
            CancellationToken::new(),
        )
        .unwrap();

    let (events, calls) = collect_batch(&mut s.events).await;
    let kinds: Vec<_> = calls.iter().map(|c| c.error_kind()).collect();
    assert_eq!(
        kinds,
        vec![
            Some(ToolErrorKind::InvalidToolParams),
            Some(ToolErrorKind::PermissionDenied),
            Some(ToolErrorKind::InvalidToolParams),
        ]
    );
    assert!(calls.iter().all(|c| c.state == ToolCallState::Error));
    for event in &events {
        match event {
            SchedulerEvent::StateChanged { call_id, state } => assert!(
                matches!(state, ToolCallState::Validating | ToolCallState::Error),
                "{call_id} reached {state}"
            ),
            SchedulerEvent::ConfirmationRequested(request) => {
                panic!("{} asked for approval", request.call_id)
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn write_file_stays_inside_the_workspace() {
    let mut s = session(ApprovalMode::AutoEdit);
    s.scheduler
        .schedule(
            vec![
                ToolCallRequest::new(
                    "w1",
                    "write_file",
                    json!({ "path": "notes/today.txt", "content": "keel" }),
                ),
                ToolCallRequest::new(
                    "w2",
                    "write_file",
                    json!({ "path": "../escape.txt", "content": "nope" }),
                ),
            ],
            CancellationToken::new(),
        )
        .unwrap();

    let (events, calls) = collect_batch(&mut s.events).await;
    assert_eq!(calls[0].state, ToolCallState::Success);
    assert!(!events.iter().any(|event| matches!(
        event,
        SchedulerEvent::StateChanged { call_id, state: ToolCallState::Executing }
            if call_id == calls[1].call_id()
    )));
    let written = std::fs::read_to_string(s.workspace.path().join("notes/today.txt")).unwrap();
    assert_eq!(written, "keel");
    assert_eq!(calls[1].error_kind(), Some(ToolErrorKind::PermissionDenied));
    assert!(!s.workspace.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn split_multibyte_output_decodes_intact() {
    let mut s = session(ApprovalMode::Yolo);
    s.scheduler
        .schedule_one(
            shell_call("cjk", "printf '\\344\\275'; sleep 0.2; printf '\\240\\345\\245\\275'"),
            CancellationToken::new(),
        )
        .unwrap();

    let (_, calls) = collect_batch(&mut s.events).await;
    let shell = calls[0].result.as_ref().unwrap().shell.as_ref().unwrap();
    assert_eq!(shell.output, "你好");
    assert_eq!(shell.raw_output, "你好".as_bytes());
}
