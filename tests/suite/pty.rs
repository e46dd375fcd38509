//! PTY backend: rendering, input, resize and abort.

use std::time::Duration;

use keel_config::KeelConfig;
use keel_engine::ShellExecutionService;
use keel_tools::{ShellExecutionHandle, ShellExecutionRequest, ShellInvocation};
use keel_types::{
    ApprovalMode, ExecutionMethod, ShellExecutionResult, ShellOutputEvent, TerminalGeometry,
    ToolCallState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::{EVENT_TIMEOUT, collect_batch, session_with, shell_call};

fn pty_service() -> ShellExecutionService {
    ShellExecutionService::new(ShellInvocation::resolve(None).unwrap(), true)
}

fn pty_request(command: &str, geometry: TerminalGeometry) -> ShellExecutionRequest {
    ShellExecutionRequest::new(command, std::env::temp_dir()).with_terminal(geometry)
}

async fn settle(handle: ShellExecutionHandle) -> ShellExecutionResult {
    tokio::time::timeout(EVENT_TIMEOUT, handle.wait())
        .await
        .expect("pty execution settles")
}

#[tokio::test]
async fn carriage_return_overwrites_like_a_terminal() {
    let service = pty_service();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = service.execute(
        pty_request("printf 'abc\\rX\\n'", TerminalGeometry::default()),
        tx,
        CancellationToken::new(),
    );
    let result = settle(handle).await;
    assert_eq!(result.execution_method, ExecutionMethod::Pty);
    assert_eq!(result.output, "Xbc");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.signal, None);
}

#[tokio::test]
async fn input_reaches_the_child() {
    let service = pty_service();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = service.execute(
        pty_request("read line; echo \"got:$line\"", TerminalGeometry::default()),
        tx,
        CancellationToken::new(),
    );
    let pid = handle.pid.expect("pty child pid");
    assert!(service.active_pty_pids().contains(&pid));
    service.write_to_pty(pid, b"hello\n").unwrap();

    let result = settle(handle).await;
    assert!(result.output.contains("got:hello"), "{}", result.output);
    assert!(service.active_pty_pids().is_empty());
    assert!(service.write_to_pty(pid, b"late\n").is_err());
}

#[tokio::test]
async fn resize_is_visible_to_the_child() {
    let service = pty_service();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = service.execute(
        pty_request("sleep 0.5; stty size", TerminalGeometry::new(80, 24)),
        tx,
        CancellationToken::new(),
    );
    let pid = handle.pid.expect("pty child pid");
    service
        .resize_pty(pid, TerminalGeometry::new(100, 40))
        .unwrap();

    let result = settle(handle).await;
    assert_eq!(result.output.trim(), "40 100");
    assert!(
        service
            .resize_pty(pid, TerminalGeometry::new(90, 30))
            .is_err()
    );
}

#[tokio::test]
async fn data_events_carry_the_rendered_screen() {
    let service = pty_service();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = service.execute(
        pty_request("echo first; sleep 0.2; echo second", TerminalGeometry::default()),
        tx,
        CancellationToken::new(),
    );
    let result = settle(handle).await;

    let mut last = None;
    while let Some(event) = rx.recv().await {
        if let ShellOutputEvent::Data { chunk } = event {
            last = Some(chunk);
        }
    }
    assert!(last.is_some_and(|screen| screen.ends_with("second")));
    assert_eq!(result.output, "first\nsecond");
}

#[tokio::test]
async fn long_output_keeps_every_line() {
    let service = pty_service();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = service.execute(
        pty_request("seq 200", TerminalGeometry::new(80, 10)),
        tx,
        CancellationToken::new(),
    );
    let result = settle(handle).await;
    assert!(result.error.is_none());
    assert_eq!(result.exit_code, Some(0));
    let expected: Vec<String> = (1..=200).map(|i| i.to_string()).collect();
    assert_eq!(result.output, expected.join("\n"));
}

#[tokio::test]
async fn abort_hangs_up_the_pty() {
    let service = pty_service();
    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let handle = service.execute(
        pty_request("sleep 10", TerminalGeometry::default()),
        tx,
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = settle(handle).await;
    assert!(result.aborted);
    assert_eq!(result.signal, None);
    assert_eq!(result.execution_method, ExecutionMethod::Pty);
}

#[tokio::test]
async fn scheduler_runs_shell_tool_through_the_pty() {
    let mut s = session_with(ApprovalMode::Yolo, true, &KeelConfig::default());
    s.scheduler
        .schedule_one(
            shell_call("tty", "test -t 1 && echo on-a-tty"),
            CancellationToken::new(),
        )
        .unwrap();

    let (_, calls) = collect_batch(&mut s.events).await;
    assert_eq!(calls[0].state, ToolCallState::Success);
    let shell = calls[0].result.as_ref().unwrap().shell.as_ref().unwrap();
    assert_eq!(shell.execution_method, ExecutionMethod::Pty);
    assert_eq!(shell.output, "on-a-tty");
}
