//! Path and command policy through the public workspace API.

use std::time::Duration;

use millwright::sandbox::local::{LocalWorkspace, LocalWorkspaceFactory};
use millwright::sandbox::{SandboxError, Workspace, WorkspaceFactory, BLOCKED_COMMANDS};

#[tokio::test]
async fn traversal_variants_are_refused_and_leave_workspace_unchanged() {
    let ws = LocalWorkspace::open().expect("open");
    for rel in ["../escape", "/etc/passwd", "a/../../b", "..", "a/b/../../../c"] {
        let write = ws.write_file(rel, "x").await;
        assert!(
            matches!(write, Err(SandboxError::PathTraversal(_))),
            "{rel} must be refused"
        );
        let read = ws.read_file(rel).await;
        assert!(
            matches!(read, Err(SandboxError::PathTraversal(_))),
            "{rel} must be refused on read"
        );
    }
    assert!(ws.list_files(".").await.expect("list").is_empty());
}

#[tokio::test]
async fn every_denylisted_command_is_refused_without_spawning() {
    let ws = LocalWorkspace::open().expect("open");
    for name in BLOCKED_COMMANDS {
        let argv = vec![(*name).to_owned(), "whatever".to_owned()];
        let result = ws.run_command(&argv, Duration::from_secs(5)).await;
        assert!(
            matches!(result, Err(SandboxError::CommandBlocked(_))),
            "{name} must be blocked"
        );
    }
    // Blocked attempts are still audited.
    let audit = ws.audit_log();
    assert_eq!(audit.len(), BLOCKED_COMMANDS.len());
    assert!(audit.iter().all(|record| !record.result_summary.success));
}

#[tokio::test]
async fn command_timeout_returns_structured_failure() {
    let ws = LocalWorkspace::open().expect("open");
    let argv = vec!["sleep".to_owned(), "30".to_owned()];
    let started = std::time::Instant::now();
    let outcome = ws
        .run_command(&argv, Duration::from_millis(200))
        .await
        .expect("structured result");
    assert!(outcome.timed_out);
    assert!(!outcome.success());
    assert!(started.elapsed() < Duration::from_secs(5), "no process leak wait");
}

#[tokio::test]
async fn factory_workspaces_are_isolated_from_each_other() {
    let factory = LocalWorkspaceFactory;
    let a = factory.open().await.expect("open a");
    let b = factory.open().await.expect("open b");

    a.write_file("only-in-a.txt", "x").await.expect("write");
    assert!(matches!(
        b.read_file("only-in-a.txt").await,
        Err(SandboxError::NotFound(_))
    ));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn audit_log_preserves_operation_order() {
    let ws = LocalWorkspace::open().expect("open");
    ws.write_file("one.txt", "1").await.expect("write");
    ws.write_file("two.txt", "2").await.expect("write");
    let _ = ws.read_file("one.txt").await;

    let tools: Vec<String> = ws.audit_log().iter().map(|r| r.tool.clone()).collect();
    assert_eq!(tools, vec!["file_write", "file_write", "file_read"]);
}
