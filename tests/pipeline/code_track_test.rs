//! Code-track scenarios: happy path, spec-review pause/resume, and the
//! secret-scan fix loop, driven through the controller's public API with
//! scripted providers and the local workspace.

use std::sync::Arc;

use millwright::config::CostConfig;
use millwright::persist::Database;
use millwright::runs::{RunController, StartRunParams};
use millwright::testing::{scripted_router, stage_context_with_vcs, RecordingVcs};
use millwright::types::RunStatus;

const SPEC_REPLY: &str =
    "## Purpose\nPrint a greeting.\n\n## Conditions / Means\nA single Python script.";
const HELLO_REPLY: &str = "--- main.py ---\nprint('Hello World')\n";
const SECRET_REPLY: &str =
    "--- config.py ---\nAPI_KEY = \"sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"\n";

fn controller(
    dir: &tempfile::TempDir,
    db: Database,
    replies: &[&str],
    vcs: Arc<RecordingVcs>,
) -> RunController {
    RunController::new(
        stage_context_with_vcs(scripted_router(replies), vcs),
        db,
        CostConfig::default(),
        dir.path().display().to_string(),
        "rules".to_owned(),
    )
}

fn hello_params() -> StartRunParams {
    StartRunParams {
        tenant_id: "tenant-a".to_owned(),
        requirement: "print Hello World".to_owned(),
        genre: None,
        emit_rule_improvements: false,
        origin_event_id: None,
    }
}

#[tokio::test]
async fn happy_path_auto_on_publishes_hello_world() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().await.expect("db");
    let vcs = Arc::new(RecordingVcs::with_mr_url("https://git.example/mr/1"));
    let controller = controller(&dir, db.clone(), &[SPEC_REPLY, HELLO_REPLY], vcs);

    let run = controller.start_run(hello_params()).await.expect("run");

    assert_eq!(run.status, RunStatus::Published);
    assert!(
        run.generated_code
            .values()
            .any(|content| content.contains("Hello World")),
        "at least one generated file must contain the literal"
    );
    assert!(run.total_input_tokens > 0);
    assert!(run.total_output_tokens > 0);
    assert_eq!(run.mr_url, "https://git.example/mr/1");

    // The host output directory holds the artifacts and the spec copy.
    let output = dir.path().join(&run.output_subdir);
    assert!(output.join("main.py").exists());
    assert!(output.join("spec.md").exists());
    assert!(output.join("report.html").exists());

    // The sandbox audit batch landed under the run id.
    assert!(db.count_audit_logs(&run.run_id).await.expect("count") > 0);
}

#[tokio::test]
async fn spec_review_pause_then_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().await.expect("db");
    db.set_auto_execute("tenant-a", false).await.expect("settings");
    let vcs = Arc::new(RecordingVcs::default());
    let controller = controller(&dir, db.clone(), &[SPEC_REPLY, HELLO_REPLY], vcs);

    let paused = controller.start_run(hello_params()).await.expect("run");
    assert_eq!(paused.status, RunStatus::SpecReview);
    assert!(paused.generated_code.is_empty());

    let snapshot = db
        .load_snapshot("tenant-a", &paused.run_id)
        .await
        .expect("load")
        .expect("non-empty snapshot for spec_review");
    assert_eq!(snapshot["generated_code"], serde_json::json!({}));
    assert_eq!(snapshot["spec_markdown"], SPEC_REPLY);

    let resumed = controller
        .resume_run("tenant-a", &paused.run_id)
        .await
        .expect("resume");
    assert!(
        matches!(resumed.status, RunStatus::Published | RunStatus::Failed),
        "resume must land in a terminal status, got {:?}",
        resumed.status
    );
    assert_eq!(resumed.status, RunStatus::Published);

    // Snapshot cleared after resume.
    assert!(db
        .load_snapshot("tenant-a", &paused.run_id)
        .await
        .expect("load")
        .is_none());
    let record = db
        .get_run("tenant-a", &paused.run_id)
        .await
        .expect("get")
        .expect("present");
    assert!(!record.has_snapshot);
}

#[tokio::test]
async fn secret_scan_rejection_exhausts_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().await.expect("db");
    let vcs = Arc::new(RecordingVcs::default());
    let controller = controller(&dir, db.clone(), &[SPEC_REPLY, SECRET_REPLY], vcs.clone());

    let run = controller.start_run(hello_params()).await.expect("run");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.retry_count, 3);
    assert!(run.error_logs[0].starts_with("Secret Scan FAILED"));
    assert_eq!(run.last_error_signature.len(), 16);
    assert!(
        run.sandbox_audit_log.is_empty(),
        "sandbox is never opened when the secret scan rejects"
    );
    assert!(
        vcs.pushes.lock().expect("lock").is_empty(),
        "nothing is ever published"
    );

    // No sandbox audit rows, and the run row records the failure.
    assert_eq!(db.count_audit_logs(&run.run_id).await.expect("count"), 0);
    let record = db
        .get_run("tenant-a", &run.run_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.retry_count, 3);
}

#[tokio::test]
async fn tenant_isolation_on_run_control() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_in_memory().await.expect("db");
    db.set_auto_execute("tenant-a", false).await.expect("settings");
    let controller = controller(
        &dir,
        db.clone(),
        &[SPEC_REPLY, HELLO_REPLY],
        Arc::new(RecordingVcs::default()),
    );

    let paused = controller.start_run(hello_params()).await.expect("run");

    // Another tenant can neither see nor resume the run.
    assert!(db.get_run("tenant-b", &paused.run_id).await.expect("get").is_none());
    assert!(controller.resume_run("tenant-b", &paused.run_id).await.is_err());

    // The owner still can.
    assert!(controller.resume_run("tenant-a", &paused.run_id).await.is_ok());
}
