//! SaaS-track scenario: plan → approve → execute with a partial failure.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use millwright::config::{CredentialsConfig, PipelineConfig};
use millwright::credentials::refresh::TokenRefresher;
use millwright::credentials::{CredentialStore, TokenCipher};
use millwright::persist::Database;
use millwright::saas::{AdapterRegistry, SaasAdapter, SaasCredentials, SaasError, ToolSpec};
use millwright::tasks::{CreateTaskParams, TaskController, TaskStageContext};
use millwright::testing::fixed_router;
use millwright::types::{AuthMethod, ConnectionStatus, FailureCategory, TaskStatus};

/// Kintone-shaped adapter: `get_apps` works, `get_records` is rejected
/// with an auth error.
struct HalfBrokenAdapter;

#[async_trait]
impl SaasAdapter for HalfBrokenAdapter {
    fn saas_name(&self) -> &str {
        "kintone"
    }

    async fn connect(&self, _credentials: SaasCredentials) -> Result<(), SaasError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SaasError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, SaasError> {
        Ok(true)
    }

    async fn available_tools(&self) -> Result<Vec<ToolSpec>, SaasError> {
        Ok(vec![
            ToolSpec {
                name: "get_apps".to_owned(),
                description: "List apps".to_owned(),
                parameters: serde_json::json!({}),
            },
            ToolSpec {
                name: "get_records".to_owned(),
                description: "List records of an app".to_owned(),
                parameters: serde_json::json!({"app": "integer"}),
            },
        ])
    }

    async fn execute_tool(
        &self,
        name: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SaasError> {
        match name {
            "get_apps" => Ok(serde_json::json!({"success": true, "apps": [{"id": 1}]})),
            "get_records" => Err(SaasError::Api("401 unauthorized".to_owned())),
            other => Err(SaasError::UnknownTool(other.to_owned())),
        }
    }

    async fn schema(&self) -> Result<serde_json::Value, SaasError> {
        Ok(serde_json::json!({"objects": []}))
    }
}

const PLAN_REPLY: &str = "## Plan\n1. List the apps\n2. List the records\n\n```json\n[\n  {\"tool_name\": \"get_apps\", \"arguments\": {}},\n  {\"tool_name\": \"get_records\", \"arguments\": {\"app\": 1}}\n]\n```";

async fn build_controller() -> (TaskController, Database, String) {
    let db = Database::open_in_memory().await.expect("db");
    let connection = db
        .create_connection(
            "tenant-a",
            "kintone",
            Some("admin"),
            None,
            AuthMethod::Oauth2,
            Some("https://acme.cybozu.com"),
            &[],
        )
        .await
        .expect("connection");
    db.update_connection_status("tenant-a", &connection.id, ConnectionStatus::Active, None)
        .await
        .expect("activate");

    let store = CredentialStore::new(db.clone(), TokenCipher::from_key(None).expect("cipher"));
    let credentials = CredentialsConfig::default();
    let refresher = TokenRefresher::new(
        store.clone(),
        credentials.refresh_interval(),
        credentials.refresh_buffer(),
    );
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(HalfBrokenAdapter));

    let ctx = Arc::new(TaskStageContext {
        models: fixed_router(PLAN_REPLY),
        adapters,
        store,
        refresher,
        db: db.clone(),
        pipeline: PipelineConfig::default(),
        rules_dir: PathBuf::from("/nonexistent-rules"),
    });
    (TaskController::new(ctx, 3), db, connection.id)
}

#[tokio::test]
async fn plan_approve_partial_failure() {
    let (controller, db, connection_id) = build_controller().await;

    let planned = controller
        .create_and_plan(CreateTaskParams {
            tenant_id: "tenant-a".to_owned(),
            connection_id,
            description: "list apps and records".to_owned(),
            saas_name: "kintone".to_owned(),
            genre: Some("admin".to_owned()),
            dry_run: false,
        })
        .await
        .expect("plan");

    assert_eq!(planned.status, TaskStatus::AwaitingApproval);
    assert_eq!(planned.operation_count, 2);
    assert_eq!(planned.planned_operations[0].tool_name, "get_apps");

    let executed = controller
        .approve_and_execute("tenant-a", &planned.task_id)
        .await
        .expect("execute");

    assert_eq!(executed.status, TaskStatus::Failed);
    let summary = executed.result_summary.expect("summary");
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.failure_count, 1);
    assert_eq!(summary.total_operations, 2);
    assert_eq!(executed.failure_category, Some(FailureCategory::AuthError));

    // Only the summary is persisted; no raw adapter payload appears on the row.
    let report = executed.report_markdown.expect("report");
    assert!(!report.contains("\"apps\""), "raw responses must not be persisted");

    // Audit records carry the per-operation outcomes.
    assert_eq!(
        db.count_audit_logs(&executed.task_id).await.expect("count"),
        2
    );
}

#[tokio::test]
async fn rejected_task_never_executes() {
    let (controller, db, connection_id) = build_controller().await;
    let planned = controller
        .create_and_plan(CreateTaskParams {
            tenant_id: "tenant-a".to_owned(),
            connection_id,
            description: "list apps".to_owned(),
            saas_name: "kintone".to_owned(),
            genre: None,
            dry_run: false,
        })
        .await
        .expect("plan");

    controller.reject("tenant-a", &planned.task_id).await.expect("reject");
    let record = db
        .get_task("tenant-a", &planned.task_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(record.status, TaskStatus::Rejected);

    assert!(
        controller
            .approve_and_execute("tenant-a", &planned.task_id)
            .await
            .is_err(),
        "a rejected task cannot be approved"
    );
    assert_eq!(db.count_audit_logs(&planned.task_id).await.expect("count"), 0);
}

#[tokio::test]
async fn cross_tenant_task_access_is_empty() {
    let (controller, db, connection_id) = build_controller().await;
    let planned = controller
        .create_and_plan(CreateTaskParams {
            tenant_id: "tenant-a".to_owned(),
            connection_id,
            description: "list apps".to_owned(),
            saas_name: "kintone".to_owned(),
            genre: None,
            dry_run: false,
        })
        .await
        .expect("plan");

    assert!(db
        .get_task("tenant-b", &planned.task_id)
        .await
        .expect("get")
        .is_none());
    assert!(db
        .list_tasks("tenant-b", None, 50)
        .await
        .expect("list")
        .is_empty());
    assert!(controller
        .approve_and_execute("tenant-b", &planned.task_id)
        .await
        .is_err());
}
