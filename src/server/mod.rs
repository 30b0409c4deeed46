//! Ingress webhooks and the run/task control API.
//!
//! Webhook deliveries are verified, acked within the channel's deadline,
//! and executed in a spawned background task; verification failures are
//! 4xx and never enqueue a run. Control endpoints are tenant-scoped via
//! the `X-Tenant-ID` header.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::{info, warn};

use crate::ingress::{ChannelAdapter, IngressError, ParseOutcome, WebhookRequest};
use crate::persist::Database;
use crate::runs::{RunController, StartRunParams};
use crate::tasks::{CreateTaskParams, TaskController};
use crate::types::TaskStatus;

/// Shared state behind every handler.
pub struct AppState {
    pub db: Database,
    pub runs: Arc<RunController>,
    pub tasks: Arc<TaskController>,
    pub channels: HashMap<String, Arc<dyn ChannelAdapter>>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/{channel}/{tenant_id}", post(webhook))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{run_id}/spec", get(run_spec))
        .route("/runs/{run_id}/resume", post(resume_run))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{task_id}", get(get_task).delete(delete_task))
        .route("/tasks/{task_id}/approve", post(approve_task))
        .route("/tasks/{task_id}/reject", post(reject_task))
        .route("/tasks/{task_id}/retry", post(retry_task))
        .route("/settings", get(get_settings).put(update_settings))
        .with_state(state)
}

type ApiResult = (StatusCode, Json<serde_json::Value>);

fn ok(value: serde_json::Value) -> ApiResult {
    (StatusCode::OK, Json(value))
}

fn error_response(status: StatusCode, detail: impl std::fmt::Display) -> ApiResult {
    (status, Json(serde_json::json!({"detail": detail.to_string()})))
}

/// Tenant scoping for control endpoints.
fn tenant_from_headers(headers: &HeaderMap) -> Result<String, ApiResult> {
    headers
        .get("x-tenant-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "missing X-Tenant-ID header"))
}

/// Which channel-config key holds the webhook verification secret.
fn secret_key(channel: &str) -> &'static str {
    match channel {
        "slack" => "signing_secret",
        _ => "webhook_token",
    }
}

async fn health() -> ApiResult {
    ok(serde_json::json!({"status": "ok"}))
}

// ── Webhooks ────────────────────────────────────────────────────

async fn webhook(
    State(state): State<Arc<AppState>>,
    Path((channel, tenant_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let Some(adapter) = state.channels.get(&channel).cloned() else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown channel: {channel}"));
    };

    let secret = match state
        .db
        .get_channel_config_value(&tenant_id, &channel, secret_key(&channel))
        .await
    {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                format!("channel {channel} is not configured for this tenant"),
            )
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let request = WebhookRequest {
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or("").to_owned(),
                )
            })
            .collect(),
        body: body.to_vec(),
    };

    match adapter.parse(&request, &secret) {
        Ok(ParseOutcome::Challenge(challenge)) => ok(serde_json::json!({"challenge": challenge})),
        Ok(ParseOutcome::Ignore) => ok(serde_json::json!({"ok": true})),
        Ok(ParseOutcome::Event(event)) => {
            info!(channel = %channel, tenant = %tenant_id, "webhook event accepted");
            let runs = state.runs.clone();
            let reply_ref = event.reply_ref.clone();
            let params = StartRunParams {
                tenant_id,
                requirement: event.requirement,
                genre: event.genre,
                emit_rule_improvements: false,
                origin_event_id: Some(format!("{}:{}", event.source, event.sender_id)),
            };
            // Ack now; the run executes in the background.
            tokio::spawn(async move {
                adapter.send_progress(&reply_ref, "Working on it...").await;
                match runs.start_run(params).await {
                    Ok(final_state) => {
                        let detail = final_state.error_logs.last().cloned().unwrap_or_default();
                        adapter
                            .send_result(
                                &reply_ref,
                                &final_state.run_id,
                                &final_state.status.to_string(),
                                &detail,
                            )
                            .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "webhook-triggered run failed to start");
                        adapter
                            .send_result(&reply_ref, "-", "failed", &e.to_string())
                            .await;
                    }
                }
            });
            ok(serde_json::json!({"ok": true}))
        }
        Err(IngressError::InvalidSignature) => {
            error_response(StatusCode::UNAUTHORIZED, "invalid signature")
        }
        Err(IngressError::InvalidPayload(detail)) => {
            error_response(StatusCode::BAD_REQUEST, detail)
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

// ── Runs ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRunBody {
    requirement: String,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default)]
    emit_rule_improvements: bool,
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRunBody>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    if body.requirement.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "requirement must not be empty");
    }

    let params = StartRunParams {
        tenant_id,
        requirement: body.requirement,
        genre: body.genre,
        emit_rule_improvements: body.emit_rule_improvements,
        origin_event_id: None,
    };
    match state.runs.start_run(params).await {
        Ok(run) => ok(serde_json::json!({
            "run_id": run.run_id,
            "status": run.status.to_string(),
            "output_subdir": run.output_subdir,
            "mr_url": run.mr_url,
            "error_logs": run.error_logs,
            "spec_markdown_preview": run.spec_markdown.chars().take(500).collect::<String>(),
            "total_input_tokens": run.total_input_tokens,
            "total_output_tokens": run.total_output_tokens,
            "genre": run.genre,
            "genre_override_reason": run.genre_override_reason,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    status: Option<String>,
}

fn default_limit() -> i64 {
    50
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.db.list_runs(&tenant_id, query.limit).await {
        Ok(runs) => {
            let rows: Vec<serde_json::Value> = runs
                .iter()
                .map(|run| {
                    serde_json::json!({
                        "run_id": run.run_id,
                        "status": run.status.to_string(),
                        "requirement_summary": run.requirement_summary,
                        "retry_count": run.retry_count,
                        "mr_url": run.mr_url,
                        "output_subdir": run.output_subdir,
                        "created_at": run.created_at,
                    })
                })
                .collect();
            ok(serde_json::json!({"runs": rows}))
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn run_spec(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.db.get_run(&tenant_id, &run_id).await {
        Ok(Some(run)) => ok(serde_json::json!({
            "spec_markdown": run.spec_markdown.unwrap_or_default()
        })),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "run not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn resume_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.runs.resume_run(&tenant_id, &run_id).await {
        Ok(run) => ok(serde_json::json!({
            "run_id": run.run_id,
            "status": run.status.to_string(),
            "mr_url": run.mr_url,
            "error_logs": run.error_logs,
            "total_input_tokens": run.total_input_tokens,
            "total_output_tokens": run.total_output_tokens,
        })),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

// ── Tasks ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTaskBody {
    connection_id: String,
    description: String,
    saas_name: String,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

fn task_json(task: &crate::persist::tasks::TaskRecord) -> serde_json::Value {
    serde_json::json!({
        "task_id": task.task_id,
        "status": task.status.to_string(),
        "description": task.description,
        "saas_name": task.saas_name,
        "genre": task.genre,
        "dry_run": task.dry_run,
        "plan_markdown": task.plan_markdown,
        "operation_count": task.operation_count,
        "result_summary": task.result_summary,
        "report_markdown": task.report_markdown,
        "failure_reason": task.failure_reason,
        "failure_category": task.failure_category.map(|c| c.to_string()),
        "duration_ms": task.duration_ms,
        "created_at": task.created_at,
    })
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    let params = CreateTaskParams {
        tenant_id,
        connection_id: body.connection_id,
        description: body.description,
        saas_name: body.saas_name,
        genre: body.genre,
        dry_run: body.dry_run,
    };
    match state.tasks.create_and_plan(params).await {
        Ok(task) => ok(task_json(&task)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<TaskStatus>() {
            Ok(status) => Some(status),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    match state.db.list_tasks(&tenant_id, status, query.limit).await {
        Ok(tasks) => ok(serde_json::json!({
            "tasks": tasks.iter().map(task_json).collect::<Vec<_>>()
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.db.get_task(&tenant_id, &task_id).await {
        Ok(Some(task)) => ok(task_json(&task)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn approve_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.tasks.approve_and_execute(&tenant_id, &task_id).await {
        Ok(task) => ok(task_json(&task)),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

async fn reject_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.tasks.reject(&tenant_id, &task_id).await {
        Ok(()) => ok(serde_json::json!({"ok": true})),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn retry_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.tasks.retry(&tenant_id, &task_id).await {
        Ok(task) => ok(task_json(&task)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.db.delete_task(&tenant_id, &task_id).await {
        Ok(()) => ok(serde_json::json!({"ok": true})),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

// ── Settings ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SettingsBody {
    auto_execute: bool,
}

async fn get_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.db.get_auto_execute(&tenant_id).await {
        Ok(auto_execute) => ok(serde_json::json!({"auto_execute": auto_execute})),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SettingsBody>,
) -> ApiResult {
    let tenant_id = match tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match state.db.set_auto_execute(&tenant_id, body.auto_execute).await {
        Ok(()) => ok(serde_json::json!({"auto_execute": body.auto_execute})),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Serve the router on the configured address until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "http server listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
