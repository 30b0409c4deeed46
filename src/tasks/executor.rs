//! Task executor: drive the approved operation list through the SaaS
//! adapter.
//!
//! Operations run sequentially and independently: a per-operation failure
//! is captured into its result and never short-circuits the remaining
//! operations. Every invocation appends an audit record. Credentials are
//! fetched fresh, with one synchronous refresh when the stored token is
//! expiring.

use std::sync::Arc;

use tracing::{info, warn};

use crate::credentials::refresh::provider_key;
use crate::credentials::{is_expired, CredentialRecord};
use crate::graph::StageError;
use crate::saas::{SaasAdapter, SaasCredentials};
use crate::types::{AuditRecord, TaskStatus};

use super::state::{OperationResult, TaskDelta, TaskState};
use super::TaskStageContext;

fn failed_delta(message: String) -> TaskDelta {
    TaskDelta {
        status: Some(TaskStatus::Failed),
        failure_reason: Some(message.clone()),
        error_logs: vec![message],
        ..Default::default()
    }
}

/// Execute the planned operations in order.
pub async fn execute_operations(
    ctx: Arc<TaskStageContext>,
    state: TaskState,
) -> Result<TaskDelta, StageError> {
    let Some(connection) = ctx
        .db
        .get_connection(&state.tenant_id, &state.connection_id)
        .await
        .map_err(|e| StageError::Fatal(format!("connection lookup failed: {e}")))?
    else {
        return Ok(failed_delta(format!(
            "SaaS connection not found: {}",
            state.connection_id
        )));
    };

    let Some(adapter) = ctx.adapters.get(&state.saas_name) else {
        return Ok(failed_delta(format!("unsupported SaaS: {}", state.saas_name)));
    };

    // Fresh credential, refreshing once when it is about to expire.
    let provider = provider_key(&state.saas_name);
    let mut credential = ctx
        .store
        .get(&state.tenant_id, &provider)
        .await
        .map_err(|e| StageError::Fatal(format!("credential read failed: {e}")))?;
    if let Some(record) = &credential {
        if is_expired(record, ctx.refresher.buffer()) {
            info!(task_id = %state.task_id, saas = %state.saas_name, "token expiring; refreshing on demand");
            if let Err(e) = ctx.refresher.refresh_connection(&connection).await {
                return Ok(failed_delta(format!(
                    "token expired and refresh failed ({e}); re-authentication required"
                )));
            }
            credential = ctx
                .store
                .get(&state.tenant_id, &provider)
                .await
                .map_err(|e| StageError::Fatal(format!("credential reload failed: {e}")))?;
        }
    }

    let saas_credentials = SaasCredentials {
        auth_method: connection.auth_method,
        access_token: credential.as_ref().map(|c: &CredentialRecord| c.access_token.clone()),
        refresh_token: credential.as_ref().and_then(|c| c.refresh_token.clone()),
        instance_url: connection.instance_url.clone(),
        scopes: connection.scopes.clone(),
    };
    if let Err(e) = adapter.connect(saas_credentials).await {
        return Ok(failed_delta(format!("adapter connect failed: {e}")));
    }

    let mut delta = TaskDelta::default();
    for operation in &state.operations {
        let started = std::time::Instant::now();
        let (success, error) = if state.dry_run {
            (true, None)
        } else {
            match adapter
                .execute_tool(&operation.tool_name, operation.arguments.clone())
                .await
            {
                Ok(result) => {
                    // Adapters may signal soft failure inside the result map.
                    let ok = result
                        .get("success")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(true);
                    let error = result
                        .get("error")
                        .and_then(|e| e.as_str())
                        .map(ToOwned::to_owned);
                    (ok, if ok { None } else { error.or_else(|| Some("unknown error".to_owned())) })
                }
                Err(e) => (false, Some(e.to_string())),
            }
        };
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        if !success {
            warn!(
                task_id = %state.task_id,
                tool = %operation.tool_name,
                error = error.as_deref().unwrap_or("unknown"),
                "operation failed; continuing"
            );
        }

        delta.audit_log.push(AuditRecord::now(
            &operation.tool_name,
            operation.arguments.clone(),
            success,
            error.clone(),
            Some(duration_ms),
        ));
        delta.operation_results.push(OperationResult {
            tool_name: operation.tool_name.clone(),
            success,
            error,
        });
    }

    if let Err(e) = adapter.disconnect().await {
        warn!(task_id = %state.task_id, error = %e, "adapter disconnect failed");
    }
    if let Err(e) = ctx
        .db
        .touch_connection_used(&state.tenant_id, &state.connection_id)
        .await
    {
        warn!(error = %e, "failed to stamp connection usage");
    }

    Ok(delta)
}
