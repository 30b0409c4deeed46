//! Task rows: SaaS-track CRUD, plan freezing, failure-pattern aggregation.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

use crate::types::{FailureCategory, TaskStatus};

use super::{now_iso, Database};

/// One planned SaaS operation, frozen at approval time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlannedOperation {
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Result summary persisted for an executed task. Counts and short error
/// strings only; raw SaaS responses are deliberately dropped.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResultSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub total_operations: usize,
    pub errors: Vec<String>,
}

/// A task row as stored.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub tenant_id: String,
    pub connection_id: String,
    pub description: String,
    pub saas_name: String,
    pub genre: Option<String>,
    pub dry_run: bool,
    pub status: TaskStatus,
    pub plan_markdown: Option<String>,
    pub planned_operations: Vec<PlannedOperation>,
    pub operation_count: usize,
    pub result_summary: Option<ResultSummary>,
    pub report_markdown: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub failure_detail: Option<String>,
    pub duration_ms: i64,
    pub created_at: String,
}

/// An aggregated failure pattern for the learning system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePattern {
    pub saas_name: String,
    pub failure_category: String,
    pub failure_reason: String,
    pub count: i64,
    pub genre: Option<String>,
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .unwrap_or_else(|e| panic!("invalid uuid pattern: {e}"))
    })
}

fn long_hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[0-9a-fA-F]{10,}\b").unwrap_or_else(|e| panic!("invalid hex pattern: {e}"))
    })
}

fn request_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(request_id|id)\b\s*[:=]?\s*[A-Za-z0-9][A-Za-z0-9._-]{5,}")
            .unwrap_or_else(|e| panic!("invalid request-id pattern: {e}"))
    })
}

fn json_code_message_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{[^{}]*"code"\s*:\s*"([^"]+)"[^{}]*"message"\s*:\s*"([^"]*)"[^{}]*\}"#)
            .unwrap_or_else(|e| panic!("invalid json-error pattern: {e}"))
    })
}

/// Collapse unique ids and structured error envelopes into stable shapes
/// suitable for aggregation.
///
/// A JSON error carrying `code`/`message` becomes `CODE: MESSAGE`; UUIDs,
/// long hex strings, and `request_id ...` values become the literal token
/// `<ID>`; whitespace is normalized.
pub fn normalize_failure_reason(reason: &str) -> String {
    if reason.is_empty() {
        return String::new();
    }

    if let Some(caps) = json_code_message_re().captures(reason) {
        let code = &caps[1];
        let message = &caps[2];
        return if message.is_empty() {
            code.to_owned()
        } else {
            format!("{code}: {message}")
        };
    }

    if reason.trim_start().starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(reason) {
            if let Some(code) = value.get("code").and_then(|c| c.as_str()) {
                let message = value.get("message").and_then(|m| m.as_str()).unwrap_or("");
                return if message.is_empty() {
                    code.to_owned()
                } else {
                    format!("{code}: {message}")
                };
            }
        }
    }

    let normalized = uuid_re().replace_all(reason, "<ID>");
    let normalized = long_hex_re().replace_all(&normalized, "<ID>");
    let normalized = request_id_re().replace_all(&normalized, "$1 <ID>");
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn generate_task_id() -> String {
    format!("task_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Raw row shape; columns map by name.
#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    tenant_id: String,
    connection_id: String,
    description: String,
    saas_name: String,
    genre: Option<String>,
    dry_run: i64,
    status: String,
    plan_markdown: Option<String>,
    planned_operations: Option<String>,
    operation_count: i64,
    result_summary: Option<String>,
    report_markdown: Option<String>,
    failure_reason: Option<String>,
    failure_category: Option<String>,
    failure_detail: Option<String>,
    duration_ms: i64,
    created_at: String,
}

fn row_into_record(row: TaskRow) -> TaskRecord {
    TaskRecord {
        task_id: row.task_id,
        tenant_id: row.tenant_id,
        connection_id: row.connection_id,
        description: row.description,
        saas_name: row.saas_name,
        genre: row.genre,
        dry_run: row.dry_run != 0,
        status: row.status.parse().unwrap_or(TaskStatus::Failed),
        plan_markdown: row.plan_markdown,
        planned_operations: row
            .planned_operations
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        operation_count: usize::try_from(row.operation_count.max(0)).unwrap_or(0),
        result_summary: row.result_summary.and_then(|raw| serde_json::from_str(&raw).ok()),
        report_markdown: row.report_markdown,
        failure_reason: row.failure_reason,
        failure_category: row.failure_category.and_then(|raw| raw.parse().ok()),
        failure_detail: row.failure_detail,
        duration_ms: row.duration_ms,
        created_at: row.created_at,
    }
}

const SELECT_COLUMNS: &str = "task_id, tenant_id, connection_id, description, saas_name, genre, \
     dry_run, status, plan_markdown, planned_operations, operation_count, result_summary, \
     report_markdown, failure_reason, failure_category, failure_detail, duration_ms, created_at";

impl Database {
    /// Insert a new task in `planning`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn create_task(
        &self,
        tenant_id: &str,
        connection_id: &str,
        description: &str,
        saas_name: &str,
        genre: Option<&str>,
        dry_run: bool,
    ) -> anyhow::Result<TaskRecord> {
        let task_id = generate_task_id();
        let now = now_iso();
        sqlx::query(
            "INSERT INTO tasks (task_id, tenant_id, connection_id, description, saas_name,
                 genre, dry_run, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(&task_id)
        .bind(tenant_id)
        .bind(connection_id)
        .bind(description)
        .bind(saas_name)
        .bind(genre)
        .bind(i64::from(dry_run))
        .bind(TaskStatus::Planning.to_string())
        .bind(&now)
        .execute(self.pool())
        .await
        .context("failed to create task")?;

        self.get_task(tenant_id, &task_id)
            .await?
            .context("created task not found")
    }

    /// Fetch one task, tenant-scoped.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_task(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<TaskRecord>> {
        let query =
            format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE task_id = ?1 AND tenant_id = ?2");
        let row: Option<TaskRow> = sqlx::query_as(&query)
            .bind(task_id)
            .bind(tenant_id)
            .fetch_optional(self.pool())
            .await
            .context("failed to get task")?;
        Ok(row.map(row_into_record))
    }

    /// List tasks for a tenant, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_tasks(
        &self,
        tenant_id: &str,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {SELECT_COLUMNS} FROM tasks
                     WHERE tenant_id = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3"
                );
                sqlx::query_as(&query)
                    .bind(tenant_id)
                    .bind(status.to_string())
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await
            }
            None => {
                let query = format!(
                    "SELECT {SELECT_COLUMNS} FROM tasks
                     WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                );
                sqlx::query_as(&query)
                    .bind(tenant_id)
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await
            }
        }
        .context("failed to list tasks")?;
        Ok(rows.into_iter().map(row_into_record).collect())
    }

    /// Persist the plan and move the task to `awaiting_approval`.
    ///
    /// Only applies while the task is still `planning`: the operation list
    /// is frozen once the status leaves that state.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure or when the task was not in
    /// `planning`.
    pub async fn save_plan(
        &self,
        tenant_id: &str,
        task_id: &str,
        plan_markdown: &str,
        operations: &[PlannedOperation],
    ) -> anyhow::Result<()> {
        let encoded =
            serde_json::to_string(operations).context("failed to encode planned operations")?;
        let result = sqlx::query(
            "UPDATE tasks SET
                plan_markdown = ?3,
                planned_operations = ?4,
                operation_count = ?5,
                status = ?6,
                updated_at = ?7
             WHERE task_id = ?1 AND tenant_id = ?2 AND status = ?8",
        )
        .bind(task_id)
        .bind(tenant_id)
        .bind(plan_markdown)
        .bind(&encoded)
        .bind(i64::try_from(operations.len()).unwrap_or(i64::MAX))
        .bind(TaskStatus::AwaitingApproval.to_string())
        .bind(now_iso())
        .bind(TaskStatus::Planning.to_string())
        .execute(self.pool())
        .await
        .context("failed to save plan")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("task {task_id} is not in planning; plan is frozen");
        }
        Ok(())
    }

    /// Approve a task for execution.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure or when the task was not awaiting
    /// approval.
    pub async fn approve_task(&self, tenant_id: &str, task_id: &str) -> anyhow::Result<()> {
        let now = now_iso();
        let result = sqlx::query(
            "UPDATE tasks SET status = ?3, approved_at = ?4, updated_at = ?4
             WHERE task_id = ?1 AND tenant_id = ?2 AND status = ?5",
        )
        .bind(task_id)
        .bind(tenant_id)
        .bind(TaskStatus::Executing.to_string())
        .bind(&now)
        .bind(TaskStatus::AwaitingApproval.to_string())
        .execute(self.pool())
        .await
        .context("failed to approve task")?;
        if result.rows_affected() == 0 {
            anyhow::bail!("task {task_id} is not awaiting approval");
        }
        Ok(())
    }

    /// Reject a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn reject_task(&self, tenant_id: &str, task_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?3, updated_at = ?4
             WHERE task_id = ?1 AND tenant_id = ?2",
        )
        .bind(task_id)
        .bind(tenant_id)
        .bind(TaskStatus::Rejected.to_string())
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to reject task")?;
        Ok(())
    }

    /// Reset a failed/rejected task back to `planning` for a retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn reset_task_for_retry(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET
                status = ?3, plan_markdown = NULL, planned_operations = NULL,
                operation_count = 0, result_summary = NULL, report_markdown = NULL,
                failure_reason = NULL, failure_category = NULL, failure_detail = NULL,
                updated_at = ?4
             WHERE task_id = ?1 AND tenant_id = ?2",
        )
        .bind(task_id)
        .bind(tenant_id)
        .bind(TaskStatus::Planning.to_string())
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to reset task")?;
        Ok(())
    }

    /// Persist the execution outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn save_result(
        &self,
        tenant_id: &str,
        task_id: &str,
        summary: &ResultSummary,
        report_markdown: &str,
        duration_ms: i64,
        status: TaskStatus,
    ) -> anyhow::Result<()> {
        let encoded =
            serde_json::to_string(summary).context("failed to encode result summary")?;
        let now = now_iso();
        sqlx::query(
            "UPDATE tasks SET
                result_summary = ?3, report_markdown = ?4, duration_ms = ?5,
                status = ?6, completed_at = ?7, updated_at = ?7
             WHERE task_id = ?1 AND tenant_id = ?2",
        )
        .bind(task_id)
        .bind(tenant_id)
        .bind(&encoded)
        .bind(report_markdown)
        .bind(duration_ms)
        .bind(status.to_string())
        .bind(&now)
        .execute(self.pool())
        .await
        .context("failed to save result")?;
        Ok(())
    }

    /// Record a task failure for the learning system.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn record_failure(
        &self,
        tenant_id: &str,
        task_id: &str,
        failure_reason: &str,
        failure_category: FailureCategory,
        failure_detail: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = now_iso();
        sqlx::query(
            "UPDATE tasks SET
                status = ?3, failure_reason = ?4, failure_category = ?5,
                failure_detail = ?6, completed_at = ?7, updated_at = ?7
             WHERE task_id = ?1 AND tenant_id = ?2",
        )
        .bind(task_id)
        .bind(tenant_id)
        .bind(TaskStatus::Failed.to_string())
        .bind(failure_reason)
        .bind(failure_category.to_string())
        .bind(failure_detail)
        .bind(&now)
        .execute(self.pool())
        .await
        .context("failed to record failure")?;
        Ok(())
    }

    /// Delete a task. Rejected while the task is `executing`.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure or when the task is executing.
    pub async fn delete_task(&self, tenant_id: &str, task_id: &str) -> anyhow::Result<()> {
        let current = self.get_task(tenant_id, task_id).await?;
        if let Some(task) = current {
            if task.status == TaskStatus::Executing {
                anyhow::bail!("task {task_id} is executing and cannot be deleted");
            }
        }
        sqlx::query("DELETE FROM tasks WHERE task_id = ?1 AND tenant_id = ?2")
            .bind(task_id)
            .bind(tenant_id)
            .execute(self.pool())
            .await
            .context("failed to delete task")?;
        Ok(())
    }

    /// Recent failures for a SaaS, used as planner warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_similar_failures(
        &self,
        saas_name: &str,
        genre: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<(String, String, String)>> {
        let rows: Vec<(String, Option<String>, Option<String>, Option<String>)> = match genre {
            Some(genre) => {
                sqlx::query_as(
                    "SELECT description, failure_reason, failure_category, genre FROM tasks
                     WHERE saas_name = ?1 AND genre = ?2 AND failure_reason IS NOT NULL
                     ORDER BY created_at DESC LIMIT ?3",
                )
                .bind(saas_name)
                .bind(genre)
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT description, failure_reason, failure_category, genre FROM tasks
                     WHERE saas_name = ?1 AND failure_reason IS NOT NULL
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .bind(saas_name)
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
        }
        .context("failed to query similar failures")?;

        Ok(rows
            .into_iter()
            .map(|(description, reason, category, _genre)| {
                (
                    description,
                    reason.unwrap_or_default(),
                    category.unwrap_or_default(),
                )
            })
            .collect())
    }

    /// Aggregate normalized failure patterns across recent failed tasks.
    ///
    /// Returns patterns whose `(saas, category, normalized reason)` triple
    /// occurs at least `min_count` times, most frequent first. SQLite has
    /// no normalizer, so aggregation happens application-side over the
    /// most recent window.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_failure_patterns(
        &self,
        saas_name: Option<&str>,
        min_count: i64,
    ) -> anyhow::Result<Vec<FailurePattern>> {
        let rows: Vec<(String, Option<String>, Option<String>, Option<String>)> = match saas_name {
            Some(saas) => {
                sqlx::query_as(
                    "SELECT saas_name, genre, failure_reason, failure_category FROM tasks
                     WHERE saas_name = ?1 AND failure_reason IS NOT NULL
                     ORDER BY created_at DESC LIMIT 500",
                )
                .bind(saas)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT saas_name, genre, failure_reason, failure_category FROM tasks
                     WHERE failure_reason IS NOT NULL
                     ORDER BY created_at DESC LIMIT 500",
                )
                .fetch_all(self.pool())
                .await
            }
        }
        .context("failed to query failure rows")?;

        let mut counts: HashMap<(String, String, String), (i64, Option<String>)> = HashMap::new();
        for (saas, genre, reason, category) in rows {
            let normalized = normalize_failure_reason(&reason.unwrap_or_default());
            let key = (saas, category.unwrap_or_default(), normalized);
            let entry = counts.entry(key).or_insert((0, genre));
            entry.0 = entry.0.saturating_add(1);
        }

        let mut patterns: Vec<FailurePattern> = counts
            .into_iter()
            .filter(|(_, (count, _))| *count >= min_count)
            .map(
                |((saas_name, failure_category, failure_reason), (count, genre))| FailurePattern {
                    saas_name,
                    failure_category,
                    failure_reason,
                    count,
                    genre,
                },
            )
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(patterns)
    }
}
