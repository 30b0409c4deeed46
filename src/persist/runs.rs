//! Run rows: completed-run persistence, spec-review snapshots, resume.

use anyhow::Context;

use crate::types::RunStatus;

use super::{now_iso, Database};

/// Summary row for a run, as stored.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub tenant_id: String,
    pub requirement_summary: Option<String>,
    pub spec_markdown: Option<String>,
    pub status: RunStatus,
    pub retry_count: u32,
    pub last_error_signature: Option<String>,
    pub error_logs: Vec<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub output_subdir: Option<String>,
    pub genre: Option<String>,
    pub genre_subcategory: Option<String>,
    pub genre_override_reason: Option<String>,
    pub origin_event_id: Option<String>,
    pub mr_url: Option<String>,
    pub has_snapshot: bool,
    pub created_at: String,
}

/// Fields written when a run reaches a persistence point. One value per
/// column the pipeline owns; the row is upserted so a snapshot row and the
/// final row share an identity.
#[derive(Debug, Clone)]
pub struct RunUpsert<'a> {
    pub run_id: &'a str,
    pub tenant_id: &'a str,
    pub requirement_summary: Option<String>,
    pub spec_markdown: Option<String>,
    pub status: RunStatus,
    pub retry_count: u32,
    pub last_error_signature: Option<String>,
    pub error_logs: &'a [String],
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub output_subdir: Option<String>,
    pub emit_rule_improvements: bool,
    pub genre: Option<String>,
    pub genre_subcategory: Option<String>,
    pub genre_override_reason: Option<String>,
    pub origin_event_id: Option<String>,
    pub mr_url: Option<String>,
    /// Serialized state to store under `state_snapshot`, or `None` to
    /// clear the column.
    pub state_snapshot: Option<serde_json::Value>,
}

/// Raw row shape; columns map by name.
#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    tenant_id: String,
    requirement_summary: Option<String>,
    spec_markdown: Option<String>,
    status: String,
    retry_count: i64,
    last_error_signature: Option<String>,
    error_logs: String,
    total_input_tokens: i64,
    total_output_tokens: i64,
    output_subdir: Option<String>,
    genre: Option<String>,
    genre_subcategory: Option<String>,
    genre_override_reason: Option<String>,
    origin_event_id: Option<String>,
    mr_url: Option<String>,
    state_snapshot: Option<String>,
    created_at: String,
}

fn row_into_record(row: RunRow) -> RunRecord {
    RunRecord {
        run_id: row.run_id,
        tenant_id: row.tenant_id,
        requirement_summary: row.requirement_summary,
        spec_markdown: row.spec_markdown,
        status: row.status.parse().unwrap_or(RunStatus::Failed),
        retry_count: u32::try_from(row.retry_count.max(0)).unwrap_or(0),
        last_error_signature: row.last_error_signature,
        error_logs: serde_json::from_str(&row.error_logs).unwrap_or_default(),
        total_input_tokens: u64::try_from(row.total_input_tokens.max(0)).unwrap_or(0),
        total_output_tokens: u64::try_from(row.total_output_tokens.max(0)).unwrap_or(0),
        output_subdir: row.output_subdir,
        genre: row.genre,
        genre_subcategory: row.genre_subcategory,
        genre_override_reason: row.genre_override_reason,
        origin_event_id: row.origin_event_id,
        mr_url: row.mr_url,
        has_snapshot: row.state_snapshot.is_some(),
        created_at: row.created_at,
    }
}

const SELECT_COLUMNS: &str = "run_id, tenant_id, requirement_summary, spec_markdown, status, \
     retry_count, last_error_signature, error_logs, total_input_tokens, total_output_tokens, \
     output_subdir, genre, genre_subcategory, genre_override_reason, origin_event_id, mr_url, \
     state_snapshot, created_at";

impl Database {
    /// Upsert the full run row. Used for both the spec-review snapshot
    /// write (status `spec_review`, snapshot present) and the final
    /// completed-run write (snapshot cleared).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn persist_run(&self, upsert: RunUpsert<'_>) -> anyhow::Result<()> {
        let error_logs =
            serde_json::to_string(upsert.error_logs).context("failed to encode error logs")?;
        let snapshot = match &upsert.state_snapshot {
            Some(value) => {
                Some(serde_json::to_string(value).context("failed to encode state snapshot")?)
            }
            None => None,
        };
        let now = now_iso();

        sqlx::query(
            r"INSERT INTO runs (run_id, tenant_id, requirement_summary, spec_markdown, status,
                  retry_count, last_error_signature, error_logs, total_input_tokens,
                  total_output_tokens, output_subdir, emit_rule_improvements, genre,
                  genre_subcategory, genre_override_reason, origin_event_id, mr_url,
                  state_snapshot, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19)
              ON CONFLICT(run_id) DO UPDATE SET
                  requirement_summary = excluded.requirement_summary,
                  spec_markdown = excluded.spec_markdown,
                  status = excluded.status,
                  retry_count = excluded.retry_count,
                  last_error_signature = excluded.last_error_signature,
                  error_logs = excluded.error_logs,
                  total_input_tokens = excluded.total_input_tokens,
                  total_output_tokens = excluded.total_output_tokens,
                  output_subdir = excluded.output_subdir,
                  emit_rule_improvements = excluded.emit_rule_improvements,
                  genre = excluded.genre,
                  genre_subcategory = excluded.genre_subcategory,
                  genre_override_reason = excluded.genre_override_reason,
                  origin_event_id = excluded.origin_event_id,
                  mr_url = excluded.mr_url,
                  state_snapshot = excluded.state_snapshot,
                  updated_at = excluded.updated_at",
        )
        .bind(upsert.run_id)
        .bind(upsert.tenant_id)
        .bind(&upsert.requirement_summary)
        .bind(&upsert.spec_markdown)
        .bind(upsert.status.to_string())
        .bind(i64::from(upsert.retry_count))
        .bind(&upsert.last_error_signature)
        .bind(&error_logs)
        .bind(i64::try_from(upsert.total_input_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(upsert.total_output_tokens).unwrap_or(i64::MAX))
        .bind(&upsert.output_subdir)
        .bind(i64::from(upsert.emit_rule_improvements))
        .bind(&upsert.genre)
        .bind(&upsert.genre_subcategory)
        .bind(&upsert.genre_override_reason)
        .bind(&upsert.origin_event_id)
        .bind(&upsert.mr_url)
        .bind(&snapshot)
        .bind(&now)
        .execute(self.pool())
        .await
        .context("failed to persist run")?;

        Ok(())
    }

    /// Load the state snapshot for a run, tenant-scoped.
    ///
    /// Returns the snapshot only while the row's status is `spec_review`;
    /// a run in any other status cannot be resumed and yields `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn load_snapshot(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT state_snapshot FROM runs
             WHERE run_id = ?1 AND tenant_id = ?2 AND status = ?3",
        )
        .bind(run_id)
        .bind(tenant_id)
        .bind(RunStatus::SpecReview.to_string())
        .fetch_optional(self.pool())
        .await
        .context("failed to load snapshot")?;

        let Some((Some(raw),)) = row else {
            return Ok(None);
        };
        let value = serde_json::from_str(&raw).context("failed to decode state snapshot")?;
        Ok(Some(value))
    }

    /// Mutate selected run columns, tenant-scoped.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn update_run_status(
        &self,
        tenant_id: &str,
        run_id: &str,
        status: RunStatus,
        clear_snapshot: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE runs SET
                status = ?3,
                state_snapshot = CASE WHEN ?4 THEN NULL ELSE state_snapshot END,
                updated_at = ?5
             WHERE run_id = ?1 AND tenant_id = ?2",
        )
        .bind(run_id)
        .bind(tenant_id)
        .bind(status.to_string())
        .bind(clear_snapshot)
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to update run status")?;

        Ok(())
    }

    /// List runs for a tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_runs(&self, tenant_id: &str, limit: i64) -> anyhow::Result<Vec<RunRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM runs
             WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        );
        let rows: Vec<RunRow> = sqlx::query_as(&query)
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .context("failed to list runs")?;
        Ok(rows.into_iter().map(row_into_record).collect())
    }

    /// Fetch one run, tenant-scoped.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_run(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> anyhow::Result<Option<RunRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM runs WHERE run_id = ?1 AND tenant_id = ?2"
        );
        let row: Option<RunRow> = sqlx::query_as(&query)
            .bind(run_id)
            .bind(tenant_id)
            .fetch_optional(self.pool())
            .await
            .context("failed to get run")?;
        Ok(row.map(row_into_record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert<'a>(run_id: &'a str, tenant: &'a str, status: RunStatus) -> RunUpsert<'a> {
        RunUpsert {
            run_id,
            tenant_id: tenant,
            requirement_summary: Some("print Hello World".to_owned()),
            spec_markdown: Some("## Purpose\n...".to_owned()),
            status,
            retry_count: 0,
            last_error_signature: None,
            error_logs: &[],
            total_input_tokens: 10,
            total_output_tokens: 20,
            output_subdir: Some("output/hello".to_owned()),
            emit_rule_improvements: false,
            genre: None,
            genre_subcategory: None,
            genre_override_reason: None,
            origin_event_id: None,
            mr_url: None,
            state_snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let db = Database::open_in_memory().await.expect("open");
        let snapshot = serde_json::json!({"requirement": "x", "generated_code": {}});
        let mut row = upsert("run-1", "tenant-a", RunStatus::SpecReview);
        row.state_snapshot = Some(snapshot.clone());
        db.persist_run(row).await.expect("persist");

        let loaded = db
            .load_snapshot("tenant-a", "run-1")
            .await
            .expect("load")
            .expect("snapshot present");
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_snapshot_only_loadable_in_spec_review() {
        let db = Database::open_in_memory().await.expect("open");
        let mut row = upsert("run-2", "tenant-a", RunStatus::Published);
        row.state_snapshot = Some(serde_json::json!({"x": 1}));
        db.persist_run(row).await.expect("persist");

        let loaded = db.load_snapshot("tenant-a", "run-2").await.expect("load");
        assert!(loaded.is_none(), "non-spec_review status must not resume");
    }

    #[tokio::test]
    async fn test_tenant_isolation_on_reads() {
        let db = Database::open_in_memory().await.expect("open");
        db.persist_run(upsert("run-3", "tenant-a", RunStatus::Published))
            .await
            .expect("persist");

        assert!(db.list_runs("tenant-b", 50).await.expect("list").is_empty());
        assert!(db.get_run("tenant-b", "run-3").await.expect("get").is_none());
        assert!(db
            .load_snapshot("tenant-b", "run-3")
            .await
            .expect("load")
            .is_none());

        let own = db.list_runs("tenant-a", 50).await.expect("list");
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].run_id, "run-3");
    }

    #[tokio::test]
    async fn test_update_clears_snapshot() {
        let db = Database::open_in_memory().await.expect("open");
        let mut row = upsert("run-4", "tenant-a", RunStatus::SpecReview);
        row.state_snapshot = Some(serde_json::json!({"x": 1}));
        db.persist_run(row).await.expect("persist");

        db.update_run_status("tenant-a", "run-4", RunStatus::Coding, true)
            .await
            .expect("update");

        let record = db
            .get_run("tenant-a", "run-4")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.status, RunStatus::Coding);
        assert!(!record.has_snapshot);
    }

    #[tokio::test]
    async fn test_upsert_finalizes_snapshot_row() {
        let db = Database::open_in_memory().await.expect("open");
        let mut snap = upsert("run-5", "tenant-a", RunStatus::SpecReview);
        snap.state_snapshot = Some(serde_json::json!({"x": 1}));
        db.persist_run(snap).await.expect("persist snapshot");

        let mut done = upsert("run-5", "tenant-a", RunStatus::Published);
        done.mr_url = Some("https://git.example/mr/1".to_owned());
        db.persist_run(done).await.expect("persist final");

        let record = db
            .get_run("tenant-a", "run-5")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.status, RunStatus::Published);
        assert_eq!(record.mr_url.as_deref(), Some("https://git.example/mr/1"));
        assert!(!record.has_snapshot);

        let runs = db.list_runs("tenant-a", 50).await.expect("list");
        assert_eq!(runs.len(), 1, "upsert must not duplicate the row");
    }
}
