//! Batched audit-log persistence.
//!
//! One batch per run or per task, inside a transaction. Callers treat the
//! write as best-effort: a logging problem must never abort the run, so
//! failures are logged and swallowed at the call sites.

use anyhow::Context;

use crate::types::{AuditRecord, AuditSource};

use super::Database;

/// Tenant/SaaS context attached to `saas`-sourced audit batches.
#[derive(Debug, Clone)]
pub struct SaasAuditContext {
    pub tenant_id: String,
    pub saas_name: String,
    pub connection_id: String,
    pub genre: Option<String>,
}

impl Database {
    /// Insert a batch of audit records for one owning run or task.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch insert fails; callers swallow it.
    pub async fn persist_audit_logs(
        &self,
        owning_id: &str,
        records: &[AuditRecord],
        source: AuditSource,
        saas_context: Option<&SaasAuditContext>,
    ) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to begin audit transaction")?;

        for record in records {
            let arguments = serde_json::to_string(&record.arguments)
                .context("failed to encode audit arguments")?;
            let summary = serde_json::to_string(&record.result_summary)
                .context("failed to encode audit summary")?;
            sqlx::query(
                "INSERT INTO audit_logs (owning_id, tool, arguments, result_summary, source,
                     tenant_id, saas_name, connection_id, genre, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(owning_id)
            .bind(&record.tool)
            .bind(&arguments)
            .bind(&summary)
            .bind(source.to_string())
            .bind(saas_context.map(|c| c.tenant_id.as_str()))
            .bind(saas_context.map(|c| c.saas_name.as_str()))
            .bind(saas_context.map(|c| c.connection_id.as_str()))
            .bind(saas_context.and_then(|c| c.genre.as_deref()))
            .bind(record.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await
            .context("failed to insert audit record")?;
        }

        tx.commit().await.context("failed to commit audit batch")?;
        Ok(())
    }

    /// Count audit records for one owning id (diagnostics, tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn count_audit_logs(&self, owning_id: &str) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_logs WHERE owning_id = ?1")
            .bind(owning_id)
            .fetch_one(self.pool())
            .await
            .context("failed to count audit logs")?;
        Ok(row.0)
    }
}
