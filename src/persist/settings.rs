//! Per-tenant settings. Currently one flag: `auto_execute`, which decides
//! whether a run executes end-to-end or pauses at the spec-review
//! checkpoint for human approval.

use anyhow::Context;

use super::{now_iso, Database};

impl Database {
    /// The tenant's `auto_execute` flag; tenants without a row default on.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_auto_execute(&self, tenant_id: &str) -> anyhow::Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT auto_execute FROM tenant_settings WHERE tenant_id = ?1")
                .bind(tenant_id)
                .fetch_optional(self.pool())
                .await
                .context("failed to read tenant settings")?;
        Ok(row.map(|(v,)| v != 0).unwrap_or(true))
    }

    /// Update the tenant's `auto_execute` flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_auto_execute(&self, tenant_id: &str, value: bool) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO tenant_settings (tenant_id, auto_execute, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET
                auto_execute = excluded.auto_execute, updated_at = excluded.updated_at",
        )
        .bind(tenant_id)
        .bind(i64::from(value))
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to write tenant settings")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_is_auto_on() {
        let db = Database::open_in_memory().await.expect("open");
        assert!(db.get_auto_execute("tenant-a").await.expect("get"));
    }

    #[tokio::test]
    async fn test_set_and_get_per_tenant() {
        let db = Database::open_in_memory().await.expect("open");
        db.set_auto_execute("tenant-a", false).await.expect("set");
        assert!(!db.get_auto_execute("tenant-a").await.expect("get"));
        assert!(db.get_auto_execute("tenant-b").await.expect("get"));

        db.set_auto_execute("tenant-a", true).await.expect("set");
        assert!(db.get_auto_execute("tenant-a").await.expect("get"));
    }
}
