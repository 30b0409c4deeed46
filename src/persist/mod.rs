//! Tenant-scoped storage over SQLite.
//!
//! One pool, WAL journal, schema applied inline on open. Every read and
//! write of a tenant-owned row carries an explicit tenant predicate -- the
//! query layer is the isolation boundary, not the callers. Persistence
//! failures around a run are swallowed with a log entry at the call sites:
//! the run's in-memory state is authoritative over the database's.

use std::path::Path;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod audit;
pub mod connections;
pub mod rules;
pub mod runs;
pub mod settings;
pub mod tasks;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory database (tests). A single connection keeps the
    /// whole suite on one schema instance.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .pragma("foreign_keys", "ON");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
        let migration_sql = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .context("failed to apply schema migration")?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Current UTC time in RFC 3339, the timestamp format of every table.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_applies_schema() {
        let db = Database::open_in_memory().await.expect("open");
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs")
            .fetch_one(db.pool())
            .await
            .expect("query");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/state.db");
        let db = Database::open(&path).await.expect("open");
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(db.pool())
            .await
            .expect("query");
        assert_eq!(count.0, 0);
    }
}
