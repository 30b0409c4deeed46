//! Connection rows: tenant-to-SaaS bindings and per-tenant channel config.

use anyhow::Context;

use crate::types::{AuthMethod, ConnectionStatus};

use super::{now_iso, Database};

/// A tenant-to-SaaS binding as stored.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub tenant_id: String,
    pub saas_name: String,
    pub genre: Option<String>,
    pub department: String,
    pub auth_method: AuthMethod,
    pub status: ConnectionStatus,
    pub status_reason: Option<String>,
    pub instance_url: Option<String>,
    pub scopes: Vec<String>,
    pub last_used_at: Option<String>,
    pub last_health_check_at: Option<String>,
}

type ConnectionRow = (
    String,         // id
    String,         // tenant_id
    String,         // saas_name
    Option<String>, // genre
    String,         // department
    String,         // auth_method
    String,         // status
    Option<String>, // status_reason
    Option<String>, // instance_url
    String,         // scopes JSON
    Option<String>, // last_used_at
    Option<String>, // last_health_check_at
);

fn row_into_record(row: ConnectionRow) -> ConnectionRecord {
    let (
        id,
        tenant_id,
        saas_name,
        genre,
        department,
        auth_method,
        status,
        status_reason,
        instance_url,
        scopes,
        last_used_at,
        last_health_check_at,
    ) = row;
    ConnectionRecord {
        id,
        tenant_id,
        saas_name,
        genre,
        department,
        auth_method: auth_method.parse().unwrap_or(AuthMethod::Oauth2),
        status: status.parse().unwrap_or(ConnectionStatus::Error),
        status_reason,
        instance_url,
        scopes: serde_json::from_str(&scopes).unwrap_or_default(),
        last_used_at,
        last_health_check_at,
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, saas_name, genre, department, auth_method, status, \
     status_reason, instance_url, scopes, last_used_at, last_health_check_at";

impl Database {
    /// Create a connection in `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure, including a duplicate
    /// `(tenant, saas, department)` binding.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_connection(
        &self,
        tenant_id: &str,
        saas_name: &str,
        genre: Option<&str>,
        department: Option<&str>,
        auth_method: AuthMethod,
        instance_url: Option<&str>,
        scopes: &[String],
    ) -> anyhow::Result<ConnectionRecord> {
        let id = format!("conn_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let now = now_iso();
        let scopes_json = serde_json::to_string(scopes).context("failed to encode scopes")?;
        sqlx::query(
            "INSERT INTO connections (id, tenant_id, saas_name, genre, department, auth_method,
                 status, instance_url, scopes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(saas_name)
        .bind(genre)
        .bind(department.unwrap_or(""))
        .bind(auth_method.to_string())
        .bind(ConnectionStatus::Pending.to_string())
        .bind(instance_url)
        .bind(&scopes_json)
        .bind(&now)
        .execute(self.pool())
        .await
        .context("failed to create connection")?;

        self.get_connection(tenant_id, &id)
            .await?
            .context("created connection not found")
    }

    /// Fetch one connection, tenant-scoped.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_connection(
        &self,
        tenant_id: &str,
        connection_id: &str,
    ) -> anyhow::Result<Option<ConnectionRecord>> {
        let query =
            format!("SELECT {SELECT_COLUMNS} FROM connections WHERE id = ?1 AND tenant_id = ?2");
        let row: Option<ConnectionRow> = sqlx::query_as(&query)
            .bind(connection_id)
            .bind(tenant_id)
            .fetch_optional(self.pool())
            .await
            .context("failed to get connection")?;
        Ok(row.map(row_into_record))
    }

    /// List a tenant's connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_connections(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<Vec<ConnectionRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM connections
             WHERE tenant_id = ?1 ORDER BY created_at DESC"
        );
        let rows: Vec<ConnectionRow> = sqlx::query_as(&query)
            .bind(tenant_id)
            .fetch_all(self.pool())
            .await
            .context("failed to list connections")?;
        Ok(rows.into_iter().map(row_into_record).collect())
    }

    /// All `active` OAuth connections across tenants, for the background
    /// refresher. This is the one deliberately tenant-unscoped read; rows
    /// carry their tenant for downstream scoping.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_active_oauth_connections(&self) -> anyhow::Result<Vec<ConnectionRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM connections
             WHERE status = ?1 AND auth_method = ?2"
        );
        let rows: Vec<ConnectionRow> = sqlx::query_as(&query)
            .bind(ConnectionStatus::Active.to_string())
            .bind(AuthMethod::Oauth2.to_string())
            .fetch_all(self.pool())
            .await
            .context("failed to list refreshable connections")?;
        Ok(rows.into_iter().map(row_into_record).collect())
    }

    /// Update a connection's health state.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn update_connection_status(
        &self,
        tenant_id: &str,
        connection_id: &str,
        status: ConnectionStatus,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE connections SET status = ?3, status_reason = ?4, updated_at = ?5
             WHERE id = ?1 AND tenant_id = ?2",
        )
        .bind(connection_id)
        .bind(tenant_id)
        .bind(status.to_string())
        .bind(reason)
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to update connection status")?;
        Ok(())
    }

    /// Stamp a connection as just used.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn touch_connection_used(
        &self,
        tenant_id: &str,
        connection_id: &str,
    ) -> anyhow::Result<()> {
        let now = now_iso();
        sqlx::query(
            "UPDATE connections SET last_used_at = ?3, updated_at = ?3
             WHERE id = ?1 AND tenant_id = ?2",
        )
        .bind(connection_id)
        .bind(tenant_id)
        .bind(&now)
        .execute(self.pool())
        .await
        .context("failed to touch connection")?;
        Ok(())
    }

    /// Read one per-tenant channel/provider config value (OAuth client
    /// credentials, webhook secrets).
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_channel_config_value(
        &self,
        tenant_id: &str,
        provider: &str,
        key: &str,
    ) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM channel_config
             WHERE tenant_id = ?1 AND provider = ?2 AND key = ?3",
        )
        .bind(tenant_id)
        .bind(provider)
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .context("failed to read channel config")?;
        Ok(row.map(|(value,)| value))
    }

    /// Upsert one per-tenant channel/provider config value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_channel_config_value(
        &self,
        tenant_id: &str,
        provider: &str,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO channel_config (tenant_id, provider, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id, provider, key) DO UPDATE SET
                value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(tenant_id)
        .bind(provider)
        .bind(key)
        .bind(value)
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to write channel config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let db = Database::open_in_memory().await.expect("open");
        let conn = db
            .create_connection(
                "tenant-a",
                "salesforce",
                Some("sales"),
                None,
                AuthMethod::Oauth2,
                Some("https://example.my.salesforce.com"),
                &["api".to_owned()],
            )
            .await
            .expect("create");
        assert_eq!(conn.status, ConnectionStatus::Pending);

        db.update_connection_status("tenant-a", &conn.id, ConnectionStatus::Active, None)
            .await
            .expect("activate");
        let active = db
            .get_connection("tenant-a", &conn.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(active.status, ConnectionStatus::Active);
        assert_eq!(active.scopes, vec!["api"]);
    }

    #[tokio::test]
    async fn test_duplicate_binding_rejected() {
        let db = Database::open_in_memory().await.expect("open");
        db.create_connection("tenant-a", "freee", None, None, AuthMethod::Oauth2, None, &[])
            .await
            .expect("create");
        let duplicate = db
            .create_connection("tenant-a", "freee", None, None, AuthMethod::Oauth2, None, &[])
            .await;
        assert!(duplicate.is_err());

        // A different department is a distinct binding.
        db.create_connection(
            "tenant-a",
            "freee",
            None,
            Some("accounting"),
            AuthMethod::Oauth2,
            None,
            &[],
        )
        .await
        .expect("create with department");
    }

    #[tokio::test]
    async fn test_cross_tenant_reads_empty() {
        let db = Database::open_in_memory().await.expect("open");
        let conn = db
            .create_connection("tenant-a", "slack", None, None, AuthMethod::ApiKey, None, &[])
            .await
            .expect("create");
        assert!(db
            .get_connection("tenant-b", &conn.id)
            .await
            .expect("get")
            .is_none());
        assert!(db.list_connections("tenant-b").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_refresher_listing_filters() {
        let db = Database::open_in_memory().await.expect("open");
        let oauth = db
            .create_connection("tenant-a", "salesforce", None, None, AuthMethod::Oauth2, None, &[])
            .await
            .expect("create");
        db.create_connection("tenant-a", "chatwork", None, None, AuthMethod::ApiKey, None, &[])
            .await
            .expect("create");

        assert!(db
            .list_active_oauth_connections()
            .await
            .expect("list")
            .is_empty());

        db.update_connection_status("tenant-a", &oauth.id, ConnectionStatus::Active, None)
            .await
            .expect("activate");
        let refreshable = db.list_active_oauth_connections().await.expect("list");
        assert_eq!(refreshable.len(), 1);
        assert_eq!(refreshable[0].saas_name, "salesforce");
    }

    #[tokio::test]
    async fn test_channel_config_roundtrip() {
        let db = Database::open_in_memory().await.expect("open");
        db.set_channel_config_value("tenant-a", "salesforce", "client_id", "abc")
            .await
            .expect("set");
        db.set_channel_config_value("tenant-a", "salesforce", "client_id", "xyz")
            .await
            .expect("overwrite");
        let value = db
            .get_channel_config_value("tenant-a", "salesforce", "client_id")
            .await
            .expect("get");
        assert_eq!(value.as_deref(), Some("xyz"));
        assert!(db
            .get_channel_config_value("tenant-b", "salesforce", "client_id")
            .await
            .expect("get")
            .is_none());
    }
}
