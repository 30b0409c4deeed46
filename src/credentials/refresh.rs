//! Proactive OAuth token refresh.
//!
//! A single background task scans active OAuth connections on an interval
//! and refreshes any token expiring within the buffer, posting a
//! refresh-grant to the provider's token endpoint with client credentials
//! from per-tenant channel config. The same [`TokenRefresher::refresh_connection`]
//! path serves on-demand refresh from the task executor; both paths are
//! idempotent on a successful provider response and the last writer wins.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::persist::connections::ConnectionRecord;
use crate::types::ConnectionStatus;

use super::{is_expired, CredentialError, CredentialRecord, CredentialStore, SecretValue};

/// Fixed token endpoints per SaaS. Instance-hosted providers are
/// synthesized from the connection's instance URL instead.
fn fixed_token_endpoint(saas_name: &str) -> Option<&'static str> {
    match saas_name {
        "salesforce" => Some("https://login.salesforce.com/services/oauth2/token"),
        "freee" => Some("https://accounts.secure.freee.co.jp/public_api/token"),
        "google_workspace" => Some("https://oauth2.googleapis.com/token"),
        _ => None,
    }
}

/// Resolve the token endpoint for a connection.
pub fn token_endpoint(saas_name: &str, instance_url: Option<&str>) -> Option<String> {
    if let Some(fixed) = fixed_token_endpoint(saas_name) {
        return Some(fixed.to_owned());
    }
    let instance = instance_url?.trim_end_matches('/');
    match saas_name {
        "kintone" => Some(format!("{instance}/oauth2/token")),
        "smarthr" => Some(format!("{instance}/oauth/token")),
        _ => None,
    }
}

/// Credential-store provider key for a SaaS connection.
pub fn provider_key(saas_name: &str) -> String {
    format!("saas_{saas_name}")
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Background refresher plus on-demand refresh entry point.
#[derive(Clone)]
pub struct TokenRefresher {
    store: CredentialStore,
    http: reqwest::Client,
    interval: Duration,
    buffer: Duration,
}

impl TokenRefresher {
    pub fn new(store: CredentialStore, interval: Duration, buffer: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            store,
            http,
            interval,
            buffer,
        }
    }

    /// The expiry buffer this refresher applies.
    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// Spawn the background loop. The handle can be aborted on shutdown;
    /// no lock is held between iterations.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!(interval_secs = self.interval.as_secs(), "token refresher started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup isn't a
            // refresh stampede.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_cycle().await {
                    warn!(error = %e, "token refresh cycle failed");
                }
            }
        })
    }

    /// One scan over active OAuth connections.
    ///
    /// # Errors
    ///
    /// Returns an error only when the connection listing fails; individual
    /// refresh failures are recorded on their connection and counted.
    pub async fn refresh_cycle(&self) -> anyhow::Result<()> {
        let connections = self.store.database().list_active_oauth_connections().await?;
        if connections.is_empty() {
            return Ok(());
        }

        let mut refreshed: u32 = 0;
        let mut failed: u32 = 0;
        for connection in &connections {
            let provider = provider_key(&connection.saas_name);
            let record = match self.store.get(&connection.tenant_id, &provider).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(connection = %connection.id, error = %e, "credential read failed");
                    continue;
                }
            };
            if !is_expired(&record, self.buffer) {
                continue;
            }
            match self.refresh_connection(connection).await {
                Ok(()) => refreshed = refreshed.saturating_add(1),
                Err(e) => {
                    warn!(
                        connection = %connection.id,
                        saas = %connection.saas_name,
                        error = %e,
                        "token refresh failed"
                    );
                    failed = failed.saturating_add(1);
                }
            }
        }

        if refreshed > 0 || failed > 0 {
            info!(refreshed, failed, "token refresh cycle complete");
        }
        Ok(())
    }

    /// Refresh one connection's token synchronously.
    ///
    /// On success the new token is stored (keeping the previous refresh
    /// token when the response omits one) and the connection is re-marked
    /// `active`. On provider rejection the connection is marked
    /// `token_expired` with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] describing the failure.
    pub async fn refresh_connection(
        &self,
        connection: &ConnectionRecord,
    ) -> Result<(), CredentialError> {
        let provider = provider_key(&connection.saas_name);
        let db = self.store.database().clone();

        let record = self
            .store
            .get(&connection.tenant_id, &provider)
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?
            .ok_or(CredentialError::NoRefreshToken)?;
        let refresh_token = record
            .refresh_token
            .as_ref()
            .filter(|t| !t.expose().is_empty())
            .ok_or(CredentialError::NoRefreshToken)?;

        let token_url = token_endpoint(&connection.saas_name, connection.instance_url.as_deref())
            .ok_or_else(|| CredentialError::UnknownEndpoint(connection.saas_name.clone()))?;

        let client_id = db
            .get_channel_config_value(&connection.tenant_id, &connection.saas_name, "client_id")
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        let client_secret = db
            .get_channel_config_value(&connection.tenant_id, &connection.saas_name, "client_secret")
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
            return Err(CredentialError::MissingClientConfig(
                connection.saas_name.clone(),
            ));
        };

        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
                ("client_id", &client_id),
                ("client_secret", &client_secret),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let reason = format!("refresh rejected: HTTP {status}");
            let _ = db
                .update_connection_status(
                    &connection.tenant_id,
                    &connection.id,
                    ConnectionStatus::TokenExpired,
                    Some(&reason),
                )
                .await;
            // Truncate the body so provider errors never flood the logs.
            let preview: String = body.chars().take(200).collect();
            return Err(CredentialError::RefreshFailed(format!(
                "HTTP {status}: {preview}"
            )));
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| CredentialError::RefreshFailed(format!("parse error: {e}")))?;

        let expires_at = parsed.expires_in.map(|seconds| {
            chrono::Utc::now()
                .checked_add_signed(chrono::Duration::seconds(seconds))
                .unwrap_or_else(chrono::Utc::now)
        });
        // Keep the old refresh token when the provider does not rotate it.
        let new_refresh = parsed
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(SecretValue::new)
            .or_else(|| record.refresh_token.clone());

        let raw_response = serde_json::from_str(&body).ok();
        let updated = CredentialRecord {
            tenant_id: connection.tenant_id.clone(),
            provider,
            access_token: SecretValue::new(parsed.access_token),
            refresh_token: new_refresh,
            expires_at,
            scopes: parsed.scope.or(record.scopes),
            raw_response,
        };
        self.store
            .save(&updated)
            .await
            .map_err(|e| CredentialError::Storage(e.to_string()))?;

        db.update_connection_status(
            &connection.tenant_id,
            &connection.id,
            ConnectionStatus::Active,
            None,
        )
        .await
        .map_err(|e| CredentialError::Storage(e.to_string()))?;

        info!(
            connection = %connection.id,
            saas = %connection.saas_name,
            "token refreshed"
        );
        Ok(())
    }
}
