//! Credential storage: per-tenant per-provider token bundles, encrypted at
//! rest.
//!
//! Tokens pass through [`TokenCipher`] (AES-256-GCM, random nonce) before
//! touching the database. When no encryption key is configured -- local
//! development -- the store falls through to plaintext and logs a warning
//! once. Secret values are wrapped in [`SecretValue`], whose `Debug`
//! output is always redacted.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

use crate::persist::Database;

pub mod refresh;

/// Prefix marking ciphertext values in storage. Values without it are
/// treated as plaintext (key rotation in from the no-key fallback).
const CIPHERTEXT_PREFIX: &str = "gcm:";

const NONCE_LEN: usize = 12;

/// Errors from the credential subsystem.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("no token endpoint known for provider: {0}")]
    UnknownEndpoint(String),
    #[error("missing OAuth client configuration for {0}")]
    MissingClientConfig(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("refresh request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("credential storage error: {0}")]
    Storage(String),
}

/// Opaque secret value that never appears in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret. Use only at the provider-call boundary.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// One (tenant, provider) credential bundle.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub tenant_id: String,
    pub provider: String,
    pub access_token: SecretValue,
    pub refresh_token: Option<SecretValue>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub raw_response: Option<serde_json::Value>,
}

/// True iff the record has an absolute expiry and `now + buffer` reaches
/// it. Records without an expiry never report expired.
pub fn is_expired(record: &CredentialRecord, buffer: std::time::Duration) -> bool {
    let Some(expires_at) = record.expires_at else {
        return false;
    };
    let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now().checked_add_signed(buffer).map_or(false, |horizon| horizon >= expires_at)
}

/// Symmetric cipher for tokens at rest.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Option<Aes256Gcm>,
}

impl TokenCipher {
    /// Build from a base64-encoded 32-byte key. `None` yields the
    /// plaintext fallback with a warning.
    pub fn from_key(key_b64: Option<&str>) -> anyhow::Result<Self> {
        let Some(key_b64) = key_b64.filter(|k| !k.trim().is_empty()) else {
            tracing::warn!("no token encryption key configured; credentials stored in plaintext");
            return Ok(Self { cipher: None });
        };
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .context("token encryption key is not valid base64")?;
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| anyhow::anyhow!("token encryption key must be 32 bytes"))?;
        Ok(Self { cipher: Some(cipher) })
    }

    /// Whether values are actually encrypted.
    pub fn is_active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a plaintext value; plaintext passthrough without a key.
    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_owned());
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("token encryption failed"))?;
        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(format!(
            "{CIPHERTEXT_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(payload)
        ))
    }

    /// Decrypt a stored value. Unprefixed values are returned as-is
    /// (plaintext rows written during the no-key fallback).
    pub fn decrypt(&self, stored: &str) -> anyhow::Result<String> {
        let Some(payload_b64) = stored.strip_prefix(CIPHERTEXT_PREFIX) else {
            return Ok(stored.to_owned());
        };
        let Some(cipher) = &self.cipher else {
            anyhow::bail!("encrypted credential present but no encryption key configured");
        };
        let payload = base64::engine::general_purpose::STANDARD
            .decode(payload_b64)
            .context("stored credential is not valid base64")?;
        if payload.len() <= NONCE_LEN {
            anyhow::bail!("stored credential is truncated");
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("token decryption failed"))?;
        String::from_utf8(plaintext).context("decrypted credential is not UTF-8")
    }
}

/// Encrypted credential store over the shared database.
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
    cipher: TokenCipher,
}

impl CredentialStore {
    pub fn new(db: Database, cipher: TokenCipher) -> Self {
        Self { db, cipher }
    }

    /// Upsert a (tenant, provider) bundle. At most one row exists per pair.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or the write fails.
    pub async fn save(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        let access_enc = self.cipher.encrypt(record.access_token.expose())?;
        let refresh_enc = match &record.refresh_token {
            Some(token) => Some(self.cipher.encrypt(token.expose())?),
            None => None,
        };
        let raw = match &record.raw_response {
            Some(value) => Some(serde_json::to_string(value).context("encode raw response")?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO credentials (tenant_id, provider, access_token_enc, refresh_token_enc,
                 expires_at, scopes, raw_response, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(tenant_id, provider) DO UPDATE SET
                 access_token_enc = excluded.access_token_enc,
                 refresh_token_enc = excluded.refresh_token_enc,
                 expires_at = excluded.expires_at,
                 scopes = excluded.scopes,
                 raw_response = excluded.raw_response,
                 updated_at = excluded.updated_at",
        )
        .bind(&record.tenant_id)
        .bind(&record.provider)
        .bind(&access_enc)
        .bind(&refresh_enc)
        .bind(record.expires_at.map(|t| t.to_rfc3339()))
        .bind(&record.scopes)
        .bind(&raw)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await
        .context("failed to save credential")?;
        Ok(())
    }

    /// Fetch and decrypt the (tenant, provider) bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decryption fails.
    pub async fn get(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> anyhow::Result<Option<CredentialRecord>> {
        type Row = (
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        );
        let row: Option<Row> = sqlx::query_as(
            "SELECT access_token_enc, refresh_token_enc, expires_at, scopes, raw_response
             FROM credentials WHERE tenant_id = ?1 AND provider = ?2",
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_optional(self.db.pool())
        .await
        .context("failed to read credential")?;

        let Some((access_enc, refresh_enc, expires_at, scopes, raw)) = row else {
            return Ok(None);
        };

        let access_token = SecretValue::new(self.cipher.decrypt(&access_enc)?);
        let refresh_token = match refresh_enc {
            Some(enc) => Some(SecretValue::new(self.cipher.decrypt(&enc)?)),
            None => None,
        };
        let expires_at = expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));
        let raw_response = raw.and_then(|raw| serde_json::from_str(&raw).ok());

        Ok(Some(CredentialRecord {
            tenant_id: tenant_id.to_owned(),
            provider: provider.to_owned(),
            access_token,
            refresh_token,
            expires_at,
            scopes,
            raw_response,
        }))
    }

    /// Fetch several (tenant, provider) bundles at once.
    ///
    /// # Errors
    ///
    /// Returns an error if any read fails.
    pub async fn get_bulk(
        &self,
        pairs: &[(String, String)],
    ) -> anyhow::Result<Vec<CredentialRecord>> {
        let mut records = Vec::new();
        for (tenant_id, provider) in pairs {
            if let Some(record) = self.get(tenant_id, provider).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delete the (tenant, provider) bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn delete(&self, tenant_id: &str, provider: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM credentials WHERE tenant_id = ?1 AND provider = ?2")
            .bind(tenant_id)
            .bind(provider)
            .execute(self.db.pool())
            .await
            .context("failed to delete credential")?;
        Ok(())
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}
