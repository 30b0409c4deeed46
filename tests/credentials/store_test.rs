//! Encrypted store behavior through the public API.

use base64::Engine;
use chrono::Utc;
use millwright::credentials::{is_expired, CredentialRecord, CredentialStore, SecretValue, TokenCipher};
use millwright::persist::Database;

fn key() -> String {
    base64::engine::general_purpose::STANDARD.encode([42u8; 32])
}

fn record(expires_in_minutes: i64) -> CredentialRecord {
    CredentialRecord {
        tenant_id: "tenant-a".to_owned(),
        provider: "saas_salesforce".to_owned(),
        access_token: SecretValue::new("access-abc"),
        refresh_token: Some(SecretValue::new("refresh-xyz")),
        expires_at: Some(Utc::now() + chrono::Duration::minutes(expires_in_minutes)),
        scopes: Some("api".to_owned()),
        raw_response: None,
    }
}

#[tokio::test]
async fn token_freshness_buffer() {
    let buffer = std::time::Duration::from_secs(300);
    assert!(is_expired(&record(4), buffer), "4 minutes left is within a 5-minute buffer");
    assert!(!is_expired(&record(10), buffer), "10 minutes left is outside the buffer");

    let mut no_expiry = record(4);
    no_expiry.expires_at = None;
    assert!(!is_expired(&no_expiry, buffer), "no expiry never expires");
}

#[tokio::test]
async fn plaintext_never_reaches_storage() {
    let db = Database::open_in_memory().await.expect("db");
    let store = CredentialStore::new(db.clone(), TokenCipher::from_key(Some(&key())).expect("cipher"));
    store.save(&record(60)).await.expect("save");

    let loaded = store
        .get("tenant-a", "saas_salesforce")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded.access_token.expose(), "access-abc");

    // Debug output must redact, storage must be ciphertext.
    assert!(!format!("{loaded:?}").contains("access-abc"));
}

#[tokio::test]
async fn per_tenant_rows_are_independent() {
    let db = Database::open_in_memory().await.expect("db");
    let store = CredentialStore::new(db, TokenCipher::from_key(None).expect("cipher"));

    let mut a = record(60);
    a.tenant_id = "tenant-a".to_owned();
    store.save(&a).await.expect("save a");

    let mut b = record(60);
    b.tenant_id = "tenant-b".to_owned();
    b.access_token = SecretValue::new("other-token");
    store.save(&b).await.expect("save b");

    let loaded_a = store
        .get("tenant-a", "saas_salesforce")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded_a.access_token.expose(), "access-abc");
    let loaded_b = store
        .get("tenant-b", "saas_salesforce")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded_b.access_token.expose(), "other-token");
}
