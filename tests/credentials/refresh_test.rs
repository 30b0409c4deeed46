//! Token refresh against a local stand-in token endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use millwright::credentials::refresh::{provider_key, TokenRefresher};
use millwright::credentials::{CredentialRecord, CredentialStore, SecretValue, TokenCipher};
use millwright::persist::Database;
use millwright::types::{AuthMethod, ConnectionStatus};

/// Minimal OAuth token endpoint: counts hits, returns a fresh token.
async fn spawn_token_endpoint(hits: Arc<AtomicUsize>) -> String {
    let app = Router::new().route(
        "/oauth2/token",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({
                    "access_token": "new-access-token",
                    "refresh_token": "new-refresh-token",
                    "expires_in": 3600
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn seed(db: &Database, store: &CredentialStore, instance_url: &str) -> String {
    let connection = db
        .create_connection(
            "tenant-a",
            "kintone",
            None,
            None,
            AuthMethod::Oauth2,
            Some(instance_url),
            &[],
        )
        .await
        .expect("connection");
    db.update_connection_status("tenant-a", &connection.id, ConnectionStatus::Active, None)
        .await
        .expect("activate");
    db.set_channel_config_value("tenant-a", "kintone", "client_id", "cid")
        .await
        .expect("client id");
    db.set_channel_config_value("tenant-a", "kintone", "client_secret", "csecret")
        .await
        .expect("client secret");

    store
        .save(&CredentialRecord {
            tenant_id: "tenant-a".to_owned(),
            provider: provider_key("kintone"),
            access_token: SecretValue::new("stale-access-token"),
            refresh_token: Some(SecretValue::new("stale-refresh-token")),
            // Expires in 2 minutes: inside the 5-minute buffer.
            expires_at: Some(Utc::now() + chrono::Duration::minutes(2)),
            scopes: None,
            raw_response: None,
        })
        .await
        .expect("seed credential");
    connection.id
}

#[tokio::test]
async fn expiring_token_is_refreshed_and_connection_reactivated() {
    let hits = Arc::new(AtomicUsize::new(0));
    let endpoint = spawn_token_endpoint(hits.clone()).await;

    let db = Database::open_in_memory().await.expect("db");
    let store = CredentialStore::new(db.clone(), TokenCipher::from_key(None).expect("cipher"));
    let connection_id = seed(&db, &store, &endpoint).await;

    let refresher = TokenRefresher::new(
        store.clone(),
        std::time::Duration::from_secs(900),
        std::time::Duration::from_secs(300),
    );
    refresher.refresh_cycle().await.expect("cycle");

    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one refresh POST");

    let refreshed = store
        .get("tenant-a", &provider_key("kintone"))
        .await
        .expect("get")
        .expect("present");
    assert_eq!(refreshed.access_token.expose(), "new-access-token");
    assert_eq!(
        refreshed.refresh_token.as_ref().map(SecretValue::expose),
        Some("new-refresh-token")
    );
    let expires_at = refreshed.expires_at.expect("expiry advanced");
    assert!(expires_at > Utc::now() + chrono::Duration::minutes(30));

    let connection = db
        .get_connection("tenant-a", &connection_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(connection.status, ConnectionStatus::Active);
}

#[tokio::test]
async fn fresh_token_is_left_alone() {
    let hits = Arc::new(AtomicUsize::new(0));
    let endpoint = spawn_token_endpoint(hits.clone()).await;

    let db = Database::open_in_memory().await.expect("db");
    let store = CredentialStore::new(db.clone(), TokenCipher::from_key(None).expect("cipher"));
    let _connection_id = seed(&db, &store, &endpoint).await;

    // Push the expiry well outside the buffer.
    store
        .save(&CredentialRecord {
            tenant_id: "tenant-a".to_owned(),
            provider: provider_key("kintone"),
            access_token: SecretValue::new("fresh-access-token"),
            refresh_token: Some(SecretValue::new("fresh-refresh-token")),
            expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
            scopes: None,
            raw_response: None,
        })
        .await
        .expect("save");

    let refresher = TokenRefresher::new(
        store.clone(),
        std::time::Duration::from_secs(900),
        std::time::Duration::from_secs(300),
    );
    refresher.refresh_cycle().await.expect("cycle");

    assert_eq!(hits.load(Ordering::SeqCst), 0, "no refresh POST for a fresh token");
    let unchanged = store
        .get("tenant-a", &provider_key("kintone"))
        .await
        .expect("get")
        .expect("present");
    assert_eq!(unchanged.access_token.expose(), "fresh-access-token");
}

#[tokio::test]
async fn missing_refresh_token_marks_connection_expired_on_demand() {
    let db = Database::open_in_memory().await.expect("db");
    let store = CredentialStore::new(db.clone(), TokenCipher::from_key(None).expect("cipher"));

    let connection = db
        .create_connection(
            "tenant-a",
            "kintone",
            None,
            None,
            AuthMethod::Oauth2,
            Some("https://acme.cybozu.com"),
            &[],
        )
        .await
        .expect("connection");
    store
        .save(&CredentialRecord {
            tenant_id: "tenant-a".to_owned(),
            provider: provider_key("kintone"),
            access_token: SecretValue::new("stale"),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::minutes(1)),
            scopes: None,
            raw_response: None,
        })
        .await
        .expect("save");

    let refresher = TokenRefresher::new(
        store,
        std::time::Duration::from_secs(900),
        std::time::Duration::from_secs(300),
    );
    let result = refresher.refresh_connection(&connection).await;
    assert!(result.is_err(), "refresh without a refresh token must fail");
}
