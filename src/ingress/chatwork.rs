//! Chatwork webhook adapter.
//!
//! Chatwork authenticates with a shared webhook token rather than an HMAC
//! header. Messages are filtered to explicit bot mentions when a bot
//! account id is configured, and the `[To:...]` tags are stripped from
//! the requirement text.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use super::{ChannelAdapter, ChannelEvent, IngressError, ParseOutcome, WebhookRequest};

const API_BASE: &str = "https://api.chatwork.com/v2";

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[To:\d+\]\s*").unwrap_or_else(|e| panic!("invalid mention pattern: {e}"))
    })
}

/// Chatwork channel adapter.
pub struct ChatworkAdapter {
    http: reqwest::Client,
    api_token: Option<String>,
    bot_account_id: Option<String>,
}

impl ChatworkAdapter {
    pub fn new(api_token: Option<String>, bot_account_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_token,
            bot_account_id,
        }
    }

    async fn post_message(&self, room_id: &str, body: &str) {
        let Some(token) = self.api_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("no Chatwork API token configured; dropping outbound message");
            return;
        };
        let result = self
            .http
            .post(format!("{API_BASE}/rooms/{room_id}/messages"))
            .header("X-ChatWorkToken", token)
            .form(&[("body", body)])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "Chatwork API error"),
            Err(e) => warn!(error = %e, "failed to post Chatwork message"),
        }
    }
}

#[async_trait]
impl ChannelAdapter for ChatworkAdapter {
    fn channel_name(&self) -> &str {
        "chatwork"
    }

    fn parse(&self, request: &WebhookRequest, secret: &str) -> Result<ParseOutcome, IngressError> {
        let header_token = request.header("x-chatworkwebhooksignature");
        if !secret.is_empty() && header_token != secret {
            return Err(IngressError::InvalidSignature);
        }

        let payload: serde_json::Value = serde_json::from_slice(&request.body)
            .map_err(|e| IngressError::InvalidPayload(e.to_string()))?;
        let event = payload.get("webhook_event").cloned().unwrap_or_default();

        let body = event
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
        let room_id = event
            .get("room_id")
            .map(|r| r.to_string().trim_matches('"').to_owned())
            .unwrap_or_default();
        if body.is_empty() || room_id.is_empty() {
            return Ok(ParseOutcome::Ignore);
        }

        // Only handle explicit mentions when a bot account is configured.
        if let Some(bot_id) = self.bot_account_id.as_deref().filter(|id| !id.is_empty()) {
            if !body.contains(&format!("[To:{bot_id}]")) {
                return Ok(ParseOutcome::Ignore);
            }
        }

        let requirement = mention_re().replace_all(&body, "").trim().to_owned();
        if requirement.is_empty() {
            return Ok(ParseOutcome::Ignore);
        }

        let message_id = event
            .get("message_id")
            .map(|m| m.to_string().trim_matches('"').to_owned())
            .unwrap_or_default();
        let account_id = event
            .get("account")
            .and_then(|a| a.get("account_id"))
            .map(|a| a.to_string().trim_matches('"').to_owned())
            .unwrap_or_default();

        Ok(ParseOutcome::Event(ChannelEvent {
            source: "chatwork".to_owned(),
            requirement,
            sender_id: account_id,
            reply_ref: serde_json::json!({"room_id": room_id, "message_id": message_id}),
            genre: None,
        }))
    }

    async fn send_progress(&self, reply_ref: &serde_json::Value, text: &str) {
        let room_id = reply_ref.get("room_id").and_then(|r| r.as_str()).unwrap_or("");
        if !room_id.is_empty() {
            self.post_message(room_id, text).await;
        }
    }

    async fn send_result(&self, reply_ref: &serde_json::Value, run_id: &str, status: &str, detail: &str) {
        let mut body = format!("[info][title]Run Complete[/title]Run ID: {run_id}\nStatus: {status}");
        if !detail.is_empty() {
            let clipped: String = detail.chars().take(500).collect();
            body.push_str(&format!("\nDetail: {clipped}"));
        }
        body.push_str("[/info]");
        self.send_progress(reply_ref, &body).await;
    }
}
