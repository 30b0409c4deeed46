//! Slack Events API adapter.
//!
//! Requests are authenticated with the v0 HMAC signature over
//! `v0:{timestamp}:{body}` and a five-minute replay window. URL
//! verification challenges are answered in-band; bot echoes are ignored
//! to prevent reply loops.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use super::{ChannelAdapter, ChannelEvent, IngressError, ParseOutcome, WebhookRequest};

type HmacSha256 = Hmac<Sha256>;

/// Replay window for the request timestamp, in seconds.
const REPLAY_WINDOW_SECS: i64 = 300;

/// Verify a Slack request signature at a given `now` (unix seconds).
pub fn verify_signature(
    body: &[u8],
    timestamp: &str,
    signature: &str,
    signing_secret: &str,
    now: i64,
) -> bool {
    if signing_secret.is_empty() || timestamp.is_empty() || signature.is_empty() {
        return false;
    }
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if now.saturating_sub(ts).abs() > REPLAY_WINDOW_SECS {
        return false;
    }

    let Some(expected_hex) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{ts}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Render the expected signature for a body (tests, fixtures).
pub fn sign(body: &[u8], timestamp: i64, signing_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .unwrap_or_else(|_| panic!("hmac accepts any key length"));
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// Slack channel adapter. Replies go through `chat.postMessage` with the
/// tenant's bot token.
pub struct SlackAdapter {
    http: reqwest::Client,
    bot_token: Option<String>,
}

impl SlackAdapter {
    pub fn new(bot_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
        }
    }

    async fn post_message(&self, channel: &str, thread_ts: Option<&str>, text: &str) {
        let Some(token) = self.bot_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("no Slack bot token configured; dropping outbound message");
            return;
        };
        let mut payload = serde_json::json!({"channel": channel, "text": text});
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = serde_json::Value::String(ts.to_owned());
        }
        let result = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) => {
                let ok = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("ok").and_then(serde_json::Value::as_bool))
                    .unwrap_or(false);
                if !ok {
                    warn!("Slack API rejected the message");
                }
            }
            Err(e) => warn!(error = %e, "failed to post Slack message"),
        }
    }

    fn parse_at(
        &self,
        request: &WebhookRequest,
        secret: &str,
        now: i64,
    ) -> Result<ParseOutcome, IngressError> {
        let payload: serde_json::Value = serde_json::from_slice(&request.body)
            .map_err(|e| IngressError::InvalidPayload(e.to_string()))?;

        // URL verification is answered before signature checking so a
        // freshly-configured endpoint can complete the handshake.
        if payload.get("type").and_then(|t| t.as_str()) == Some("url_verification") {
            let challenge = payload
                .get("challenge")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_owned();
            return Ok(ParseOutcome::Challenge(challenge));
        }

        let timestamp = request.header("x-slack-request-timestamp");
        let signature = request.header("x-slack-signature");
        if !verify_signature(&request.body, timestamp, signature, secret, now) {
            return Err(IngressError::InvalidSignature);
        }

        let event = payload.get("event").cloned().unwrap_or_default();
        if event.get("bot_id").is_some()
            || event.get("subtype").and_then(|s| s.as_str()) == Some("bot_message")
        {
            return Ok(ParseOutcome::Ignore);
        }
        if event.get("type").and_then(|t| t.as_str()) != Some("message") {
            return Ok(ParseOutcome::Ignore);
        }
        let text = event
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_owned();
        if text.is_empty() {
            return Ok(ParseOutcome::Ignore);
        }

        Ok(ParseOutcome::Event(ChannelEvent {
            source: "slack".to_owned(),
            requirement: text,
            sender_id: event
                .get("user")
                .and_then(|u| u.as_str())
                .unwrap_or("")
                .to_owned(),
            reply_ref: serde_json::json!({
                "channel": event.get("channel").and_then(|c| c.as_str()).unwrap_or(""),
                "thread_ts": event.get("ts").and_then(|t| t.as_str()).unwrap_or(""),
            }),
            genre: None,
        }))
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel_name(&self) -> &str {
        "slack"
    }

    fn parse(&self, request: &WebhookRequest, secret: &str) -> Result<ParseOutcome, IngressError> {
        self.parse_at(request, secret, chrono::Utc::now().timestamp())
    }

    async fn send_progress(&self, reply_ref: &serde_json::Value, text: &str) {
        let channel = reply_ref.get("channel").and_then(|c| c.as_str()).unwrap_or("");
        let thread_ts = reply_ref.get("thread_ts").and_then(|t| t.as_str());
        if !channel.is_empty() {
            self.post_message(channel, thread_ts, text).await;
        }
    }

    async fn send_result(&self, reply_ref: &serde_json::Value, run_id: &str, status: &str, detail: &str) {
        let mut text = format!("*Run completed*\n- Run ID: `{run_id}`\n- Status: `{status}`");
        if !detail.is_empty() {
            let clipped: String = detail.chars().take(500).collect();
            text.push_str(&format!("\n- Detail: {clipped}"));
        }
        self.send_progress(reply_ref, &text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn message_body(text: &str) -> Vec<u8> {
        serde_json::json!({
            "type": "event_callback",
            "event": {
                "type": "message",
                "text": text,
                "user": "U123",
                "channel": "C456",
                "ts": "1712345678.000100"
            }
        })
        .to_string()
        .into_bytes()
    }

    fn signed_request(body: Vec<u8>, now: i64) -> WebhookRequest {
        let signature = sign(&body, now, SECRET);
        let mut headers = HashMap::new();
        headers.insert("x-slack-request-timestamp".to_owned(), now.to_string());
        headers.insert("x-slack-signature".to_owned(), signature);
        WebhookRequest { headers, body }
    }

    #[test]
    fn test_valid_signature_yields_event() {
        let adapter = SlackAdapter::new(None);
        let now = 1_712_345_678;
        let request = signed_request(message_body("build me a report"), now);
        let outcome = adapter.parse_at(&request, SECRET, now).expect("parse");
        match outcome {
            ParseOutcome::Event(event) => {
                assert_eq!(event.requirement, "build me a report");
                assert_eq!(event.sender_id, "U123");
                assert_eq!(event.reply_ref["channel"], "C456");
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_signature_rejected() {
        let adapter = SlackAdapter::new(None);
        let now = 1_712_345_678;
        let mut request = signed_request(message_body("hello"), now);
        request
            .headers
            .insert("x-slack-signature".to_owned(), "v0=deadbeef".to_owned());
        assert!(matches!(
            adapter.parse_at(&request, SECRET, now),
            Err(IngressError::InvalidSignature)
        ));
    }

    #[test]
    fn test_replay_window_enforced() {
        let adapter = SlackAdapter::new(None);
        let sent_at = 1_712_345_678;
        let request = signed_request(message_body("hello"), sent_at);
        let too_late = sent_at + REPLAY_WINDOW_SECS + 1;
        assert!(matches!(
            adapter.parse_at(&request, SECRET, too_late),
            Err(IngressError::InvalidSignature)
        ));
    }

    #[test]
    fn test_url_verification_challenge() {
        let adapter = SlackAdapter::new(None);
        let body = serde_json::json!({"type": "url_verification", "challenge": "ch-123"})
            .to_string()
            .into_bytes();
        let request = WebhookRequest {
            headers: HashMap::new(),
            body,
        };
        match adapter.parse_at(&request, SECRET, 0).expect("parse") {
            ParseOutcome::Challenge(challenge) => assert_eq!(challenge, "ch-123"),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_bot_messages_ignored() {
        let adapter = SlackAdapter::new(None);
        let now = 1_712_345_678;
        let body = serde_json::json!({
            "type": "event_callback",
            "event": {"type": "message", "text": "echo", "bot_id": "B1"}
        })
        .to_string()
        .into_bytes();
        let request = signed_request(body, now);
        assert!(matches!(
            adapter.parse_at(&request, SECRET, now).expect("parse"),
            ParseOutcome::Ignore
        ));
    }

    #[test]
    fn test_signature_verification_roundtrip() {
        let body = b"payload";
        let now = 1000;
        let signature = sign(body, now, SECRET);
        assert!(verify_signature(body, "1000", &signature, SECRET, now));
        assert!(!verify_signature(b"tampered", "1000", &signature, SECRET, now));
        assert!(!verify_signature(body, "1000", &signature, "other-secret", now));
    }
}
