//! Event ingress: normalize inbound webhooks into run triggers.
//!
//! Channel adapters share a narrow interface: verify the channel's native
//! authentication, parse the payload into a [`ChannelEvent`] (or a
//! verification challenge, or nothing), and send progress/results back to
//! the originating conversation. The HTTP layer resolves the per-tenant
//! secret, acks immediately, and runs the pipeline in the background.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod chatwork;
pub mod slack;

/// Transport-agnostic view of an inbound webhook request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(&name.to_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// A normalized channel event that triggers a run.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub source: String,
    pub requirement: String,
    pub sender_id: String,
    /// Channel-specific reply metadata, opaque to the core.
    pub reply_ref: serde_json::Value,
    pub genre: Option<String>,
}

/// What a parse produced.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    /// A run-triggering event.
    Event(ChannelEvent),
    /// A URL-verification challenge to answer in-band, without a run.
    Challenge(String),
    /// A valid but uninteresting delivery (bot echo, non-message event).
    Ignore,
}

/// Ingress errors. Verification failures map to 4xx and never enqueue.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("channel not configured: {0}")]
    NotConfigured(String),
}

/// One inbound channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel identifier used in webhook paths (`slack`, `chatwork`).
    fn channel_name(&self) -> &str;

    /// Verify and parse an inbound request using the tenant's secret.
    fn parse(&self, request: &WebhookRequest, secret: &str) -> Result<ParseOutcome, IngressError>;

    /// Post a progress note back to the originating conversation.
    async fn send_progress(&self, reply_ref: &serde_json::Value, text: &str);

    /// Post the run outcome back to the originating conversation.
    async fn send_result(&self, reply_ref: &serde_json::Value, run_id: &str, status: &str, detail: &str);
}
