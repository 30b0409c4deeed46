//! Ollama `/api/chat` provider (local fallback).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    check_http_response, CompletionRequest, CompletionResponse, LlmProvider, ProviderError, Role,
    UsageStats,
};

/// Provider speaking the Ollama chat API.
#[derive(Debug)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    message: ApiResponseMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    content: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let messages: Vec<ApiMessage<'_>> = request
            .messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let body = ApiRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        let raw = check_http_response(response).await?;
        let parsed: ApiResponse =
            serde_json::from_str(&raw).map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(CompletionResponse {
            content: parsed.message.content,
            usage: UsageStats {
                input_tokens: parsed.prompt_eval_count,
                output_tokens: parsed.eval_count,
            },
            model: self.model.clone(),
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_with_missing_counts() {
        let raw = r#"{"message": {"content": "hi"}}"#;
        let parsed: ApiResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.message.content, "hi");
        assert_eq!(parsed.prompt_eval_count, 0);
        assert_eq!(parsed.eval_count, 0);
    }
}
