//! Profile-based model routing.
//!
//! The pipeline never names a vendor; it asks for one of two profiles.
//! Quality goes to the best configured provider, cost to the cheapest.

use std::sync::Arc;

use crate::config::LlmConfig;

use super::anthropic::AnthropicProvider;
use super::ollama::OllamaProvider;
use super::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError};

/// Named provider profiles consumed by pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// High-quality model: spec writing, task planning.
    Quality,
    /// Low-cost model: code generation, classification, rule drafting.
    Cost,
}

/// Resolves a [`Profile`] to a concrete provider.
#[derive(Clone)]
pub struct ModelRouter {
    quality: Arc<dyn LlmProvider>,
    cost: Arc<dyn LlmProvider>,
}

impl ModelRouter {
    /// Build from explicit providers (tests inject mocks here).
    pub fn new(quality: Arc<dyn LlmProvider>, cost: Arc<dyn LlmProvider>) -> Self {
        Self { quality, cost }
    }

    /// Build from configuration. Anthropic, when configured, serves both
    /// profiles (with per-profile model overrides); otherwise the local
    /// Ollama endpoint serves everything.
    pub fn from_config(config: &LlmConfig) -> Self {
        match &config.anthropic {
            Some(cloud) => {
                let quality_model = config
                    .quality_model
                    .clone()
                    .unwrap_or_else(|| cloud.model.clone());
                let cost_model = config
                    .cost_model
                    .clone()
                    .unwrap_or_else(|| cloud.model.clone());
                tracing::info!(
                    quality = %quality_model,
                    cost = %cost_model,
                    "model router using anthropic provider"
                );
                Self {
                    quality: Arc::new(AnthropicProvider::new(&cloud.api_key, quality_model)),
                    cost: Arc::new(AnthropicProvider::new(&cloud.api_key, cost_model)),
                }
            }
            None => {
                tracing::info!(
                    base_url = %config.local.base_url,
                    model = %config.local.model,
                    "model router using local provider"
                );
                let local: Arc<dyn LlmProvider> = Arc::new(OllamaProvider::new(
                    &config.local.base_url,
                    &config.local.model,
                ));
                Self {
                    quality: local.clone(),
                    cost: local,
                }
            }
        }
    }

    /// Complete a request through the given profile.
    ///
    /// # Errors
    ///
    /// Propagates the underlying [`ProviderError`].
    pub async fn complete(
        &self,
        profile: Profile,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let provider = match profile {
            Profile::Quality => &self.quality,
            Profile::Cost => &self.cost,
        };
        provider.complete(request).await
    }

    /// The model identifier serving a profile.
    pub fn model_for(&self, profile: Profile) -> &str {
        match profile {
            Profile::Quality => self.quality.model_id(),
            Profile::Cost => self.cost.model_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Message, UsageStats};
    use async_trait::async_trait;

    struct FixedProvider {
        reply: String,
        model: String,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: self.reply.clone(),
                usage: UsageStats {
                    input_tokens: 1,
                    output_tokens: 2,
                },
                model: self.model.clone(),
            })
        }

        fn model_id(&self) -> &str {
            &self.model
        }
    }

    #[tokio::test]
    async fn test_profiles_route_to_distinct_providers() {
        let router = ModelRouter::new(
            Arc::new(FixedProvider {
                reply: "from-quality".to_owned(),
                model: "q".to_owned(),
            }),
            Arc::new(FixedProvider {
                reply: "from-cost".to_owned(),
                model: "c".to_owned(),
            }),
        );

        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            max_tokens: None,
        };
        let quality = router
            .complete(Profile::Quality, request.clone())
            .await
            .expect("quality");
        assert_eq!(quality.content, "from-quality");
        let cost = router
            .complete(Profile::Cost, request)
            .await
            .expect("cost");
        assert_eq!(cost.content, "from-cost");
        assert_eq!(router.model_for(Profile::Quality), "q");
    }

    #[test]
    fn test_from_config_local_fallback() {
        let config = LlmConfig::default();
        let router = ModelRouter::from_config(&config);
        assert_eq!(router.model_for(Profile::Quality), "llama3");
        assert_eq!(router.model_for(Profile::Cost), "llama3");
    }
}
