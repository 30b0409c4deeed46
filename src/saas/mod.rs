//! The consumed SaaS adapter seam.
//!
//! The core never talks to a concrete SaaS API; it drives adapters through
//! this narrow interface. Adapters advertise their tools, execute one tool
//! at a time, and expose an object schema. OAuth-capable adapters also
//! surface the authorize-URL and refresh hooks consumed by the external
//! OAuth callback flow.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::SecretValue;
use crate::types::AuthMethod;

/// Errors surfaced by adapters.
#[derive(Debug, Error)]
pub enum SaasError {
    #[error("adapter not connected")]
    NotConnected,
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Api(String),
}

/// Credentials handed to an adapter at connect time.
#[derive(Debug, Clone)]
pub struct SaasCredentials {
    pub auth_method: AuthMethod,
    pub access_token: Option<SecretValue>,
    pub refresh_token: Option<SecretValue>,
    pub instance_url: Option<String>,
    pub scopes: Vec<String>,
}

/// One advertised tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A SaaS adapter. One instance serves one connection at a time.
#[async_trait]
pub trait SaasAdapter: Send + Sync {
    /// The SaaS this adapter speaks for (`"kintone"`, `"salesforce"`, ...).
    fn saas_name(&self) -> &str;

    async fn connect(&self, credentials: SaasCredentials) -> Result<(), SaasError>;

    async fn disconnect(&self) -> Result<(), SaasError>;

    async fn health_check(&self) -> Result<bool, SaasError>;

    async fn available_tools(&self) -> Result<Vec<ToolSpec>, SaasError>;

    /// Execute one tool. The result map is consumed by the executor and
    /// summarized; it is never persisted raw.
    async fn execute_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SaasError>;

    /// Object schema for structural learning.
    async fn schema(&self) -> Result<serde_json::Value, SaasError>;

    /// OAuth authorize URL, for OAuth providers.
    fn oauth_authorize_url(&self, _redirect: &str, _state: &str) -> Option<String> {
        None
    }

    /// Provider-side token refresh, for adapters that own their OAuth
    /// client. Most providers are refreshed centrally by the token
    /// refresher and leave this as `None`.
    async fn refresh_token(&self) -> Result<Option<SaasCredentials>, SaasError> {
        Ok(None)
    }
}

/// Registry resolving adapters by SaaS name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SaasAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SaasAdapter>) {
        self.adapters.insert(adapter.saas_name().to_owned(), adapter);
    }

    pub fn get(&self, saas_name: &str) -> Option<Arc<dyn SaasAdapter>> {
        self.adapters.get(saas_name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter;

    #[async_trait]
    impl SaasAdapter for NullAdapter {
        fn saas_name(&self) -> &str {
            "null"
        }

        async fn connect(&self, _credentials: SaasCredentials) -> Result<(), SaasError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), SaasError> {
            Ok(())
        }

        async fn health_check(&self) -> Result<bool, SaasError> {
            Ok(true)
        }

        async fn available_tools(&self) -> Result<Vec<ToolSpec>, SaasError> {
            Ok(vec![])
        }

        async fn execute_tool(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> Result<serde_json::Value, SaasError> {
            Err(SaasError::UnknownTool(name.to_owned()))
        }

        async fn schema(&self) -> Result<serde_json::Value, SaasError> {
            Ok(serde_json::json!({"objects": []}))
        }
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter));
        assert!(registry.get("null").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["null"]);
    }
}
