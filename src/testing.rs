//! Shared test doubles: scripted providers, a recording VCS publisher, and
//! ready-made stage contexts over the local workspace.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::{PipelineConfig, SandboxConfig};
use crate::providers::router::ModelRouter;
use crate::providers::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError, UsageStats};
use crate::runs::stages::RunStageContext;
use crate::sandbox::local::LocalWorkspaceFactory;
use crate::vcs::{VcsError, VcsPublisher};

/// Provider returning scripted replies in order; the last reply repeats.
pub struct ScriptedProvider {
    replies: Vec<String>,
    calls: AtomicUsize,
    /// When set, every call fails with this message instead.
    pub fail_with: Option<String>,
}

impl ScriptedProvider {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: replies.iter().map(|r| (*r).to_owned()).collect(),
            calls: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            replies: Vec::new(),
            calls: AtomicUsize::new(0),
            fail_with: Some(message.to_owned()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some(message) = &self.fail_with {
            return Err(ProviderError::Parse(message.clone()));
        }
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .get(index)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default();
        Ok(CompletionResponse {
            content: reply,
            usage: UsageStats {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "scripted".to_owned(),
        })
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Router serving one fixed reply from both profiles.
pub fn fixed_router(reply: &str) -> ModelRouter {
    let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(&[reply]));
    ModelRouter::new(provider.clone(), provider)
}

/// Router serving scripted replies, shared across both profiles.
pub fn scripted_router(replies: &[&str]) -> ModelRouter {
    let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(replies));
    ModelRouter::new(provider.clone(), provider)
}

/// Router whose every call fails.
pub fn failing_router(message: &str) -> ModelRouter {
    let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::failing(message));
    ModelRouter::new(provider.clone(), provider)
}

/// VCS publisher that records calls and succeeds.
#[derive(Default)]
pub struct RecordingVcs {
    pub commits: Mutex<Vec<String>>,
    pub pushes: Mutex<Vec<String>>,
    /// When set, every operation fails with this detail.
    pub fail_with: Option<String>,
    /// Merge-request URL returned on success.
    pub mr_url: Option<String>,
}

impl RecordingVcs {
    pub fn failing(detail: &str) -> Self {
        Self {
            fail_with: Some(detail.to_owned()),
            ..Default::default()
        }
    }

    pub fn with_mr_url(url: &str) -> Self {
        Self {
            mr_url: Some(url.to_owned()),
            ..Default::default()
        }
    }

    fn check(&self, command: &str) -> Result<(), VcsError> {
        match &self.fail_with {
            Some(detail) => Err(VcsError::Command {
                command: command.to_owned(),
                detail: detail.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VcsPublisher for RecordingVcs {
    async fn add_files(&self, _paths: &[std::path::PathBuf]) -> Result<(), VcsError> {
        self.check("add")
    }

    async fn commit(&self, message: &str) -> Result<(), VcsError> {
        self.check("commit")?;
        if let Ok(mut commits) = self.commits.lock() {
            commits.push(message.to_owned());
        }
        Ok(())
    }

    async fn push_to(&self, branch: &str) -> Result<(), VcsError> {
        self.check("push")?;
        if let Ok(mut pushes) = self.pushes.lock() {
            pushes.push(branch.to_owned());
        }
        Ok(())
    }

    async fn open_merge_request(
        &self,
        _title: &str,
        _body: &str,
        _branch: &str,
    ) -> Result<Option<String>, VcsError> {
        self.check("merge-request")?;
        Ok(self.mr_url.clone())
    }
}

/// Stage context over the local workspace with a given router.
pub fn stage_context_with(models: ModelRouter) -> Arc<RunStageContext> {
    stage_context_with_vcs(models, Arc::new(RecordingVcs::default()))
}

/// Stage context with an explicit VCS double.
pub fn stage_context_with_vcs(
    models: ModelRouter,
    vcs: Arc<dyn VcsPublisher>,
) -> Arc<RunStageContext> {
    Arc::new(RunStageContext {
        models,
        workspaces: Arc::new(LocalWorkspaceFactory),
        vcs,
        pipeline: PipelineConfig::default(),
        sandbox: SandboxConfig::default(),
    })
}
