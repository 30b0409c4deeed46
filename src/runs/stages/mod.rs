//! Code-track stages.
//!
//! Each stage is an async function `(context, state) → delta`. The
//! controller wires them into graphs; nothing here touches the scheduler
//! directly, which keeps every stage unit-testable with a mock provider
//! and a local workspace.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{PipelineConfig, SandboxConfig};
use crate::providers::router::ModelRouter;
use crate::sandbox::WorkspaceFactory;
use crate::vcs::VcsPublisher;

pub mod classifier;
pub mod coder;
pub mod fix;
pub mod publisher;
pub mod review;
pub mod spec;

/// Services and limits shared by the code-track stages.
pub struct RunStageContext {
    pub models: ModelRouter,
    pub workspaces: Arc<dyn WorkspaceFactory>,
    pub vcs: Arc<dyn VcsPublisher>,
    pub pipeline: PipelineConfig,
    pub sandbox: SandboxConfig,
}

impl RunStageContext {
    /// Rules directory for a run, resolved against its workspace root.
    pub(crate) fn rules_dir(&self, state: &super::state::RunState) -> PathBuf {
        PathBuf::from(&state.workspace_root).join(&state.rules_dir)
    }

    /// Host directory receiving the run's reviewed artifacts.
    pub(crate) fn output_dir(&self, state: &super::state::RunState) -> PathBuf {
        PathBuf::from(&state.workspace_root).join(&state.output_subdir)
    }
}

/// Extract a JSON object from LLM output, tolerating fenced code blocks
/// and prose around the object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    if let Ok(value) = serde_json::from_str(without_fence) {
        return Some(value);
    }

    // Fall back to the outermost braced span.
    let start = without_fence.find('{')?;
    let end = without_fence.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&without_fence[start..=end]).ok()
}
