//! Publisher stage: hand the reviewed artifacts to the version-control
//! adapter.
//!
//! Runs only after a green review. A publisher failure moves the run to
//! `failed` but the review outcome (and the host artifacts) stand.

use std::sync::Arc;

use tracing::{info, warn};

use crate::graph::StageError;
use crate::runs::state::{RunDelta, RunState};
use crate::types::RunStatus;
use crate::vcs::{sanitize_branch_name, VcsPublisher as _};

use super::RunStageContext;

/// Commit and push the artifact set, then open a merge request.
pub async fn publish(
    ctx: Arc<RunStageContext>,
    state: RunState,
) -> Result<RunDelta, StageError> {
    let requirement_head: String = state.requirement.chars().take(100).collect();
    let branch = format!("agent/{}", sanitize_branch_name(&requirement_head));
    let output_dir = ctx.output_dir(&state);

    let mut paths: Vec<std::path::PathBuf> = state
        .generated_code
        .keys()
        .map(|rel| output_dir.join(rel))
        .collect();
    for extra in ["spec.md", "report.html"] {
        let path = output_dir.join(extra);
        if path.exists() {
            paths.push(path);
        }
    }

    let commit_head: String = state.requirement.chars().take(72).collect();
    let commit_message = format!("Agent: {commit_head}");

    let publish_result = async {
        ctx.vcs.add_files(&paths).await?;
        ctx.vcs.commit(&commit_message).await?;
        ctx.vcs.push_to(&branch).await?;
        let title = format!("Agent: {}", state.requirement.chars().take(80).collect::<String>());
        let body = "Auto-generated change. Review the spec and diff before merging.";
        ctx.vcs.open_merge_request(&title, body, &branch).await
    }
    .await;

    let mut delta = match publish_result {
        Ok(mr_url) => {
            info!(run_id = %state.run_id, branch = %branch, "published");
            RunDelta {
                status: Some(RunStatus::Published),
                mr_url: Some(mr_url.unwrap_or_default()),
                ..Default::default()
            }
        }
        Err(e) => {
            warn!(run_id = %state.run_id, error = %e, "publish failed");
            RunDelta {
                status: Some(RunStatus::Failed),
                error_logs: vec![format!("publish failed: {e}")],
                ..Default::default()
            }
        }
    };

    if state.emit_rule_improvements && delta.status == Some(RunStatus::Published) {
        delta.rule_improvements.push((
            "publish_rules".to_owned(),
            format!(
                "# Publish phase: candidate rule additions\n\n\
                 ## This run\n- branch: {branch}\n\n\
                 ## Suggested for publish_rules.md\n\
                 Record a title/body template here if merge requests should follow one.\n"
            ),
        ));
    }

    Ok(delta)
}
