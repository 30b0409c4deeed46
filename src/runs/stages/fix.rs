//! Fix stage: turn recent errors into a coder instruction and count the
//! retry.

use std::sync::Arc;

use crate::graph::StageError;
use crate::rules::load_rule;
use crate::runs::state::{RunDelta, RunState};
use crate::types::RunStatus;

use super::RunStageContext;

/// How many trailing error-log entries feed the instruction.
const RECENT_ERRORS: usize = 10;

/// Compose `fix_instruction` from the error tail and bump `retry_count`.
pub async fn compose_fix(
    ctx: Arc<RunStageContext>,
    state: RunState,
) -> Result<RunDelta, StageError> {
    let fix_rules = load_rule(&ctx.rules_dir(&state), "fix_rules", "");

    let tail_start = state.error_logs.len().saturating_sub(RECENT_ERRORS);
    let error_block = std::iter::once("Fix the following errors:".to_owned())
        .chain(state.error_logs[tail_start..].iter().map(|e| format!("- {e}")))
        .collect::<Vec<_>>()
        .join("\n");

    let fix_instruction = if fix_rules.trim().is_empty() {
        error_block
    } else {
        format!("{}\n\n{error_block}", fix_rules.trim())
    };

    let mut delta = RunDelta {
        fix_instruction: Some(fix_instruction),
        retry_count: Some(state.retry_count.saturating_add(1)),
        status: Some(RunStatus::ReviewNg),
        ..Default::default()
    };

    if state.emit_rule_improvements {
        let preview_start = state.error_logs.len().saturating_sub(5);
        let preview = state.error_logs[preview_start..]
            .iter()
            .map(|e| format!("- {}", e.chars().take(200).collect::<String>()))
            .collect::<Vec<_>>()
            .join("\n");
        delta.rule_improvements.push((
            "fix_rules".to_owned(),
            format!(
                "# Fix phase: candidate rule additions\n\n\
                 ## Recent errors (last 5)\n{}\n\n\
                 ## Suggested for fix_rules.md\n\
                 If a pattern above recurs, document it under common errors and remedies.\n",
                if preview.is_empty() { "(none)" } else { &preview }
            ),
        ));
    }

    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphState;
    use crate::runs::state::initial_run_state;
    use crate::testing::{fixed_router, stage_context_with};

    #[tokio::test]
    async fn test_fix_increments_retry_and_includes_tail() {
        let ctx = stage_context_with(fixed_router("unused"));
        let mut state = initial_run_state("t", "req", ".", "rules", false, None, None);
        state.retry_count = 1;
        state.error_logs = (0..15).map(|i| format!("error-{i}")).collect();

        let delta = compose_fix(ctx, state.clone()).await.expect("fix");
        let mut state = state;
        state.apply(delta);
        assert_eq!(state.retry_count, 2);
        assert!(state.fix_instruction.contains("error-14"));
        assert!(state.fix_instruction.contains("error-5"));
        assert!(!state.fix_instruction.contains("error-4"), "only the last 10");
        assert_eq!(state.status, RunStatus::ReviewNg);
    }

    #[tokio::test]
    async fn test_fix_rules_prepended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = dir.path().join("rules");
        std::fs::create_dir_all(&rules).expect("mkdir");
        std::fs::write(rules.join("fix_rules.md"), "Prefer minimal diffs.\n").expect("write");

        let ctx = stage_context_with(fixed_router("unused"));
        let mut state = initial_run_state(
            "t",
            "req",
            &dir.path().display().to_string(),
            "rules",
            false,
            None,
            None,
        );
        state.error_logs = vec!["ruff: E501".to_owned()];

        let delta = compose_fix(ctx, state).await.expect("fix");
        let instruction = delta.fix_instruction.expect("instruction");
        assert!(instruction.starts_with("Prefer minimal diffs."));
        assert!(instruction.contains("- ruff: E501"));
    }
}
