//! Spec stage: requirement text → structured Markdown specification.

use std::sync::Arc;

use crate::graph::StageError;
use crate::providers::router::Profile;
use crate::providers::{CompletionRequest, Message};
use crate::rules::load_rule;
use crate::runs::state::{RunDelta, RunState};
use crate::types::RunStatus;

use super::RunStageContext;

/// Built-in system prompt, used when no `spec_rules.md` overrides it.
/// The leading `## Purpose` and `## Conditions / Means` sections are
/// required; downstream tooling extracts them.
const SPEC_SYSTEM: &str = "You are a requirements analyst. Convert the user's loose \
instruction into a structured Markdown specification a developer can implement without \
guessing.\n\n\
Start by extracting the purpose and the conditions/means needed to achieve it, then \
complete the document. Output ONLY Markdown with these sections in this order:\n\
- ## Purpose (required)\n\
- ## Conditions / Means (required)\n\
- ## Overview\n\
- ## Functional Requirements (bulleted)\n\
- ## Non-functional Requirements (optional)\n\
- ## Data / API Outline (when relevant)\n\
- ## Screens / Flow Outline (when relevant)\n\
- ## Acceptance Criteria (recommended)\n\
No preamble, no commentary, just the document.";

/// Produce `spec_markdown` from the requirement using the quality profile.
pub async fn write_spec(
    ctx: Arc<RunStageContext>,
    state: RunState,
) -> Result<RunDelta, StageError> {
    let requirement = state.requirement.trim();
    if requirement.is_empty() {
        return Ok(RunDelta {
            spec_markdown: Some(String::new()),
            status: Some(RunStatus::SpecDone),
            ..Default::default()
        });
    }

    let rules_dir = ctx.rules_dir(&state);
    let spec_rules = load_rule(&rules_dir, "spec_rules", SPEC_SYSTEM);
    let stack_domain = load_rule(&rules_dir, "stack_domain_rules", "");
    let system_prompt = if stack_domain.trim().is_empty() {
        spec_rules
    } else {
        format!(
            "## Stack / domain constraints\n\n{}\n\n---\n\n{spec_rules}",
            stack_domain.trim()
        )
    };

    let request = CompletionRequest {
        messages: vec![Message::system(system_prompt), Message::user(requirement)],
        max_tokens: Some(4096),
    };
    let response = ctx
        .models
        .complete(Profile::Quality, request)
        .await
        .map_err(|e| StageError::Fatal(format!("spec generation failed: {e}")))?;

    let mut delta = RunDelta {
        spec_markdown: Some(response.content.trim().to_owned()),
        status: Some(RunStatus::SpecDone),
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        ..Default::default()
    };

    if state.emit_rule_improvements {
        let requirement_head: String = requirement.chars().take(500).collect();
        delta.rule_improvements.push((
            "spec_rules".to_owned(),
            format!(
                "# Spec phase: candidate rule additions\n\n\
                 ## This run's requirement (summary)\n{requirement_head}\n\n\
                 ## Suggested for spec_rules.md\n\
                 Consider adding a glossary or acceptance-criteria guidance when similar \
                 requirements recur.\n"
            ),
        ));
    }

    Ok(delta)
}
