//! Failure-pattern learning: recurring failures → drafted rule candidates.
//!
//! When a task ends `failed`, the controller asks this module whether any
//! normalized `(saas, category, reason)` pattern has crossed the
//! threshold. New patterns get a short rule addition drafted by the cost
//! profile and stored as a pending rule change against the per-SaaS rule
//! document. Only the anonymized pattern leaves this step -- no task body,
//! no tenant data.

use tracing::{info, warn};

use crate::persist::tasks::FailurePattern;
use crate::providers::router::{ModelRouter, Profile};
use crate::providers::{CompletionRequest, Message};

use super::TaskStageContext;

const RULE_DRAFT_SYSTEM: &str = "You write operational guardrail rules for SaaS \
automation. Given a recurring failure pattern, produce one Markdown section:\n\
- a heading line starting with ##\n\
- two or three bullet points of concrete guidance\n\
Do not include tenant names or any concrete data; the pattern is anonymized and the \
rule must stay that way.";

/// Scan failure patterns for a SaaS and draft rules for new ones.
///
/// Returns the ids of the rule-change rows created.
pub async fn check_and_generate_rules(
    ctx: &TaskStageContext,
    saas_name: Option<&str>,
    threshold: i64,
) -> Vec<String> {
    let patterns = match ctx.db.get_failure_patterns(saas_name, threshold).await {
        Ok(patterns) => patterns,
        Err(e) => {
            warn!(error = %e, "failed to aggregate failure patterns");
            return Vec::new();
        }
    };

    let mut created = Vec::new();
    for pattern in patterns {
        let rule_name = format!("saas_{}", pattern.saas_name);
        match ctx
            .db
            .rule_candidate_exists(&rule_name, &pattern.failure_category, &pattern.failure_reason)
            .await
        {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "rule candidate lookup failed");
                continue;
            }
        }

        let Some(rule_text) = draft_rule(&ctx.models, &pattern).await else {
            continue;
        };

        let run_id = format!(
            "auto_learning_{}_{}",
            pattern.saas_name, pattern.failure_category
        );
        let improvements = vec![(rule_name.clone(), rule_text)];
        match ctx
            .db
            .save_pending_improvements(&run_id, &improvements, pattern.genre.as_deref())
            .await
        {
            Ok(ids) => {
                info!(
                    saas = %pattern.saas_name,
                    category = %pattern.failure_category,
                    count = pattern.count,
                    "rule candidate generated"
                );
                created.extend(ids);
            }
            Err(e) => warn!(error = %e, "failed to save rule candidate"),
        }
    }
    created
}

async fn draft_rule(models: &ModelRouter, pattern: &FailurePattern) -> Option<String> {
    let prompt = format!(
        "## Failure pattern\n\
         - SaaS: {}\n\
         - Category: {}\n\
         - Reason: {}\n\
         - Occurrences: {}\n\n\
         Write the rule section now.",
        pattern.saas_name, pattern.failure_category, pattern.failure_reason, pattern.count
    );
    let request = CompletionRequest {
        messages: vec![Message::system(RULE_DRAFT_SYSTEM), Message::user(prompt)],
        max_tokens: Some(512),
    };
    match models.complete(Profile::Cost, request).await {
        Ok(response) if !response.content.trim().is_empty() => {
            Some(response.content.trim().to_owned())
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "rule drafting call failed");
            None
        }
    }
}
