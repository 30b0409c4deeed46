//! Task planner: natural-language instruction → ordered SaaS operation
//! plan.
//!
//! The quality profile produces a human-readable Markdown plan plus a
//! fenced-JSON operation list. The plan is then validated against the
//! operation rules before the task may enter `awaiting_approval`:
//! reads before writes, no delete operations, and at most the configured
//! operation cap.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::graph::StageError;
use crate::persist::tasks::PlannedOperation;
use crate::providers::router::Profile;
use crate::providers::{CompletionRequest, Message};
use crate::rules::{load_rule, load_saas_rule};
use crate::types::TaskStatus;

use super::state::{TaskDelta, TaskState};
use super::TaskStageContext;

const PLANNER_SYSTEM: &str = "You are a tenant's operations assistant. Produce a SaaS \
operation plan for the given instruction.\n\n\
Rules:\n\
1. Use only the advertised tools.\n\
2. Put data-reading (READ) operations before updating (WRITE) operations.\n\
3. Never include delete operations; recommend manual handling instead.\n\
4. Keep the plan minimal (1-10 steps).\n\
5. When past failures are listed, plan so they are not repeated.\n\n\
Output BOTH of the following:\n\
### 1. Execution plan (Markdown)\n\
Describe the steps for a human reviewer.\n\
### 2. Operation list (JSON)\n\
```json\n\
[{\"tool_name\": \"...\", \"arguments\": {\"...\": \"...\"}}]\n\
```";

/// How an operation touches tenant data, inferred from its tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Delete,
}

/// Classify a tool name. Deletion keywords dominate; read keywords are
/// matched on name fragments; everything else is a write.
pub fn operation_kind(tool_name: &str) -> OperationKind {
    let lowered = tool_name.to_lowercase();
    for keyword in ["delete", "remove", "destroy", "purge"] {
        if lowered.contains(keyword) {
            return OperationKind::Delete;
        }
    }
    for keyword in ["get", "list", "search", "read", "fetch", "describe", "query"] {
        if lowered.contains(keyword) {
            return OperationKind::Read;
        }
    }
    OperationKind::Write
}

/// Validate a plan against the operation rules. Returns all violations.
pub fn validate_plan(operations: &[PlannedOperation], max_operations: usize) -> Vec<String> {
    let mut violations = Vec::new();
    if operations.is_empty() {
        violations.push("plan contains no operations".to_owned());
        return violations;
    }
    if operations.len() > max_operations {
        violations.push(format!(
            "plan has {} operations (limit {max_operations})",
            operations.len()
        ));
    }

    let mut write_seen = false;
    for operation in operations {
        match operation_kind(&operation.tool_name) {
            OperationKind::Delete => violations.push(format!(
                "delete operation is not allowed: {}",
                operation.tool_name
            )),
            OperationKind::Read if write_seen => violations.push(format!(
                "read operation after a write: {} (reads must come first)",
                operation.tool_name
            )),
            OperationKind::Read => {}
            OperationKind::Write => write_seen = true,
        }
    }
    violations
}

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```")
            .unwrap_or_else(|e| panic!("invalid json-block pattern: {e}"))
    })
}

/// Split a planner response into the Markdown plan and the operation list.
pub fn parse_plan_response(response: &str) -> (String, Vec<PlannedOperation>) {
    let Some(caps) = json_block_re().captures(response) else {
        return (response.trim().to_owned(), Vec::new());
    };
    let operations: Vec<PlannedOperation> =
        serde_json::from_str(caps.get(1).map(|m| m.as_str()).unwrap_or("")).unwrap_or_default();
    let plan_end = caps.get(0).map(|m| m.start()).unwrap_or(response.len());
    (response[..plan_end].trim().to_owned(), operations)
}

/// Plan the task. Failures are expressed in the delta, not as stage
/// errors, so the task row records why planning failed.
pub async fn plan_task(ctx: Arc<TaskStageContext>, state: TaskState) -> Result<TaskDelta, StageError> {
    if state.description.trim().is_empty() {
        return Ok(TaskDelta {
            status: Some(TaskStatus::Failed),
            error_logs: vec!["planning error: task description is empty".to_owned()],
            failure_reason: Some("task description is empty".to_owned()),
            ..Default::default()
        });
    }

    let saas_rules_dir = ctx.rules_dir.join("saas");
    let general_rules = load_rule(&saas_rules_dir, "general_rules", "");
    let specific_rules = load_saas_rule(&ctx.rules_dir, &state.saas_name);
    let warnings = past_failure_warnings(&ctx, &state).await;

    let tools_text = if state.available_tools.is_empty() {
        "(tool list unavailable)".to_owned()
    } else {
        serde_json::to_string_pretty(&state.available_tools).unwrap_or_default()
    };

    let mut user_message = format!(
        "## Instruction\n{}\n\n## Target SaaS\n{}\n\n## Available tools\n{tools_text}\n",
        state.description, state.saas_name
    );
    if !general_rules.trim().is_empty() {
        user_message.push_str(&format!("\n## Common operation rules\n{general_rules}\n"));
    }
    if !specific_rules.trim().is_empty() {
        user_message.push_str(&format!(
            "\n## {} specific rules\n{specific_rules}\n",
            state.saas_name
        ));
    }
    if !warnings.is_empty() {
        user_message.push_str(&format!(
            "\n## Past failures (plan around these)\n{warnings}\n"
        ));
    }

    let request = CompletionRequest {
        messages: vec![Message::system(PLANNER_SYSTEM), Message::user(user_message)],
        max_tokens: Some(4096),
    };
    let response = match ctx.models.complete(Profile::Quality, request).await {
        Ok(response) => response,
        Err(e) => {
            return Ok(TaskDelta {
                status: Some(TaskStatus::Failed),
                error_logs: vec![format!("planning LLM error: {e}")],
                failure_reason: Some(format!("planning LLM error: {e}")),
                ..Default::default()
            });
        }
    };

    let (plan_markdown, operations) = parse_plan_response(&response.content);
    let mut delta = TaskDelta {
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        plan_markdown: Some(if plan_markdown.is_empty() {
            response.content.clone()
        } else {
            plan_markdown
        }),
        ..Default::default()
    };

    let violations = validate_plan(&operations, ctx.pipeline.max_operations_per_task);
    if !violations.is_empty() {
        warn!(task_id = %state.task_id, ?violations, "plan rejected");
        delta.status = Some(TaskStatus::Failed);
        delta.failure_reason = Some(violations.join("; "));
        delta
            .error_logs
            .extend(violations.into_iter().map(|v| format!("planning error: {v}")));
        return Ok(delta);
    }

    delta.operations = Some(operations);
    delta.status = Some(TaskStatus::AwaitingApproval);
    Ok(delta)
}

async fn past_failure_warnings(ctx: &TaskStageContext, state: &TaskState) -> String {
    let genre = if state.genre.is_empty() {
        None
    } else {
        Some(state.genre.as_str())
    };
    let failures = match ctx.db.get_similar_failures(&state.saas_name, genre, 5).await {
        Ok(failures) => failures,
        Err(e) => {
            warn!(error = %e, "failed to load failure warnings");
            return String::new();
        }
    };
    failures
        .iter()
        .map(|(description, reason, category)| {
            let head: String = description.chars().take(100).collect();
            format!("- [{category}] {reason} (task: {head})")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(tool: &str) -> PlannedOperation {
        PlannedOperation {
            tool_name: tool.to_owned(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn test_operation_kind() {
        assert_eq!(operation_kind("get_records"), OperationKind::Read);
        assert_eq!(operation_kind("list_apps"), OperationKind::Read);
        assert_eq!(operation_kind("create_record"), OperationKind::Write);
        assert_eq!(operation_kind("update_record"), OperationKind::Write);
        assert_eq!(operation_kind("delete_record"), OperationKind::Delete);
        assert_eq!(operation_kind("remove_member"), OperationKind::Delete);
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(!validate_plan(&[], 10).is_empty());
    }

    #[test]
    fn test_validate_rejects_deletes() {
        let violations = validate_plan(&[op("get_apps"), op("delete_record")], 10);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("delete"));
    }

    #[test]
    fn test_validate_rejects_read_after_write() {
        let violations = validate_plan(&[op("create_record"), op("get_records")], 10);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("reads must come first"));
    }

    #[test]
    fn test_validate_accepts_reads_then_writes() {
        let plan = [op("get_apps"), op("get_records"), op("create_record")];
        assert!(validate_plan(&plan, 10).is_empty());
    }

    #[test]
    fn test_validate_enforces_cap() {
        let plan: Vec<PlannedOperation> = (0..11).map(|i| op(&format!("get_{i}"))).collect();
        let violations = validate_plan(&plan, 10);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("limit 10"));
    }

    #[test]
    fn test_parse_plan_response() {
        let response = "## Plan\n1. Fetch apps\n2. Fetch records\n\n```json\n[\n  {\"tool_name\": \"get_apps\", \"arguments\": {}},\n  {\"tool_name\": \"get_records\", \"arguments\": {\"app\": 1}}\n]\n```\n";
        let (plan, operations) = parse_plan_response(response);
        assert!(plan.starts_with("## Plan"));
        assert!(!plan.contains("```json"));
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[1].tool_name, "get_records");
    }

    #[test]
    fn test_parse_plan_without_json() {
        let (plan, operations) = parse_plan_response("I cannot plan this.");
        assert_eq!(plan, "I cannot plan this.");
        assert!(operations.is_empty());
    }
}
