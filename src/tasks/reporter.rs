//! Result reporter: per-operation outcomes → persisted summary.
//!
//! Tenant data minimization is the contract here: only counts, short
//! error strings, and a classified failure category leave the execution
//! stage. Raw SaaS responses are dropped.

use std::sync::Arc;

use crate::graph::StageError;
use crate::persist::tasks::ResultSummary;
use crate::types::{FailureCategory, TaskStatus};

use super::state::{OperationResult, TaskDelta, TaskState};
use super::TaskStageContext;

/// How many error strings survive into the summary.
const MAX_SUMMARY_ERRORS: usize = 10;

/// Length cap per summarized error string.
const MAX_ERROR_CHARS: usize = 200;

fn error_line(result: &OperationResult) -> String {
    let error = result.error.as_deref().unwrap_or("unknown error");
    let line = format!("{}: {error}", result.tool_name);
    line.chars().take(MAX_ERROR_CHARS).collect()
}

/// Build the summary, report, and terminal status.
pub async fn report_results(
    _ctx: Arc<TaskStageContext>,
    state: TaskState,
) -> Result<TaskDelta, StageError> {
    let results = &state.operation_results;

    if results.is_empty() {
        return Ok(TaskDelta {
            result_summary: Some(ResultSummary::default()),
            report_markdown: Some("No operations were executed.".to_owned()),
            status: Some(if state.status == TaskStatus::Failed {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            }),
            ..Default::default()
        });
    }

    let success_count = results.iter().filter(|r| r.success).count();
    let failure_count = results.len().saturating_sub(success_count);
    let errors: Vec<String> = results
        .iter()
        .filter(|r| !r.success)
        .take(MAX_SUMMARY_ERRORS)
        .map(error_line)
        .collect();

    let summary = ResultSummary {
        success_count,
        failure_count,
        total_operations: results.len(),
        errors: errors.clone(),
    };
    let report = build_report_markdown(results, &summary);

    let mut delta = TaskDelta {
        result_summary: Some(summary),
        report_markdown: Some(report),
        ..Default::default()
    };

    if failure_count == 0 {
        delta.status = Some(TaskStatus::Completed);
    } else {
        delta.status = Some(TaskStatus::Failed);
        delta.failure_reason = errors.first().cloned();
        delta.failure_category = Some(FailureCategory::classify(&errors));
    }

    Ok(delta)
}

fn build_report_markdown(results: &[OperationResult], summary: &ResultSummary) -> String {
    let mut lines = vec![
        "## Execution report".to_owned(),
        String::new(),
        format!("- Succeeded: {}", summary.success_count),
        format!("- Failed: {}", summary.failure_count),
        format!("- Total: {}", summary.total_operations),
        String::new(),
        "### Operations".to_owned(),
        String::new(),
    ];
    for result in results {
        if result.success {
            lines.push(format!("- [x] {}: ok", result.tool_name));
        } else {
            lines.push(format!("- [ ] {}: failed - {}", result.tool_name, error_line(result)));
        }
    }
    if !summary.errors.is_empty() {
        lines.push(String::new());
        lines.push("### Errors".to_owned());
        lines.push(String::new());
        for error in &summary.errors {
            lines.push(format!("- {error}"));
        }
    }
    lines.join("\n")
}
