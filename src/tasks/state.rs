//! SaaS-track pipeline state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::GraphState;
use crate::persist::tasks::{PlannedOperation, ResultSummary};
use crate::saas::ToolSpec;
use crate::types::{AuditRecord, FailureCategory, TaskStatus};

/// Outcome of one executed operation. Held in memory for the reporter;
/// only the derived summary is ever persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub tool_name: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Shared state of one SaaS task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub tenant_id: String,
    pub connection_id: String,
    pub saas_name: String,
    pub genre: String,
    pub description: String,
    pub dry_run: bool,
    pub status: TaskStatus,
    pub error_logs: Vec<String>,
    pub available_tools: Vec<ToolSpec>,
    pub plan_markdown: String,
    pub operations: Vec<PlannedOperation>,
    pub operation_results: Vec<OperationResult>,
    pub result_summary: Option<ResultSummary>,
    pub report_markdown: String,
    pub failure_reason: String,
    pub failure_category: Option<FailureCategory>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub audit_log: Vec<AuditRecord>,
}

/// Partial update returned by a SaaS-track stage.
#[derive(Debug, Default)]
pub struct TaskDelta {
    pub status: Option<TaskStatus>,
    /// Appended.
    pub error_logs: Vec<String>,
    pub plan_markdown: Option<String>,
    pub operations: Option<Vec<PlannedOperation>>,
    /// Appended.
    pub operation_results: Vec<OperationResult>,
    pub result_summary: Option<ResultSummary>,
    pub report_markdown: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Appended.
    pub audit_log: Vec<AuditRecord>,
}

impl GraphState for TaskState {
    type Delta = TaskDelta;

    fn apply(&mut self, delta: TaskDelta) {
        if let Some(status) = delta.status {
            self.status = status;
        }
        self.error_logs.extend(delta.error_logs);
        if let Some(plan) = delta.plan_markdown {
            self.plan_markdown = plan;
        }
        if let Some(operations) = delta.operations {
            self.operations = operations;
        }
        self.operation_results.extend(delta.operation_results);
        if let Some(summary) = delta.result_summary {
            self.result_summary = Some(summary);
        }
        if let Some(report) = delta.report_markdown {
            self.report_markdown = report;
        }
        if let Some(reason) = delta.failure_reason {
            self.failure_reason = reason;
        }
        if let Some(category) = delta.failure_category {
            self.failure_category = Some(category);
        }
        self.total_input_tokens = self.total_input_tokens.saturating_add(delta.input_tokens);
        self.total_output_tokens = self.total_output_tokens.saturating_add(delta.output_tokens);
        self.audit_log.extend(delta.audit_log);
    }

    fn on_stage_timeout(&mut self, _stage: &str, deadline: Duration) {
        self.error_logs
            .push(format!("Step timeout ({}s)", deadline.as_secs()));
        self.status = TaskStatus::Failed;
        self.failure_category = Some(FailureCategory::Timeout);
    }

    fn on_stage_failure(&mut self, stage: &str, error: &str) {
        self.error_logs.push(format!("{stage}: {error}"));
        self.status = TaskStatus::Failed;
    }

    fn on_run_timeout(&mut self, deadline: Duration) {
        self.error_logs
            .push(format!("Total timeout ({}s)", deadline.as_secs()));
        self.status = TaskStatus::Failed;
        self.failure_reason = format!("Total timeout ({}s)", deadline.as_secs());
        self.failure_category = Some(FailureCategory::Timeout);
    }

    fn on_bad_route(&mut self, stage: &str, label: &str) {
        self.error_logs
            .push(format!("{stage}: router returned undeclared target {label}"));
        self.status = TaskStatus::Failed;
    }
}

/// Build the initial state for a task about to be planned.
pub fn initial_task_state(
    record: &crate::persist::tasks::TaskRecord,
    available_tools: Vec<ToolSpec>,
) -> TaskState {
    TaskState {
        task_id: record.task_id.clone(),
        tenant_id: record.tenant_id.clone(),
        connection_id: record.connection_id.clone(),
        saas_name: record.saas_name.clone(),
        genre: record.genre.clone().unwrap_or_default(),
        description: record.description.clone(),
        dry_run: record.dry_run,
        status: record.status,
        error_logs: Vec::new(),
        available_tools,
        plan_markdown: record.plan_markdown.clone().unwrap_or_default(),
        operations: record.planned_operations.clone(),
        operation_results: Vec::new(),
        result_summary: None,
        report_markdown: String::new(),
        failure_reason: String::new(),
        failure_category: None,
        total_input_tokens: 0,
        total_output_tokens: 0,
        audit_log: Vec::new(),
    }
}
