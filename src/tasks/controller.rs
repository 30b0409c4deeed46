//! Two-phase SaaS task orchestration.
//!
//! Phase 1 plans the task and parks it at `awaiting_approval`; phase 2
//! runs only after an explicit approval, then persists the summary -- and
//! nothing else -- of what happened. Terminal failures feed the learning
//! loop.

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::graph::{Graph, GraphBuilder, GraphDeadlines, END};
use crate::persist::audit::SaasAuditContext;
use crate::persist::tasks::TaskRecord;
use crate::saas::SaasAdapter as _;
use crate::types::{AuditSource, FailureCategory, TaskStatus};

use super::state::{initial_task_state, TaskState};
use super::{executor, learning, planner, reporter, TaskStageContext};

/// Inputs to a new task.
#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub tenant_id: String,
    pub connection_id: String,
    pub description: String,
    pub saas_name: String,
    pub genre: Option<String>,
    pub dry_run: bool,
}

/// Orchestrates SaaS tasks over the shared services.
pub struct TaskController {
    ctx: Arc<TaskStageContext>,
    rule_threshold: i64,
    plan_graph: OnceLock<Arc<Graph<TaskState>>>,
    exec_graph: OnceLock<Arc<Graph<TaskState>>>,
}

impl TaskController {
    pub fn new(ctx: Arc<TaskStageContext>, rule_threshold: i64) -> Self {
        Self {
            ctx,
            rule_threshold,
            plan_graph: OnceLock::new(),
            exec_graph: OnceLock::new(),
        }
    }

    fn deadlines(&self) -> GraphDeadlines {
        GraphDeadlines {
            stage: self.ctx.pipeline.saas_stage_timeout(),
            run: self.ctx.pipeline.run_timeout(),
        }
    }

    fn plan_graph(&self) -> Arc<Graph<TaskState>> {
        self.plan_graph
            .get_or_init(|| {
                let ctx = self.ctx.clone();
                let graph = GraphBuilder::new()
                    .stage("planner", move |state| planner::plan_task(ctx.clone(), state))
                    .edge("planner", END)
                    .entry("planner")
                    .build(self.deadlines())
                    .unwrap_or_else(|e| panic!("plan graph is miswired: {e}"));
                Arc::new(graph)
            })
            .clone()
    }

    fn exec_graph(&self) -> Arc<Graph<TaskState>> {
        self.exec_graph
            .get_or_init(|| {
                let exec_ctx = self.ctx.clone();
                let report_ctx = self.ctx.clone();
                let graph = GraphBuilder::new()
                    .stage("executor", move |state| {
                        executor::execute_operations(exec_ctx.clone(), state)
                    })
                    .stage("reporter", move |state| {
                        reporter::report_results(report_ctx.clone(), state)
                    })
                    .edge("executor", "reporter")
                    .edge("reporter", END)
                    .entry("executor")
                    .build(self.deadlines())
                    .unwrap_or_else(|e| panic!("exec graph is miswired: {e}"));
                Arc::new(graph)
            })
            .clone()
    }

    /// Create a task and run phase 1. On a valid plan the task ends in
    /// `awaiting_approval`; otherwise the planning failure is recorded.
    ///
    /// # Errors
    ///
    /// Returns an error for storage failures; planning failures are
    /// recorded on the returned task.
    pub async fn create_and_plan(&self, params: CreateTaskParams) -> anyhow::Result<TaskRecord> {
        let record = self
            .ctx
            .db
            .create_task(
                &params.tenant_id,
                &params.connection_id,
                &params.description,
                &params.saas_name,
                params.genre.as_deref(),
                params.dry_run,
            )
            .await?;
        info!(task_id = %record.task_id, tenant = %params.tenant_id, "task created");
        self.plan_existing(record).await
    }

    async fn plan_existing(&self, record: TaskRecord) -> anyhow::Result<TaskRecord> {
        let available_tools = match self.ctx.adapters.get(&record.saas_name) {
            Some(adapter) => match adapter.available_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(saas = %record.saas_name, error = %e, "tool listing failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let state = initial_task_state(&record, available_tools);
        let final_state = self.plan_graph().execute(state).await;

        if final_state.status == TaskStatus::AwaitingApproval {
            self.ctx
                .db
                .save_plan(
                    &record.tenant_id,
                    &record.task_id,
                    &final_state.plan_markdown,
                    &final_state.operations,
                )
                .await?;
        } else {
            let reason = if final_state.failure_reason.is_empty() {
                "planning failed".to_owned()
            } else {
                final_state.failure_reason.clone()
            };
            let detail = final_state.error_logs.join("\n");
            self.ctx
                .db
                .record_failure(
                    &record.tenant_id,
                    &record.task_id,
                    &reason,
                    final_state.failure_category.unwrap_or(FailureCategory::Unknown),
                    if detail.is_empty() { None } else { Some(&detail) },
                )
                .await?;
        }

        self.ctx
            .db
            .get_task(&record.tenant_id, &record.task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task vanished during planning"))
    }

    /// Approve an awaiting task and execute its frozen plan.
    ///
    /// # Errors
    ///
    /// Returns an error when the task is not awaiting approval or storage
    /// fails; execution failures are recorded on the returned task.
    pub async fn approve_and_execute(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> anyhow::Result<TaskRecord> {
        self.ctx.db.approve_task(tenant_id, task_id).await?;
        let record = self
            .ctx
            .db
            .get_task(tenant_id, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

        let state = initial_task_state(&record, Vec::new());
        let started = std::time::Instant::now();
        let final_state = self.exec_graph().execute(state).await;
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        // Audit batch is best-effort: a logging problem never fails the task.
        let audit_context = SaasAuditContext {
            tenant_id: record.tenant_id.clone(),
            saas_name: record.saas_name.clone(),
            connection_id: record.connection_id.clone(),
            genre: record.genre.clone(),
        };
        if let Err(e) = self
            .ctx
            .db
            .persist_audit_logs(
                &record.task_id,
                &final_state.audit_log,
                AuditSource::Saas,
                Some(&audit_context),
            )
            .await
        {
            warn!(task_id = %record.task_id, error = %e, "failed to persist audit batch");
        }

        let status = if final_state.status == TaskStatus::Completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let summary = final_state.result_summary.clone().unwrap_or_default();
        self.ctx
            .db
            .save_result(
                tenant_id,
                task_id,
                &summary,
                &final_state.report_markdown,
                duration_ms,
                status,
            )
            .await?;

        if status == TaskStatus::Failed {
            let reason = if final_state.failure_reason.is_empty() {
                final_state
                    .error_logs
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_owned())
            } else {
                final_state.failure_reason.clone()
            };
            self.ctx
                .db
                .record_failure(
                    tenant_id,
                    task_id,
                    &reason,
                    final_state.failure_category.unwrap_or(FailureCategory::Unknown),
                    None,
                )
                .await?;

            let created = learning::check_and_generate_rules(
                &self.ctx,
                Some(&record.saas_name),
                self.rule_threshold,
            )
            .await;
            if !created.is_empty() {
                info!(task_id = %task_id, rules = created.len(), "learning drafted rule candidates");
            }
        }

        self.ctx
            .db
            .get_task(tenant_id, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task vanished during execution"))
    }

    /// Reject an awaiting task.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn reject(&self, tenant_id: &str, task_id: &str) -> anyhow::Result<()> {
        self.ctx.db.reject_task(tenant_id, task_id).await
    }

    /// Reset a finished task back to planning and re-plan it.
    ///
    /// # Errors
    ///
    /// Returns an error when the task does not exist or storage fails.
    pub async fn retry(&self, tenant_id: &str, task_id: &str) -> anyhow::Result<TaskRecord> {
        self.ctx.db.reset_task_for_retry(tenant_id, task_id).await?;
        let record = self
            .ctx
            .db
            .get_task(tenant_id, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
        self.plan_existing(record).await
    }
}
