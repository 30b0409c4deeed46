//! Two-phase run orchestration.
//!
//! Composes the stage set into three graphs -- full (auto-execute), phase 1
//! (through spec), phase 2 (implementation) -- and owns the persistence
//! choreography around them: the spec-review snapshot, resume, the final
//! run row, audit-log batches, the cost ceiling, and rule-improvement
//! capture. Graphs are compiled once and cached.

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::config::CostConfig;
use crate::cost;
use crate::graph::{Graph, GraphBuilder, GraphDeadlines, END};
use crate::persist::runs::RunUpsert;
use crate::persist::Database;
use crate::types::{AuditSource, RunStatus};

use super::stages::{classifier, coder, fix, publisher, review, spec, RunStageContext};
use super::state::{initial_run_state, RunState};

/// Inputs to a new run.
#[derive(Debug, Clone)]
pub struct StartRunParams {
    pub tenant_id: String,
    pub requirement: String,
    pub genre: Option<String>,
    pub emit_rule_improvements: bool,
    pub origin_event_id: Option<String>,
}

/// Orchestrates code-track runs over the shared services.
pub struct RunController {
    ctx: Arc<RunStageContext>,
    db: Database,
    cost: CostConfig,
    workspace_root: String,
    rules_dir: String,
    full_graph: OnceLock<Arc<Graph<RunState>>>,
    spec_graph: OnceLock<Arc<Graph<RunState>>>,
    impl_graph: OnceLock<Arc<Graph<RunState>>>,
}

impl RunController {
    pub fn new(
        ctx: Arc<RunStageContext>,
        db: Database,
        cost: CostConfig,
        workspace_root: String,
        rules_dir: String,
    ) -> Self {
        Self {
            ctx,
            db,
            cost,
            workspace_root,
            rules_dir,
            full_graph: OnceLock::new(),
            spec_graph: OnceLock::new(),
            impl_graph: OnceLock::new(),
        }
    }

    fn deadlines(&self) -> GraphDeadlines {
        GraphDeadlines {
            stage: self.ctx.pipeline.code_stage_timeout(),
            run: self.ctx.pipeline.run_timeout(),
        }
    }

    fn full_graph(&self) -> Arc<Graph<RunState>> {
        self.full_graph
            .get_or_init(|| Arc::new(build_full_graph(self.ctx.clone(), self.deadlines())))
            .clone()
    }

    fn spec_graph(&self) -> Arc<Graph<RunState>> {
        self.spec_graph
            .get_or_init(|| Arc::new(build_spec_graph(self.ctx.clone(), self.deadlines())))
            .clone()
    }

    fn impl_graph(&self) -> Arc<Graph<RunState>> {
        self.impl_graph
            .get_or_init(|| Arc::new(build_impl_graph(self.ctx.clone(), self.deadlines())))
            .clone()
    }

    /// Start a run. With `auto_execute` on, executes end-to-end and
    /// persists the outcome; with it off, runs phase 1 and pauses at
    /// `spec_review` with a persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error only for pre-flight failures; pipeline failures
    /// are expressed in the returned state's status.
    pub async fn start_run(&self, params: StartRunParams) -> anyhow::Result<RunState> {
        let auto_execute = match self.db.get_auto_execute(&params.tenant_id).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to read auto_execute; defaulting on");
                true
            }
        };

        let state = initial_run_state(
            &params.tenant_id,
            &params.requirement,
            &self.workspace_root,
            &self.rules_dir,
            params.emit_rule_improvements,
            params.genre.as_deref(),
            params.origin_event_id.as_deref(),
        );
        info!(run_id = %state.run_id, tenant = %params.tenant_id, auto_execute, "run started");

        if auto_execute {
            let mut final_state = self.full_graph().execute(state).await;
            self.finalize_status(&mut final_state);
            self.persist_outcome(&final_state).await;
            return Ok(final_state);
        }

        let mut paused = self.spec_graph().execute(state).await;
        if paused.status.is_terminal() {
            // Phase 1 died; there is nothing to review or resume.
            self.persist_outcome(&paused).await;
            return Ok(paused);
        }
        paused.status = RunStatus::SpecReview;
        self.persist_snapshot(&paused).await;
        Ok(paused)
    }

    /// Resume an awaiting-approval run: rehydrate the snapshot, clear it,
    /// mark the run `coding`, and execute phase 2.
    ///
    /// # Errors
    ///
    /// Returns an error when the run does not exist, is not in
    /// `spec_review`, or its snapshot cannot be decoded.
    pub async fn resume_run(&self, tenant_id: &str, run_id: &str) -> anyhow::Result<RunState> {
        let snapshot = self
            .db
            .load_snapshot(tenant_id, run_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("run {run_id} not found or not awaiting spec review")
            })?;
        let mut state: RunState =
            serde_json::from_value(snapshot).map_err(|e| anyhow::anyhow!("corrupt snapshot: {e}"))?;

        self.db
            .update_run_status(tenant_id, run_id, RunStatus::Coding, true)
            .await?;
        state.status = RunStatus::Coding;
        info!(run_id = %run_id, tenant = %tenant_id, "run resumed");

        let mut final_state = self.impl_graph().execute(state).await;
        self.finalize_status(&mut final_state);
        self.persist_outcome(&final_state).await;
        Ok(final_state)
    }

    /// Normalize terminal soft-failure states: a run that exhausted its
    /// fix loop ends `failed`, not `review_ng`.
    fn finalize_status(&self, state: &mut RunState) {
        if state.status == RunStatus::ReviewNg {
            state.status = RunStatus::Failed;
        }
    }

    /// Persist the run row, audit batch, cost check, and rule-improvement
    /// candidates. All best-effort: the in-memory outcome is authoritative.
    async fn persist_outcome(&self, state: &RunState) {
        if let Err(e) = self.db.persist_run(run_upsert(state, None)).await {
            warn!(run_id = %state.run_id, error = %e, "failed to persist run row");
        }

        if let Err(e) = self
            .db
            .persist_audit_logs(
                &state.run_id,
                &state.sandbox_audit_log,
                AuditSource::Sandbox,
                None,
            )
            .await
        {
            warn!(run_id = %state.run_id, error = %e, "failed to persist audit batch");
        }

        let (estimated, exceeded) = cost::check_budget(
            &self.cost,
            state.total_input_tokens,
            state.total_output_tokens,
        );
        if exceeded {
            warn!(
                run_id = %state.run_id,
                estimated_usd = estimated,
                ceiling_usd = self.cost.max_usd_per_run,
                "run exceeded its cost ceiling"
            );
        }

        if state.status == RunStatus::Published
            && state.emit_rule_improvements
            && !state.rule_improvements.is_empty()
        {
            let improvements: Vec<(String, String)> = state
                .rule_improvements
                .iter()
                .map(|(name, block)| (name.clone(), block.clone()))
                .collect();
            let genre = if state.genre.is_empty() {
                None
            } else {
                Some(state.genre.as_str())
            };
            if let Err(e) = self
                .db
                .save_pending_improvements(&state.run_id, &improvements, genre)
                .await
            {
                warn!(run_id = %state.run_id, error = %e, "failed to save rule improvements");
            }
        }
    }

    async fn persist_snapshot(&self, state: &RunState) {
        let snapshot = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "failed to serialize snapshot");
                return;
            }
        };
        if let Err(e) = self.db.persist_run(run_upsert(state, Some(snapshot))).await {
            warn!(run_id = %state.run_id, error = %e, "failed to persist snapshot row");
        }
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

fn run_upsert<'a>(state: &'a RunState, snapshot: Option<serde_json::Value>) -> RunUpsert<'a> {
    let requirement_summary: String = state.requirement.chars().take(500).collect();
    RunUpsert {
        run_id: &state.run_id,
        tenant_id: &state.tenant_id,
        requirement_summary: optional(&requirement_summary),
        spec_markdown: optional(&state.spec_markdown),
        status: state.status,
        retry_count: state.retry_count,
        last_error_signature: optional(&state.last_error_signature),
        error_logs: &state.error_logs,
        total_input_tokens: state.total_input_tokens,
        total_output_tokens: state.total_output_tokens,
        output_subdir: optional(&state.output_subdir),
        emit_rule_improvements: state.emit_rule_improvements,
        genre: optional(&state.genre),
        genre_subcategory: optional(&state.genre_subcategory),
        genre_override_reason: optional(&state.genre_override_reason),
        origin_event_id: optional(&state.origin_event_id),
        mr_url: optional(&state.mr_url),
        state_snapshot: snapshot,
    }
}

fn route_after_review(max_retry: u32) -> impl Fn(&RunState) -> String + Send + Sync {
    move |state: &RunState| {
        if state.status == RunStatus::ReviewOk {
            "publisher".to_owned()
        } else if state.status == RunStatus::ReviewNg && state.retry_count < max_retry {
            "fix".to_owned()
        } else {
            END.to_owned()
        }
    }
}

fn phase1_stages(
    builder: GraphBuilder<RunState>,
    ctx: &Arc<RunStageContext>,
) -> GraphBuilder<RunState> {
    let classify_ctx = ctx.clone();
    let spec_ctx = ctx.clone();
    builder
        .stage("classifier", move |state| {
            classifier::classify(classify_ctx.clone(), state)
        })
        .stage("spec", move |state| spec::write_spec(spec_ctx.clone(), state))
        .edge("classifier", "spec")
}

fn phase2_stages(
    builder: GraphBuilder<RunState>,
    ctx: &Arc<RunStageContext>,
) -> GraphBuilder<RunState> {
    let coder_ctx = ctx.clone();
    let review_ctx = ctx.clone();
    let fix_ctx = ctx.clone();
    let publish_ctx = ctx.clone();
    let max_retry = ctx.pipeline.max_retry;
    builder
        .stage("coder", move |state| coder::generate_code(coder_ctx.clone(), state))
        .stage("review_guardrails", move |state| {
            review::review_guardrails(review_ctx.clone(), state)
        })
        .stage("fix", move |state| fix::compose_fix(fix_ctx.clone(), state))
        .stage("publisher", move |state| {
            publisher::publish(publish_ctx.clone(), state)
        })
        .edge("coder", "review_guardrails")
        .conditional(
            "review_guardrails",
            route_after_review(max_retry),
            &["publisher", "fix"],
        )
        .edge("fix", "coder")
        .edge("publisher", END)
}

fn build_full_graph(ctx: Arc<RunStageContext>, deadlines: GraphDeadlines) -> Graph<RunState> {
    let builder = phase1_stages(GraphBuilder::new(), &ctx);
    let builder = phase2_stages(builder, &ctx)
        .edge("spec", "coder")
        .entry("classifier");
    builder
        .build(deadlines)
        .unwrap_or_else(|e| panic!("full run graph is miswired: {e}"))
}

fn build_spec_graph(ctx: Arc<RunStageContext>, deadlines: GraphDeadlines) -> Graph<RunState> {
    phase1_stages(GraphBuilder::new(), &ctx)
        .edge("spec", END)
        .entry("classifier")
        .build(deadlines)
        .unwrap_or_else(|e| panic!("spec graph is miswired: {e}"))
}

fn build_impl_graph(ctx: Arc<RunStageContext>, deadlines: GraphDeadlines) -> Graph<RunState> {
    phase2_stages(GraphBuilder::new(), &ctx)
        .entry("coder")
        .build(deadlines)
        .unwrap_or_else(|e| panic!("impl graph is miswired: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_router, stage_context_with_vcs, RecordingVcs};

    const SPEC_REPLY: &str = "## Purpose\nGreet.\n\n## Conditions / Means\nA script.";
    const CODER_REPLY: &str = "--- main.py ---\nprint('Hello World')\n";

    fn controller(
        dir: &tempfile::TempDir,
        db: Database,
        replies: &[&str],
        vcs: Arc<RecordingVcs>,
    ) -> RunController {
        let ctx = stage_context_with_vcs(scripted_router(replies), vcs);
        RunController::new(
            ctx,
            db,
            CostConfig::default(),
            dir.path().display().to_string(),
            "rules".to_owned(),
        )
    }

    fn params(tenant: &str) -> StartRunParams {
        StartRunParams {
            tenant_id: tenant.to_owned(),
            requirement: "print Hello World".to_owned(),
            genre: None,
            emit_rule_improvements: false,
            origin_event_id: None,
        }
    }

    #[tokio::test]
    async fn test_auto_run_publishes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open_in_memory().await.expect("db");
        let vcs = Arc::new(RecordingVcs::with_mr_url("https://git.example/mr/1"));
        let controller = controller(&dir, db.clone(), &[SPEC_REPLY, CODER_REPLY], vcs);

        let state = controller.start_run(params("tenant-a")).await.expect("run");
        assert_eq!(state.status, RunStatus::Published);
        assert!(state
            .generated_code
            .values()
            .any(|c| c.contains("Hello World")));
        assert!(state.total_input_tokens > 0);
        assert!(state.total_output_tokens > 0);

        let record = db
            .get_run("tenant-a", &state.run_id)
            .await
            .expect("get")
            .expect("persisted");
        assert_eq!(record.status, RunStatus::Published);
        assert!(!record.has_snapshot);
    }

    #[tokio::test]
    async fn test_spec_review_pause_and_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open_in_memory().await.expect("db");
        db.set_auto_execute("tenant-a", false).await.expect("settings");
        let vcs = Arc::new(RecordingVcs::default());
        let controller = controller(&dir, db.clone(), &[SPEC_REPLY, CODER_REPLY], vcs);

        let paused = controller.start_run(params("tenant-a")).await.expect("run");
        assert_eq!(paused.status, RunStatus::SpecReview);
        assert!(paused.generated_code.is_empty());

        let snapshot = db
            .load_snapshot("tenant-a", &paused.run_id)
            .await
            .expect("load")
            .expect("snapshot stored");
        assert_eq!(snapshot["spec_markdown"], SPEC_REPLY);

        let resumed = controller
            .resume_run("tenant-a", &paused.run_id)
            .await
            .expect("resume");
        assert_eq!(resumed.status, RunStatus::Published);

        // Snapshot is cleared after resume; a second resume must fail.
        assert!(db
            .load_snapshot("tenant-a", &paused.run_id)
            .await
            .expect("load")
            .is_none());
        assert!(controller
            .resume_run("tenant-a", &paused.run_id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_retry_cap_normalizes_to_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open_in_memory().await.expect("db");
        let vcs = Arc::new(RecordingVcs::default());
        // Coder always emits a secret; review always rejects.
        let secret_reply = "--- config.py ---\nAPI_KEY = \"sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"\n";
        let controller = controller(&dir, db.clone(), &[SPEC_REPLY, secret_reply], vcs);

        let state = controller.start_run(params("tenant-a")).await.expect("run");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.retry_count, 3);
        assert!(state.error_logs[0].starts_with("Secret Scan FAILED"));
        assert!(!state.last_error_signature.is_empty());
    }

    #[tokio::test]
    async fn test_resume_unknown_run_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open_in_memory().await.expect("db");
        let controller = controller(&dir, db, &[SPEC_REPLY], Arc::new(RecordingVcs::default()));
        assert!(controller.resume_run("tenant-a", "missing").await.is_err());
    }
}
