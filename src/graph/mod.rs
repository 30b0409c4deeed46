//! Directed-graph scheduler driving pipeline runs.
//!
//! A graph is a set of named stages over a shared state value. Each stage
//! receives a clone of the state and returns a delta; the scheduler merges
//! the delta back (scalars replace, lists append, counters add -- the
//! state's [`GraphState::apply`] defines the merge). Plain edges chain
//! stages; conditional edges route through a pure function of the state.
//! Routing to the [`END`] sentinel terminates the run.
//!
//! Two deadlines bound every execution: a per-stage deadline, converted
//! into a soft failure the router can recover from, and a per-run deadline
//! that dominates and returns the last-known state immediately.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Sentinel label terminating graph execution.
pub const END: &str = "__end__";

/// Errors surfaced while assembling a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A stage name was registered twice.
    #[error("duplicate stage: {0}")]
    DuplicateStage(String),
    /// An edge references a stage that was never registered.
    #[error("edge references unknown stage: {0}")]
    UnknownStage(String),
    /// `entry` was never called.
    #[error("entry stage not set")]
    MissingEntry,
}

/// Error returned by a stage worker.
///
/// Stages express recoverable outcomes (review failures, per-operation
/// errors) inside their delta; a `StageError` is reserved for
/// infrastructure failure that must not be retried in-loop.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Fatal(String),
}

/// Shared pipeline state driven by a [`Graph`].
///
/// Implementations must be plain data: cloneable, serializable where the
/// pipeline supports snapshots, and free of live handles, so that a state
/// captured at a pause point can be rehydrated losslessly.
pub trait GraphState: Clone + Send + Sync + 'static {
    /// Partial update returned by a stage. Applying an empty delta must
    /// leave the state unchanged; applying a list-bearing delta twice
    /// appends twice.
    type Delta: Send + 'static;

    /// Merge a stage's delta into the state.
    fn apply(&mut self, delta: Self::Delta);

    /// A stage deadline fired. Append a human-readable error and adopt the
    /// track's soft-failure status; the router sees the result.
    fn on_stage_timeout(&mut self, stage: &str, deadline: Duration);

    /// A stage reported a fatal infrastructure error.
    fn on_stage_failure(&mut self, stage: &str, error: &str);

    /// The whole-run deadline fired; the scheduler returns immediately.
    fn on_run_timeout(&mut self, deadline: Duration);

    /// A conditional router produced an undeclared label.
    fn on_bad_route(&mut self, stage: &str, label: &str);
}

type StageFuture<D> = Pin<Box<dyn Future<Output = Result<D, StageError>> + Send>>;
type StageFn<S> = Arc<dyn Fn(S) -> StageFuture<<S as GraphState>::Delta> + Send + Sync>;
type RouterFn<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

enum Edge<S: GraphState> {
    Plain(String),
    Conditional {
        router: RouterFn<S>,
        targets: HashSet<String>,
    },
}

/// Deadlines applied to a compiled graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphDeadlines {
    pub stage: Duration,
    pub run: Duration,
}

/// Assembles stages and edges into an executable [`Graph`].
pub struct GraphBuilder<S: GraphState> {
    stages: HashMap<String, StageFn<S>>,
    edges: HashMap<String, Edge<S>>,
    entry: Option<String>,
    duplicate: Option<String>,
}

impl<S: GraphState> Default for GraphBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: GraphState> GraphBuilder<S> {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            duplicate: None,
        }
    }

    /// Register a named stage. Registering a name twice fails at `build`.
    pub fn stage<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S::Delta, StageError>> + Send + 'static,
    {
        let stage_fn: StageFn<S> = Arc::new(move |state| -> StageFuture<S::Delta> {
            Box::pin(f(state))
        });
        let replaced = self.stages.insert(name.to_owned(), stage_fn);
        if replaced.is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name.to_owned());
        }
        self
    }

    /// Add a plain edge `from → to`. `to` may be [`END`].
    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges.insert(from.to_owned(), Edge::Plain(to.to_owned()));
        self
    }

    /// Add a conditional edge: after `from`, `router(state)` must return
    /// one of `targets` (or [`END`]). An undeclared label ends the run as
    /// a routing failure.
    pub fn conditional<R>(mut self, from: &str, router: R, targets: &[&str]) -> Self
    where
        R: Fn(&S) -> String + Send + Sync + 'static,
    {
        self.edges.insert(
            from.to_owned(),
            Edge::Conditional {
                router: Arc::new(router),
                targets: targets.iter().map(|t| (*t).to_owned()).collect(),
            },
        );
        self
    }

    /// Set the entry stage.
    pub fn entry(mut self, name: &str) -> Self {
        self.entry = Some(name.to_owned());
        self
    }

    /// Validate wiring and produce an executable graph.
    pub fn build(self, deadlines: GraphDeadlines) -> Result<Graph<S>, GraphError> {
        if let Some(name) = self.duplicate {
            return Err(GraphError::DuplicateStage(name));
        }
        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        if !self.stages.contains_key(&entry) {
            return Err(GraphError::UnknownStage(entry));
        }
        for (from, edge) in &self.edges {
            if !self.stages.contains_key(from) {
                return Err(GraphError::UnknownStage(from.clone()));
            }
            match edge {
                Edge::Plain(to) if to != END && !self.stages.contains_key(to) => {
                    return Err(GraphError::UnknownStage(to.clone()));
                }
                Edge::Conditional { targets, .. } => {
                    for target in targets {
                        if target != END && !self.stages.contains_key(target) {
                            return Err(GraphError::UnknownStage(target.clone()));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(Graph {
            stages: self.stages,
            edges: self.edges,
            entry,
            deadlines,
        })
    }
}

/// A compiled, executable stage graph.
pub struct Graph<S: GraphState> {
    stages: HashMap<String, StageFn<S>>,
    edges: HashMap<String, Edge<S>>,
    entry: String,
    deadlines: GraphDeadlines,
}

impl<S: GraphState> Graph<S> {
    /// Execute the graph from the entry stage and return the final state.
    ///
    /// One stage runs at a time in a spawned worker holding a clone of the
    /// state; the worker is aborted when its deadline fires, so an
    /// abandoned stage can never mutate the shared state. Stage timeouts
    /// become soft failures routed like any other state; the run deadline
    /// returns the last-known state immediately.
    pub async fn execute(&self, mut state: S) -> S {
        let run_deadline_at = tokio::time::Instant::now()
            .checked_add(self.deadlines.run)
            .unwrap_or_else(tokio::time::Instant::now);
        let mut current = self.entry.clone();

        while current != END {
            let Some(stage_fn) = self.stages.get(&current) else {
                // build() validates edges, so this only fires on a bug.
                state.on_stage_failure(&current, "stage not registered");
                break;
            };

            let now = tokio::time::Instant::now();
            if now >= run_deadline_at {
                state.on_run_timeout(self.deadlines.run);
                return state;
            }
            let remaining = run_deadline_at.saturating_duration_since(now);
            let budget = remaining.min(self.deadlines.stage);
            let run_budget_binds = budget < self.deadlines.stage;

            debug!(stage = %current, budget_secs = budget.as_secs(), "executing stage");
            let worker = tokio::spawn((stage_fn)(state.clone()));
            let abort = worker.abort_handle();

            match tokio::time::timeout(budget, worker).await {
                Ok(Ok(Ok(delta))) => state.apply(delta),
                Ok(Ok(Err(StageError::Fatal(message)))) => {
                    warn!(stage = %current, error = %message, "stage failed");
                    state.on_stage_failure(&current, &message);
                }
                Ok(Err(join_error)) => {
                    warn!(stage = %current, error = %join_error, "stage worker aborted");
                    state.on_stage_failure(&current, &format!("stage worker panicked: {join_error}"));
                }
                Err(_elapsed) => {
                    abort.abort();
                    if run_budget_binds {
                        state.on_run_timeout(self.deadlines.run);
                        return state;
                    }
                    warn!(stage = %current, deadline_secs = self.deadlines.stage.as_secs(), "stage timeout");
                    state.on_stage_timeout(&current, self.deadlines.stage);
                }
            }

            current = match self.edges.get(&current) {
                Some(Edge::Plain(next)) => next.clone(),
                Some(Edge::Conditional { router, targets }) => {
                    let label = router(&state);
                    if label == END || targets.contains(&label) {
                        label
                    } else {
                        warn!(stage = %current, label = %label, "router returned undeclared target");
                        state.on_bad_route(&current, &label);
                        END.to_owned()
                    }
                }
                None => END.to_owned(),
            };
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct TestState {
        visited: Vec<String>,
        errors: Vec<String>,
        status: String,
        retry: u32,
    }

    #[derive(Default)]
    struct TestDelta {
        visited: Vec<String>,
        errors: Vec<String>,
        status: Option<String>,
        retry: Option<u32>,
    }

    impl GraphState for TestState {
        type Delta = TestDelta;

        fn apply(&mut self, delta: TestDelta) {
            self.visited.extend(delta.visited);
            self.errors.extend(delta.errors);
            if let Some(status) = delta.status {
                self.status = status;
            }
            if let Some(retry) = delta.retry {
                self.retry = retry;
            }
        }

        fn on_stage_timeout(&mut self, _stage: &str, deadline: Duration) {
            self.errors
                .push(format!("Step timeout ({}s)", deadline.as_secs()));
            self.status = "soft_failed".to_owned();
        }

        fn on_stage_failure(&mut self, stage: &str, error: &str) {
            self.errors.push(format!("{stage}: {error}"));
            self.status = "failed".to_owned();
        }

        fn on_run_timeout(&mut self, deadline: Duration) {
            self.errors
                .push(format!("Total timeout ({}s)", deadline.as_secs()));
            self.status = "timeout".to_owned();
        }

        fn on_bad_route(&mut self, _stage: &str, label: &str) {
            self.errors.push(format!("bad route: {label}"));
            self.status = "failed".to_owned();
        }
    }

    fn visit(name: &'static str) -> impl Fn(TestState) -> StageFuture<TestDelta> + Send + Sync {
        move |_state| -> StageFuture<TestDelta> {
            Box::pin(async move {
                Ok(TestDelta {
                    visited: vec![name.to_owned()],
                    ..Default::default()
                })
            })
        }
    }

    fn deadlines() -> GraphDeadlines {
        GraphDeadlines {
            stage: Duration::from_secs(5),
            run: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_linear_execution_order() {
        let graph = GraphBuilder::new()
            .stage("a", visit("a"))
            .stage("b", visit("b"))
            .entry("a")
            .edge("a", "b")
            .edge("b", END)
            .build(deadlines())
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        assert_eq!(state.visited, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_conditional_routing() {
        let graph = GraphBuilder::new()
            .stage("check", |_s: TestState| async {
                Ok(TestDelta {
                    status: Some("ok".to_owned()),
                    ..Default::default()
                })
            })
            .stage("win", visit("win"))
            .stage("lose", visit("lose"))
            .entry("check")
            .conditional(
                "check",
                |s: &TestState| {
                    if s.status == "ok" {
                        "win".to_owned()
                    } else {
                        "lose".to_owned()
                    }
                },
                &["win", "lose"],
            )
            .edge("win", END)
            .edge("lose", END)
            .build(deadlines())
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        assert_eq!(state.visited, vec!["win"]);
    }

    #[tokio::test]
    async fn test_undeclared_route_fails_run() {
        let graph = GraphBuilder::new()
            .stage("check", visit("check"))
            .stage("other", visit("other"))
            .entry("check")
            .conditional("check", |_s: &TestState| "nowhere".to_owned(), &["other"])
            .edge("other", END)
            .build(deadlines())
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        assert_eq!(state.status, "failed");
        assert!(state.errors.iter().any(|e| e.contains("nowhere")));
        assert!(!state.visited.contains(&"other".to_owned()));
    }

    #[tokio::test]
    async fn test_stage_timeout_is_soft() {
        let graph = GraphBuilder::new()
            .stage("slow", |_s: TestState| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(TestDelta::default())
            })
            .stage("after", visit("after"))
            .entry("slow")
            .edge("slow", "after")
            .edge("after", END)
            .build(GraphDeadlines {
                stage: Duration::from_millis(50),
                run: Duration::from_secs(10),
            })
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        assert_eq!(state.status, "soft_failed");
        assert!(state.errors.iter().any(|e| e.starts_with("Step timeout")));
        // A stage timeout is soft: routing continues to the next stage.
        assert_eq!(state.visited, vec!["after"]);
    }

    #[tokio::test]
    async fn test_run_timeout_dominates() {
        let graph = GraphBuilder::new()
            .stage("slow", |_s: TestState| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(TestDelta::default())
            })
            .entry("slow")
            .edge("slow", END)
            .build(GraphDeadlines {
                stage: Duration::from_secs(60),
                run: Duration::from_millis(50),
            })
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        assert_eq!(state.status, "timeout");
        assert!(state.errors.iter().any(|e| e.starts_with("Total timeout")));
    }

    #[tokio::test]
    async fn test_fatal_stage_error() {
        let graph = GraphBuilder::new()
            .stage("boom", |_s: TestState| async {
                Err(StageError::Fatal("sandbox creation failed".to_owned()))
            })
            .entry("boom")
            .edge("boom", END)
            .build(deadlines())
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        assert_eq!(state.status, "failed");
        assert!(state.errors[0].contains("sandbox creation failed"));
    }

    #[tokio::test]
    async fn test_retry_loop_is_bounded() {
        const MAX_RETRY: u32 = 3;
        let graph = GraphBuilder::new()
            .stage("work", |_s: TestState| async {
                Ok(TestDelta {
                    status: Some("ng".to_owned()),
                    ..Default::default()
                })
            })
            .stage("fix", |s: TestState| async move {
                Ok(TestDelta {
                    visited: vec!["fix".to_owned()],
                    retry: Some(s.retry.saturating_add(1)),
                    ..Default::default()
                })
            })
            .entry("work")
            .conditional(
                "work",
                |s: &TestState| {
                    if s.retry < MAX_RETRY {
                        "fix".to_owned()
                    } else {
                        END.to_owned()
                    }
                },
                &["fix"],
            )
            .edge("fix", "work")
            .build(deadlines())
            .expect("build");

        let state = graph.execute(TestState::default()).await;
        let fix_count = state.visited.iter().filter(|v| *v == "fix").count();
        assert_eq!(fix_count, MAX_RETRY as usize);
        assert_eq!(state.retry, MAX_RETRY);
    }

    #[tokio::test]
    async fn test_empty_delta_is_identity() {
        let mut state = TestState {
            visited: vec!["a".to_owned()],
            errors: vec![],
            status: "ok".to_owned(),
            retry: 1,
        };
        let before = state.clone();
        state.apply(TestDelta::default());
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_list_delta_applied_twice_appends_twice() {
        let mut state = TestState::default();
        let make = || TestDelta {
            errors: vec!["e".to_owned()],
            ..Default::default()
        };
        state.apply(make());
        state.apply(make());
        assert_eq!(state.errors.len(), 2);
    }

    #[test]
    fn test_build_rejects_unknown_edge_target() {
        let result = GraphBuilder::new()
            .stage("a", visit("a"))
            .entry("a")
            .edge("a", "missing")
            .build(deadlines());
        assert!(matches!(result, Err(GraphError::UnknownStage(_))));
    }

    #[test]
    fn test_build_rejects_missing_entry() {
        let result = GraphBuilder::<TestState>::new().build(deadlines());
        assert!(matches!(result, Err(GraphError::MissingEntry)));
    }

    #[test]
    fn test_build_rejects_duplicate_stage() {
        let result = GraphBuilder::new()
            .stage("a", visit("a"))
            .stage("a", visit("a"))
            .entry("a")
            .edge("a", END)
            .build(deadlines());
        assert!(matches!(result, Err(GraphError::DuplicateStage(_))));
    }
}
