//! Scheduler deadline bounds, exercised through the public run-state type.

use std::time::Duration;

use millwright::graph::{GraphBuilder, GraphDeadlines, END};
use millwright::runs::state::initial_run_state;
use millwright::runs::RunDelta;
use millwright::types::RunStatus;

fn state() -> millwright::runs::RunState {
    initial_run_state("tenant-a", "sleepy requirement", ".", "rules", false, None, None)
}

#[tokio::test]
async fn stage_timeout_returns_within_deadline_plus_epsilon() {
    let graph = GraphBuilder::new()
        .stage("spec", |_state: millwright::runs::RunState| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(RunDelta::default())
        })
        .entry("spec")
        .edge("spec", END)
        .build(GraphDeadlines {
            stage: Duration::from_secs(1),
            run: Duration::from_secs(600),
        })
        .expect("build");

    let started = std::time::Instant::now();
    let final_state = graph.execute(state()).await;
    let elapsed = started.elapsed();

    assert!(
        elapsed <= Duration::from_secs(2),
        "scheduler must return within deadline + epsilon, took {elapsed:?}"
    );
    assert_eq!(final_state.status, RunStatus::ReviewNg);
    assert!(final_state
        .error_logs
        .iter()
        .any(|e| e == "Step timeout (1s)"));
}

#[tokio::test]
async fn run_deadline_dominates_stage_deadline() {
    let graph = GraphBuilder::new()
        .stage("spec", |_state: millwright::runs::RunState| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(RunDelta::default())
        })
        .entry("spec")
        .edge("spec", END)
        .build(GraphDeadlines {
            stage: Duration::from_secs(30),
            run: Duration::from_millis(200),
        })
        .expect("build");

    let started = std::time::Instant::now();
    let final_state = graph.execute(state()).await;

    assert!(started.elapsed() <= Duration::from_secs(2));
    assert_eq!(final_state.status, RunStatus::Timeout);
    assert!(final_state
        .error_logs
        .iter()
        .any(|e| e.starts_with("Total timeout")));
}

#[tokio::test]
async fn abandoned_worker_cannot_mutate_shared_state() {
    // The slow stage returns a delta after the deadline; the scheduler must
    // have abandoned the worker, so the delta is never applied.
    let graph = GraphBuilder::new()
        .stage("slow", |_state: millwright::runs::RunState| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(RunDelta {
                spec_markdown: Some("late write".to_owned()),
                ..Default::default()
            })
        })
        .stage("after", |_state: millwright::runs::RunState| async {
            Ok(RunDelta::default())
        })
        .entry("slow")
        .edge("slow", "after")
        .edge("after", END)
        .build(GraphDeadlines {
            stage: Duration::from_millis(50),
            run: Duration::from_secs(10),
        })
        .expect("build");

    let final_state = graph.execute(state()).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(final_state.spec_markdown.is_empty(), "late delta must be dropped");
}
