//! Conditional routing through the public builder.

use std::time::Duration;

use millwright::graph::{GraphBuilder, GraphDeadlines, END};
use millwright::runs::state::initial_run_state;
use millwright::runs::{RunDelta, RunState};
use millwright::types::RunStatus;

fn deadlines() -> GraphDeadlines {
    GraphDeadlines {
        stage: Duration::from_secs(5),
        run: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn review_style_router_selects_by_status() {
    let graph = GraphBuilder::new()
        .stage("review", |_state: RunState| async {
            Ok(RunDelta {
                status: Some(RunStatus::ReviewOk),
                ..Default::default()
            })
        })
        .stage("publisher", |_state: RunState| async {
            Ok(RunDelta {
                status: Some(RunStatus::Published),
                ..Default::default()
            })
        })
        .stage("fix", |state: RunState| async move {
            Ok(RunDelta {
                retry_count: Some(state.retry_count.saturating_add(1)),
                ..Default::default()
            })
        })
        .entry("review")
        .conditional(
            "review",
            |state: &RunState| {
                if state.status == RunStatus::ReviewOk {
                    "publisher".to_owned()
                } else if state.retry_count < 3 {
                    "fix".to_owned()
                } else {
                    END.to_owned()
                }
            },
            &["publisher", "fix"],
        )
        .edge("fix", "review")
        .edge("publisher", END)
        .build(deadlines())
        .expect("build");

    let state = initial_run_state("t", "route me", ".", "rules", false, None, None);
    let final_state = graph.execute(state).await;
    assert_eq!(final_state.status, RunStatus::Published);
    assert_eq!(final_state.retry_count, 0);
}

#[tokio::test]
async fn undeclared_router_label_fails_the_run() {
    let graph = GraphBuilder::new()
        .stage("review", |_state: RunState| async { Ok(RunDelta::default()) })
        .stage("other", |_state: RunState| async { Ok(RunDelta::default()) })
        .entry("review")
        .conditional("review", |_state: &RunState| "elsewhere".to_owned(), &["other"])
        .edge("other", END)
        .build(deadlines())
        .expect("build");

    let state = initial_run_state("t", "route me", ".", "rules", false, None, None);
    let final_state = graph.execute(state).await;
    assert_eq!(final_state.status, RunStatus::Failed);
    assert!(final_state.error_logs.iter().any(|e| e.contains("elsewhere")));
}
