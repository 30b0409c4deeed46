//! Review stage: secret scan, sandboxed checks, change-size limit, and
//! host artifact output.
//!
//! Order matters: the secret scan runs host-side before any generated
//! byte reaches a sandbox, and a scan failure never opens one. The
//! sandboxed checks run lint/build → unit → e2e, skipping later stages on
//! the first failure. Only a fully green review writes the artifact set,
//! the spec copy, and the report into the host output directory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::graph::StageError;
use crate::guardrails::rls::run_rls_check;
use crate::guardrails::sandbox_checks::{
    run_e2e_test_check, run_lint_build_check, run_unit_test_check,
};
use crate::guardrails::secret_scan::run_secret_scan;
use crate::guardrails::{change_size_check, count_artifact_lines, failure_fingerprint, CheckResult};
use crate::runs::state::{RunDelta, RunState};
use crate::sandbox::{Workspace, WorkspaceFactory as _};
use crate::types::RunStatus;

use super::RunStageContext;

/// How many findings of a failing check land in `error_logs`.
const MAX_REPORTED_FINDINGS: usize = 5;

fn failure_delta(category: &str, mut findings: Vec<String>, prefix: Option<&str>) -> RunDelta {
    let signature = failure_fingerprint(category, &findings);
    findings.truncate(MAX_REPORTED_FINDINGS);
    let error_logs = match prefix {
        Some(prefix) => vec![format!("{prefix}{}", findings.join("; "))],
        None => findings,
    };
    RunDelta {
        error_logs,
        status: Some(RunStatus::ReviewNg),
        last_error_signature: Some(signature),
        ..Default::default()
    }
}

fn improvement_block(results: &[(&str, &CheckResult)], lines: usize, max_lines: usize) -> String {
    let mut text = String::from("# Review phase: candidate rule additions\n\n## This run's results\n");
    for (label, result) in results {
        text.push_str(&format!(
            "- {label}: {}\n",
            if result.passed { "OK" } else { "NG" }
        ));
    }
    text.push_str(&format!("- Change size: {lines} lines (limit {max_lines})\n"));
    for (label, result) in results {
        if !result.passed && !result.findings.is_empty() {
            text.push_str(&format!("\n### {label} findings\n"));
            for finding in result.findings.iter().take(5) {
                let clipped: String = finding.chars().take(300).collect();
                text.push_str(&format!("- {clipped}\n"));
            }
        }
    }
    text.push_str(
        "\n## Suggested for review_rules.md\n\
         If a pattern above recurs, add an exclusion policy or a check hint for it.\n",
    );
    text
}

async fn write_artifacts_to_sandbox(
    workspace: &dyn Workspace,
    artifacts: &BTreeMap<String, String>,
) -> Result<(), StageError> {
    for (path, content) in artifacts {
        workspace
            .write_file(path, content)
            .await
            .map_err(|e| StageError::Fatal(format!("sandbox write failed for {path}: {e}")))?;
    }
    Ok(())
}

fn write_host_artifacts(
    ctx: &RunStageContext,
    state: &RunState,
) -> Result<(), StageError> {
    let output_dir = ctx.output_dir(state);
    std::fs::create_dir_all(&output_dir)
        .map_err(|e| StageError::Fatal(format!("failed to create output dir: {e}")))?;

    for (rel, content) in &state.generated_code {
        let target = output_dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::Fatal(format!("failed to create {}: {e}", parent.display())))?;
        }
        std::fs::write(&target, content)
            .map_err(|e| StageError::Fatal(format!("failed to write {}: {e}", target.display())))?;
    }

    std::fs::write(output_dir.join("spec.md"), &state.spec_markdown)
        .map_err(|e| StageError::Fatal(format!("failed to write spec.md: {e}")))?;
    std::fs::write(output_dir.join("report.html"), build_report_html(state))
        .map_err(|e| StageError::Fatal(format!("failed to write report.html: {e}")))?;
    Ok(())
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Extract the purpose section (or the document head) from the spec.
pub fn extract_purpose_snippet(spec_markdown: &str, max_chars: usize) -> String {
    let spec = spec_markdown.trim();
    if spec.is_empty() {
        return String::new();
    }
    for heading in ["## Purpose", "## Overview", "## Conditions / Means"] {
        if let Some(start) = spec.find(heading) {
            let rest = &spec[start..];
            let end = rest[heading.len()..]
                .find("\n## ")
                .map(|offset| offset.saturating_add(heading.len()))
                .unwrap_or(rest.len());
            return rest[..end].trim().chars().take(max_chars).collect();
        }
    }
    spec.chars().take(max_chars).collect()
}

fn build_report_html(state: &RunState) -> String {
    let purpose = html_escape(&extract_purpose_snippet(&state.spec_markdown, 400))
        .replace('\n', "<br>\n");
    let file_rows: String = state
        .generated_code
        .keys()
        .map(|path| format!("    <li><code>{}</code></li>\n", html_escape(path)))
        .collect();
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n  <meta charset=\"utf-8\">\n  \
         <title>Run Report - {run_id}</title>\n</head>\n<body>\n  <h1>Run summary</h1>\n  \
         <p><strong>Run ID:</strong> {run_id}</p>\n  \
         <p><strong>Output directory:</strong> {subdir}</p>\n  <h2>Purpose</h2>\n  \
         <div>{purpose}</div>\n  <h2>Specification</h2>\n  <p><a href=\"spec.md\">spec.md</a></p>\n  \
         <h2>Generated files</h2>\n  <ul>\n{file_rows}  </ul>\n</body>\n</html>\n",
        run_id = html_escape(&state.run_id),
        subdir = html_escape(&state.output_subdir),
    )
}

/// Run the full review pipeline over the state's generated code.
pub async fn review_guardrails(
    ctx: Arc<RunStageContext>,
    state: RunState,
) -> Result<RunDelta, StageError> {
    let artifacts = &state.generated_code;

    // 1) Secret scan, host-side, before anything reaches a sandbox.
    let scan = run_secret_scan(artifacts);
    if !scan.passed {
        info!(run_id = %state.run_id, findings = scan.findings.len(), "secret scan failed");
        let mut delta = failure_delta("secret", scan.findings.clone(), Some("Secret Scan FAILED: "));
        if state.emit_rule_improvements {
            delta.rule_improvements.push((
                "review_rules".to_owned(),
                improvement_block(&[("Secret Scan", &scan)], 0, ctx.pipeline.max_lines_per_change),
            ));
        }
        return Ok(delta);
    }

    // 2) Row-level-security check for SQL artifacts, also host-side.
    let rls = run_rls_check(artifacts);
    if !rls.passed {
        return Ok(failure_delta("rls", rls.findings, None));
    }

    // 3) Sandboxed checks. Creation failure is fatal to the stage.
    let workspace = ctx
        .workspaces
        .open()
        .await
        .map_err(|e| StageError::Fatal(format!("sandbox creation failed: {e}")))?;

    let result = run_sandboxed_checks(&ctx, &state, workspace.as_ref()).await;
    let audit_log = workspace.audit_log();
    workspace.close().await;

    let mut delta = result?;
    delta.sandbox_audit_log = audit_log;

    // 4) Host artifacts only exist for a green review.
    if delta.status == Some(RunStatus::ReviewOk) {
        write_host_artifacts(&ctx, &state)?;
    }
    Ok(delta)
}

async fn run_sandboxed_checks(
    ctx: &RunStageContext,
    state: &RunState,
    workspace: &dyn Workspace,
) -> Result<RunDelta, StageError> {
    let artifacts = &state.generated_code;
    write_artifacts_to_sandbox(workspace, artifacts).await?;

    let lint = run_lint_build_check(workspace, artifacts)
        .await
        .map_err(|e| StageError::Fatal(format!("lint check failed to run: {e}")))?;
    if !lint.passed {
        warn!(run_id = %state.run_id, "lint/build check failed");
        return Ok(failure_delta("lint", lint.findings, None));
    }

    let unit = run_unit_test_check(
        workspace,
        artifacts,
        Duration::from_secs(ctx.sandbox.unit_test_timeout_seconds),
    )
    .await
    .map_err(|e| StageError::Fatal(format!("unit check failed to run: {e}")))?;
    if !unit.passed {
        warn!(run_id = %state.run_id, "unit tests failed");
        return Ok(failure_delta("unit", unit.findings, None));
    }

    let e2e = run_e2e_test_check(
        workspace,
        artifacts,
        Duration::from_secs(ctx.sandbox.e2e_test_timeout_seconds),
    )
    .await
    .map_err(|e| StageError::Fatal(format!("e2e check failed to run: {e}")))?;
    if !e2e.passed {
        warn!(run_id = %state.run_id, "e2e tests failed");
        return Ok(failure_delta("e2e", e2e.findings, None));
    }

    let lines = count_artifact_lines(artifacts);
    let size = change_size_check(artifacts, ctx.pipeline.max_lines_per_change);
    if !size.passed {
        return Ok(failure_delta("lines", size.findings, None));
    }

    info!(run_id = %state.run_id, lines, "review passed");
    let mut delta = RunDelta {
        status: Some(RunStatus::ReviewOk),
        ..Default::default()
    };
    if state.emit_rule_improvements {
        delta.rule_improvements.push((
            "review_rules".to_owned(),
            improvement_block(
                &[
                    ("Secret Scan", &CheckResult::pass()),
                    ("Lint/Build", &lint),
                    ("Unit Test", &unit),
                    ("E2E Test", &e2e),
                ],
                lines,
                ctx.pipeline.max_lines_per_change,
            ),
        ));
    }
    Ok(delta)
}
