//! Lint/build, unit-test, and e2e-test wrappers over sandbox commands.
//!
//! Each wrapper inspects the artifact set for the relevant toolchain and
//! passes vacuously when it is absent -- a missing linter is not a review
//! failure. Findings are clipped to the shared guardrail limit.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::sandbox::{ExecOutcome, SandboxError, Workspace};

use super::{clip_finding, CheckResult};

fn has_python(artifacts: &BTreeMap<String, String>) -> bool {
    artifacts.keys().any(|p| p.ends_with(".py"))
}

fn has_node(artifacts: &BTreeMap<String, String>) -> bool {
    artifacts.keys().any(|p| p == "package.json" || p.ends_with("/package.json"))
}

fn package_scripts(artifacts: &BTreeMap<String, String>) -> Vec<String> {
    let Some(content) = artifacts
        .iter()
        .find(|(p, _)| *p == "package.json" || p.ends_with("/package.json"))
        .map(|(_, c)| c)
    else {
        return Vec::new();
    };
    serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|pkg| {
            pkg.get("scripts").and_then(|s| {
                s.as_object()
                    .map(|o| o.iter().map(|(k, v)| format!("{k} {}", v.as_str().unwrap_or(""))).collect())
            })
        })
        .unwrap_or_default()
}

/// Whether the outcome means "toolchain not installed" rather than "check
/// failed". Missing tools make the check pass vacuously.
fn toolchain_missing(outcome: &ExecOutcome) -> bool {
    let text = outcome.failure_text().to_lowercase();
    outcome.exit_code.is_none() && !outcome.timed_out
        || text.contains("not found")
        || text.contains("no such file")
}

fn failure_finding(label: &str, outcome: &ExecOutcome) -> String {
    if outcome.timed_out {
        return format!("{label}: timed out");
    }
    clip_finding(&format!("{label}: {}", outcome.failure_text().trim()))
}

async fn run_check(
    workspace: &dyn Workspace,
    label: &str,
    argv: &[&str],
    deadline: Duration,
) -> Result<Option<String>, SandboxError> {
    let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
    let outcome = workspace.run_command(&argv, deadline).await?;
    if outcome.success() || toolchain_missing(&outcome) {
        Ok(None)
    } else {
        Ok(Some(failure_finding(label, &outcome)))
    }
}

/// Lint/build check: `ruff check .` for Python, `npm run build` for Node.
pub async fn run_lint_build_check(
    workspace: &dyn Workspace,
    artifacts: &BTreeMap<String, String>,
) -> Result<CheckResult, SandboxError> {
    let mut findings = Vec::new();

    if has_python(artifacts) {
        if let Some(finding) =
            run_check(workspace, "ruff", &["ruff", "check", "."], Duration::from_secs(120)).await?
        {
            findings.push(finding);
        }
    }
    if has_node(artifacts) && package_scripts(artifacts).iter().any(|s| s.starts_with("build ")) {
        if let Some(finding) = run_check(
            workspace,
            "npm run build",
            &["npm", "run", "build"],
            Duration::from_secs(180),
        )
        .await?
        {
            findings.push(finding);
        }
    }

    Ok(CheckResult::from_findings(findings))
}

/// Unit-test check: `pytest` for Python, `npm run test` when declared.
pub async fn run_unit_test_check(
    workspace: &dyn Workspace,
    artifacts: &BTreeMap<String, String>,
    deadline: Duration,
) -> Result<CheckResult, SandboxError> {
    let mut findings = Vec::new();

    if has_python(artifacts) {
        let argv: Vec<String> = ["pytest", "-q", "--tb=short"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let outcome = workspace.run_command(&argv, deadline).await?;
        // Exit code 5 is pytest's "no tests collected" -- vacuous pass.
        let vacuous = toolchain_missing(&outcome) || outcome.exit_code == Some(5);
        if !outcome.success() && !vacuous {
            findings.push(failure_finding("pytest", &outcome));
        }
    }
    if has_node(artifacts) {
        let scripts = package_scripts(artifacts);
        let script = if scripts.iter().any(|s| s.starts_with("test ")) {
            Some("test")
        } else if scripts.iter().any(|s| s.starts_with("test:unit ")) {
            Some("test:unit")
        } else {
            None
        };
        if let Some(script) = script {
            if let Some(finding) =
                run_check(workspace, "npm test", &["npm", "run", script], deadline).await?
            {
                findings.push(finding);
            }
        }
    }

    Ok(CheckResult::from_findings(findings))
}

/// End-to-end check: `npx playwright test` when a Playwright config or
/// script is present in the artifact set.
pub async fn run_e2e_test_check(
    workspace: &dyn Workspace,
    artifacts: &BTreeMap<String, String>,
    deadline: Duration,
) -> Result<CheckResult, SandboxError> {
    let has_config = artifacts.keys().any(|p| {
        p.ends_with("playwright.config.ts")
            || p.ends_with("playwright.config.js")
            || p.ends_with("playwright.config.mjs")
    });
    let has_script = package_scripts(artifacts)
        .iter()
        .any(|s| s.to_lowercase().contains("playwright"));

    if !has_config && !has_script {
        return Ok(CheckResult::pass());
    }

    let finding = run_check(
        workspace,
        "playwright",
        &["npx", "playwright", "test"],
        deadline,
    )
    .await?;
    Ok(CheckResult::from_findings(finding.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::local::LocalWorkspace;

    fn artifacts(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_toolchain_detection() {
        assert!(has_python(&artifacts(&[("main.py", "")])));
        assert!(!has_python(&artifacts(&[("main.rs", "")])));
        assert!(has_node(&artifacts(&[("package.json", "{}")])));
    }

    #[test]
    fn test_package_scripts_parsed() {
        let set = artifacts(&[(
            "package.json",
            r#"{"scripts": {"build": "tsc", "test": "vitest"}}"#,
        )]);
        let scripts = package_scripts(&set);
        assert!(scripts.iter().any(|s| s.starts_with("build ")));
        assert!(scripts.iter().any(|s| s.starts_with("test ")));
    }

    #[test]
    fn test_toolchain_missing_detection() {
        let spawn_failed = ExecOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr: "failed to spawn ruff: No such file or directory".to_owned(),
            timed_out: false,
            duration: Duration::from_millis(1),
        };
        assert!(toolchain_missing(&spawn_failed));

        let real_failure = ExecOutcome {
            exit_code: Some(1),
            stdout: "E501 line too long".to_owned(),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::from_millis(1),
        };
        assert!(!toolchain_missing(&real_failure));
    }

    #[tokio::test]
    async fn test_no_toolchain_passes_vacuously() {
        let ws = LocalWorkspace::open().expect("open");
        let set = artifacts(&[("readme.md", "# docs only")]);
        let lint = run_lint_build_check(&ws, &set).await.expect("lint");
        assert!(lint.passed);
        let unit = run_unit_test_check(&ws, &set, Duration::from_secs(5))
            .await
            .expect("unit");
        assert!(unit.passed);
        let e2e = run_e2e_test_check(&ws, &set, Duration::from_secs(5))
            .await
            .expect("e2e");
        assert!(e2e.passed);
    }
}
