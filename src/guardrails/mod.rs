//! Static and dynamic checks gating publication of generated artifacts.
//!
//! The secret scan and the row-level-security check are pure host-side
//! functions over the `{rel-path → text}` artifact set and run before any
//! code touches a sandbox. Lint/build, unit, and e2e checks are thin
//! wrappers over sandbox commands in [`sandbox_checks`]. Any failing check
//! produces findings for `error_logs` and a 16-character failure
//! fingerprint used to spot repeated identical failures.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

pub mod rls;
pub mod sandbox_checks;
pub mod secret_scan;

/// Individual findings are truncated at this many characters.
pub const MAX_FINDING_CHARS: usize = 2000;

/// Result of one guardrail check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub findings: Vec<String>,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            findings: Vec::new(),
        }
    }

    pub fn from_findings(findings: Vec<String>) -> Self {
        Self {
            passed: findings.is_empty(),
            findings,
        }
    }
}

/// Truncate a finding to [`MAX_FINDING_CHARS`].
pub fn clip_finding(finding: &str) -> String {
    finding.chars().take(MAX_FINDING_CHARS).collect()
}

/// 16-character SHA-256 prefix identifying a failure shape: the category
/// plus the first three findings joined by `|`.
pub fn failure_fingerprint(category: &str, findings: &[String]) -> String {
    let joined = findings
        .iter()
        .take(3)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha256::digest(format!("{category}:{joined}").as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

/// Total line count across the artifact set.
pub fn count_artifact_lines(artifacts: &BTreeMap<String, String>) -> usize {
    artifacts
        .values()
        .map(|content| content.lines().count())
        .sum()
}

/// Refuse artifact sets larger than `max_lines` total lines.
pub fn change_size_check(artifacts: &BTreeMap<String, String>, max_lines: usize) -> CheckResult {
    let lines = count_artifact_lines(artifacts);
    if lines > max_lines {
        CheckResult::from_findings(vec![format!(
            "Change exceeds {max_lines} lines ({lines} lines); split the task or reduce the scope"
        )])
    } else {
        CheckResult::pass()
    }
}
