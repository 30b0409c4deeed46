//! Code-track pipeline state.
//!
//! [`RunState`] is plain serde data -- no handles, no closures -- so the
//! whole value can be serialized at the spec-review checkpoint and
//! rehydrated losslessly on resume. Stages return a [`RunDelta`]; the
//! merge rule is scalars-replace, lists-append, counters-add.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::GraphState;
use crate::types::{AuditRecord, RunStatus};

/// Shared state of one code-track run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub tenant_id: String,
    pub requirement: String,
    pub spec_markdown: String,
    pub generated_code: BTreeMap<String, String>,
    pub error_logs: Vec<String>,
    pub retry_count: u32,
    pub status: RunStatus,
    pub fix_instruction: String,
    pub last_error_signature: String,
    pub mr_url: String,
    pub workspace_root: String,
    pub rules_dir: String,
    pub output_subdir: String,
    pub emit_rule_improvements: bool,
    pub genre: String,
    pub genre_subcategory: String,
    pub genre_override_reason: String,
    pub origin_event_id: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Rule-improvement candidate blocks keyed by rule name.
    pub rule_improvements: BTreeMap<String, String>,
    pub sandbox_audit_log: Vec<AuditRecord>,
}

/// Partial update returned by a code-track stage.
#[derive(Debug, Default)]
pub struct RunDelta {
    pub spec_markdown: Option<String>,
    pub generated_code: Option<BTreeMap<String, String>>,
    /// Appended, never replaced.
    pub error_logs: Vec<String>,
    pub retry_count: Option<u32>,
    pub status: Option<RunStatus>,
    pub fix_instruction: Option<String>,
    pub last_error_signature: Option<String>,
    pub mr_url: Option<String>,
    pub genre: Option<String>,
    pub genre_subcategory: Option<String>,
    pub genre_override_reason: Option<String>,
    /// Added to the run counters.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub rule_improvements: Vec<(String, String)>,
    /// Appended.
    pub sandbox_audit_log: Vec<AuditRecord>,
}

impl GraphState for RunState {
    type Delta = RunDelta;

    fn apply(&mut self, delta: RunDelta) {
        if let Some(spec) = delta.spec_markdown {
            self.spec_markdown = spec;
        }
        if let Some(code) = delta.generated_code {
            self.generated_code = code;
        }
        self.error_logs.extend(delta.error_logs);
        if let Some(retry) = delta.retry_count {
            self.retry_count = retry;
        }
        if let Some(status) = delta.status {
            self.status = status;
        }
        if let Some(fix) = delta.fix_instruction {
            self.fix_instruction = fix;
        }
        if let Some(signature) = delta.last_error_signature {
            self.last_error_signature = signature;
        }
        if let Some(mr_url) = delta.mr_url {
            self.mr_url = mr_url;
        }
        if let Some(genre) = delta.genre {
            self.genre = genre;
        }
        if let Some(sub) = delta.genre_subcategory {
            self.genre_subcategory = sub;
        }
        if let Some(reason) = delta.genre_override_reason {
            self.genre_override_reason = reason;
        }
        self.total_input_tokens = self.total_input_tokens.saturating_add(delta.input_tokens);
        self.total_output_tokens = self.total_output_tokens.saturating_add(delta.output_tokens);
        for (rule_name, block) in delta.rule_improvements {
            self.rule_improvements.insert(rule_name, block);
        }
        self.sandbox_audit_log.extend(delta.sandbox_audit_log);
    }

    fn on_stage_timeout(&mut self, _stage: &str, deadline: Duration) {
        self.error_logs
            .push(format!("Step timeout ({}s)", deadline.as_secs()));
        self.status = RunStatus::ReviewNg;
    }

    fn on_stage_failure(&mut self, stage: &str, error: &str) {
        self.error_logs.push(format!("{stage}: {error}"));
        self.status = RunStatus::Failed;
    }

    fn on_run_timeout(&mut self, deadline: Duration) {
        self.error_logs
            .push(format!("Total timeout ({}s)", deadline.as_secs()));
        self.status = RunStatus::Timeout;
    }

    fn on_bad_route(&mut self, stage: &str, label: &str) {
        self.error_logs
            .push(format!("{stage}: router returned undeclared target {label}"));
        self.status = RunStatus::Failed;
    }
}

/// Derive a directory slug from the leading part of a requirement: ASCII
/// alphanumerics, `_` and `-` survive; everything else collapses to `-`.
pub fn slug_from_requirement(requirement: &str, max_len: usize) -> String {
    let trimmed = requirement.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut slug = String::new();
    let mut last_dash = false;
    for c in trimmed.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '_' {
            last_dash = false;
            c
        } else if last_dash {
            continue;
        } else {
            last_dash = true;
            '-'
        };
        slug.push(mapped);
        if slug.len() >= max_len {
            break;
        }
    }
    slug.trim_matches('-').to_owned()
}

/// Build the initial state for a new run.
#[allow(clippy::too_many_arguments)]
pub fn initial_run_state(
    tenant_id: &str,
    requirement: &str,
    workspace_root: &str,
    rules_dir: &str,
    emit_rule_improvements: bool,
    genre: Option<&str>,
    origin_event_id: Option<&str>,
) -> RunState {
    let run_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_owned();
    let slug = slug_from_requirement(requirement, 50);
    let output_folder = if slug.is_empty() { run_id.clone() } else { slug };
    RunState {
        run_id,
        tenant_id: tenant_id.to_owned(),
        requirement: requirement.to_owned(),
        spec_markdown: String::new(),
        generated_code: BTreeMap::new(),
        error_logs: Vec::new(),
        retry_count: 0,
        status: RunStatus::Started,
        fix_instruction: String::new(),
        last_error_signature: String::new(),
        mr_url: String::new(),
        workspace_root: workspace_root.to_owned(),
        rules_dir: rules_dir.to_owned(),
        output_subdir: format!("output/{output_folder}"),
        emit_rule_improvements,
        genre: genre.map(str::trim).unwrap_or("").to_owned(),
        genre_subcategory: String::new(),
        genre_override_reason: String::new(),
        origin_event_id: origin_event_id.unwrap_or("").to_owned(),
        total_input_tokens: 0,
        total_output_tokens: 0,
        rule_improvements: BTreeMap::new(),
        sandbox_audit_log: Vec::new(),
    }
}
