//! Coder stage: specification (+ prior code, + fix instruction) → files.
//!
//! The model answers with one block per file, delimited either by dashed
//! headers (`--- path ---`) or by a bare path line followed by a fenced
//! code block. Paths are normalized and traversal-shaped entries are
//! dropped with an error log rather than written.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::graph::StageError;
use crate::providers::router::Profile;
use crate::providers::{CompletionRequest, Message};
use crate::rules::load_rule;
use crate::runs::state::{RunDelta, RunState};

use super::RunStageContext;

const CODER_SYSTEM: &str = "You are a careful software engineer. Implement the given \
specification as a set of files.\n\n\
Output format, and nothing else: for every file emit a header line\n\
--- relative/path/to/file ---\n\
followed by the complete file content. Fenced code blocks after a header are allowed \
and will be unwrapped. Keep the change minimal and self-contained; include tests where \
the specification asks for them. Never include secrets or credentials.";

/// Normalize a model-emitted path: strip decoration and the leading slash,
/// unify separators. Returns `None` for empty or traversal-shaped paths.
pub fn normalize_rel_path(raw: &str) -> Option<String> {
    let mut cleaned = raw.replace('\\', "/");
    cleaned = cleaned
        .trim_matches(|c: char| c == '`' || c == '-' || c.is_whitespace())
        .to_owned();
    while cleaned.starts_with('/') {
        cleaned.remove(0);
    }
    if cleaned.is_empty() {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in cleaned.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            normal => parts.push(normal),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn dashed_header(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with("---") || !trimmed.ends_with("---") || trimmed.len() < 7 {
        return None;
    }
    let inner = trimmed.trim_matches('-').trim();
    if inner.is_empty() || inner.contains(' ') && !inner.contains('/') && !inner.contains('.') {
        return None;
    }
    Some(inner.to_owned())
}

fn looks_like_path(line: &str) -> Option<String> {
    let trimmed = line.trim().trim_matches('`');
    if trimmed.is_empty() || trimmed.contains(' ') {
        return None;
    }
    if trimmed.contains('/') || trimmed.contains('.') {
        Some(trimmed.to_owned())
    } else {
        None
    }
}

/// Parse a model response into `{rel-path → content}`. Traversal-shaped
/// paths are skipped and reported in the second return value.
pub fn parse_generated_files(response: &str) -> (BTreeMap<String, String>, Vec<String>) {
    let mut files: BTreeMap<String, String> = BTreeMap::new();
    let mut rejected: Vec<String> = Vec::new();

    let mut current: Option<(String, Vec<String>)> = None;
    let mut in_fence = false;
    let mut pending_path: Option<String> = None;

    let mut flush = |current: &mut Option<(String, Vec<String>)>,
                     files: &mut BTreeMap<String, String>| {
        if let Some((path, lines)) = current.take() {
            let mut content = lines.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            files.insert(path, content);
        }
    };

    for line in response.lines() {
        let fence_line = line.trim_start().starts_with("```");

        if !in_fence {
            if let Some(raw_path) = dashed_header(line) {
                flush(&mut current, &mut files);
                pending_path = None;
                match normalize_rel_path(&raw_path) {
                    Some(path) => current = Some((path, Vec::new())),
                    None => {
                        rejected.push(raw_path);
                        current = None;
                    }
                }
                continue;
            }
            if current.is_none() {
                if fence_line {
                    if let Some(raw_path) = pending_path.take() {
                        match normalize_rel_path(&raw_path) {
                            Some(path) => {
                                current = Some((path, Vec::new()));
                                in_fence = true;
                            }
                            None => rejected.push(raw_path),
                        }
                    }
                    continue;
                }
                pending_path = looks_like_path(line);
                continue;
            }
        }

        if fence_line {
            if in_fence {
                // Closing fence ends the fenced file body.
                in_fence = false;
                flush(&mut current, &mut files);
            } else {
                in_fence = true;
            }
            continue;
        }

        if let Some((_, lines)) = current.as_mut() {
            lines.push(line.to_owned());
        }
    }
    flush(&mut current, &mut files);

    // Dashed-header bodies may themselves be fenced; unwrap a fence that
    // spans the whole body.
    let unwrapped: BTreeMap<String, String> = files
        .into_iter()
        .map(|(path, content)| (path, unwrap_full_fence(&content)))
        .collect();

    (unwrapped, rejected)
}

fn unwrap_full_fence(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let Some(first) = lines.first() else {
        return content.to_owned();
    };
    if !first.trim_start().starts_with("```") {
        return content.to_owned();
    }
    let Some(last_fence) = lines.iter().rposition(|l| l.trim_start().starts_with("```")) else {
        return content.to_owned();
    };
    if last_fence == 0 {
        return content.to_owned();
    }
    let mut body = lines[1..last_fence].join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    body
}

/// Generate code from the spec with the cost profile.
pub async fn generate_code(
    ctx: Arc<RunStageContext>,
    state: RunState,
) -> Result<RunDelta, StageError> {
    let coder_rules = load_rule(&ctx.rules_dir(&state), "coder_rules", CODER_SYSTEM);

    let mut user_prompt = format!("## Specification\n\n{}\n", state.spec_markdown);
    if !state.generated_code.is_empty() {
        user_prompt.push_str("\n## Current files (regenerate the full set)\n\n");
        for (path, content) in &state.generated_code {
            user_prompt.push_str(&format!("--- {path} ---\n{content}\n"));
        }
    }
    if !state.fix_instruction.trim().is_empty() {
        user_prompt.push_str(&format!("\n## Fix instruction\n\n{}\n", state.fix_instruction));
    }

    let request = CompletionRequest {
        messages: vec![Message::system(coder_rules), Message::user(user_prompt)],
        max_tokens: Some(8192),
    };
    let response = ctx
        .models
        .complete(Profile::Cost, request)
        .await
        .map_err(|e| StageError::Fatal(format!("code generation failed: {e}")))?;

    let (files, rejected) = parse_generated_files(&response.content);

    let mut delta = RunDelta {
        generated_code: Some(files),
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        ..Default::default()
    };
    for path in rejected {
        delta
            .error_logs
            .push(format!("coder emitted traversal-shaped path, dropped: {path}"));
    }

    if state.emit_rule_improvements {
        delta.rule_improvements.push((
            "coder_rules".to_owned(),
            "# Coder phase: candidate rule additions\n\n\
             ## Suggested for coder_rules.md\n\
             Record project layout conventions that had to be inferred this run.\n"
                .to_owned(),
        ));
    }

    Ok(delta)
}
