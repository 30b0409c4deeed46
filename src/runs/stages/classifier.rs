//! Genre classification over the requirement text.
//!
//! Uses the cost profile. A user-supplied genre is honored unless the
//! model is highly confident a different genre fits, in which case the
//! override and its reason are recorded on the state. Classification is
//! best-effort: a missing rule document or a provider failure skips the
//! stage with an empty delta rather than failing the run.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::graph::StageError;
use crate::providers::router::Profile;
use crate::providers::{CompletionRequest, Message};
use crate::rules::load_rule;
use crate::runs::state::{RunDelta, RunState};

use super::{extract_json_object, RunStageContext};

/// Confidence at or above which the model may override a user-supplied genre.
pub const OVERRIDE_THRESHOLD: f64 = 0.85;

const CLASSIFIER_SYSTEM: &str = "You classify business requirements into genres. \
Read the classification rules and the requirement text, then answer with ONLY a JSON object:\n\
{\"genre_id\": \"...\", \"genre_subcategory\": \"...\", \"confidence\": 0.0, \"reason\": \"...\"}\n\
No prose before or after the JSON.";

/// Classify the requirement. Never fatal.
pub async fn classify(
    ctx: Arc<RunStageContext>,
    state: RunState,
) -> Result<RunDelta, StageError> {
    let requirement = state.requirement.trim();
    if requirement.is_empty() {
        return Ok(RunDelta::default());
    }

    let genre_rules = load_rule(&ctx.rules_dir(&state), "genre_rules", "");
    if genre_rules.trim().is_empty() {
        debug!("genre_rules.md not found, skipping genre classification");
        return Ok(RunDelta::default());
    }

    let user_genre = state.genre.trim().to_owned();
    let requirement_head: String = requirement.chars().take(2000).collect();
    let user_content = format!(
        "## Classification rules\n\n{genre_rules}\n\n\
         ## Requirement\n\n{requirement_head}\n\n\
         ## User-supplied genre (may be empty)\n\n{}",
        if user_genre.is_empty() { "(none)" } else { &user_genre }
    );

    let request = CompletionRequest {
        messages: vec![Message::system(CLASSIFIER_SYSTEM), Message::user(user_content)],
        max_tokens: Some(512),
    };

    let response = match ctx.models.complete(Profile::Cost, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "genre classification call failed; keeping user genre");
            return Ok(RunDelta::default());
        }
    };

    let mut delta = RunDelta {
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        ..Default::default()
    };

    let Some(parsed) = extract_json_object(&response.content) else {
        warn!("genre classification output was not parseable JSON");
        return Ok(delta);
    };
    let detected = parsed
        .get("genre_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_owned();
    if detected.is_empty() {
        return Ok(delta);
    }
    let subcategory = parsed
        .get("genre_subcategory")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_owned();
    let confidence = parsed
        .get("confidence")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0);
    let reason = parsed
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_owned();

    if user_genre.is_empty() {
        delta.genre = Some(detected);
    } else if detected != user_genre && confidence >= OVERRIDE_THRESHOLD {
        delta.genre_override_reason = Some(format!(
            "user genre \"{user_genre}\" overridden to \"{detected}\" (confidence {confidence:.2}): {reason}"
        ));
        delta.genre = Some(detected);
    }
    // Otherwise the user's choice stands; only the subcategory is filled in.

    if !subcategory.is_empty() {
        delta.genre_subcategory = Some(subcategory);
    }

    Ok(delta)
}
