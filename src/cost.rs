//! Per-run cost estimation from accumulated token counts.

use crate::config::CostConfig;

/// Estimate the USD cost of a run from its token counters.
pub fn estimate_usd(config: &CostConfig, input_tokens: u64, output_tokens: u64) -> f64 {
    let input = token_millions(input_tokens) * config.input_usd_per_million;
    let output = token_millions(output_tokens) * config.output_usd_per_million;
    input + output
}

/// Estimate cost and compare against the configured per-run ceiling.
///
/// Returns `(estimated_usd, ceiling_exceeded)`.
pub fn check_budget(config: &CostConfig, input_tokens: u64, output_tokens: u64) -> (f64, bool) {
    let cost = estimate_usd(config, input_tokens, output_tokens);
    (cost, cost > config.max_usd_per_run)
}

fn token_millions(tokens: u64) -> f64 {
    // u32 intermediate keeps the cast lossless for any realistic count.
    let clamped = u32::try_from(tokens.min(u64::from(u32::MAX))).unwrap_or(u32::MAX);
    f64::from(clamped) / 1_000_000.0
}
