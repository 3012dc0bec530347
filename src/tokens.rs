// src/tokens.rs
// Fast token-count approximation for context budgeting

use thiserror::Error;

/// Approximate characters per token. Close enough for budgeting across the
/// model families we route to; never used for billing.
const CHARS_PER_TOKEN: f64 = 4.0;

#[derive(Debug, Error)]
#[error("token estimation requires a model name")]
pub struct EstimatorError;

/// Estimate the token count of `text` for `model`.
///
/// Rough estimate (~4 characters per token). Always returns a non-negative
/// count; errors only on an empty model name.
pub fn estimate(model: &str, text: &str) -> Result<u32, EstimatorError> {
    if model.is_empty() {
        return Err(EstimatorError);
    }
    if text.is_empty() {
        return Ok(0);
    }
    Ok((text.len() as f64 / CHARS_PER_TOKEN).ceil() as u32)
}

/// Estimate without a model name, for internal bookkeeping where the model
/// is not yet known (lazy summaries, web snippets).
pub fn estimate_unchecked(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Maximum number of bytes a text may occupy to stay within `cap` tokens.
pub fn byte_budget(cap: u32) -> usize {
    (cap as f64 * CHARS_PER_TOKEN) as usize
}
