// src/capabilities/structured.rs
// Schema-validated parsing of structured LLM output

use serde::de::DeserializeOwned;

use crate::error::{Result, SibylError};

/// Pull the JSON payload out of a model reply that may wrap it in a
/// markdown fence or surround it with prose.
pub fn extract_json_block(reply: &str) -> String {
    if let Some(payload) = fenced_payload(reply) {
        return payload;
    }

    // No usable fence: take the outermost brace span.
    match (reply.find('{'), reply.rfind('}')) {
        (Some(open), Some(close)) if open < close => reply[open..=close].to_string(),
        _ => reply.to_string(),
    }
}

/// Contents of the first ``` fence whose body looks like JSON. A language
/// tag on the opening line (```json) is skipped.
fn fenced_payload(reply: &str) -> Option<String> {
    let fence = reply.find("```")?;
    let opened = &reply[fence + 3..];
    let body = match opened.find('\n') {
        Some(line_break) => &opened[line_break + 1..],
        None => opened,
    };
    let closing = body.find("```")?;
    let payload = body[..closing].trim();
    if payload.starts_with('{') || payload.starts_with('[') {
        Some(payload.to_string())
    } else {
        None
    }
}

/// Parse a structured LLM response, tolerating a surrounding markdown fence.
/// A schema violation is a `ValidationError`, routed by callers to their
/// soft fallback.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = extract_json_block(text);
    serde_json::from_str(&json).map_err(|e| SibylError::Validation(e.to_string()))
}

/// Clamp a model-reported confidence or coverage value into [0, 1].
pub fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}
