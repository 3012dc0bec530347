// src/error.rs
// Error kinds for the orchestration pipeline

use thiserror::Error;

/// Errors surfaced by the orchestrator and its components.
///
/// Soft-failing components (router, planner, critic, compactor, web search,
/// memory writes) never return these to the caller; they degrade and record a
/// diagnostic in the session trace. Budget overruns are resolved internally by
/// hard truncation and are not represented here.
#[derive(Debug, Error)]
pub enum SibylError {
    /// Invalid configuration. Fatal at init.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An external capability (LLM, retrieval, web, embedder) failed after
    /// its internal retries.
    #[error("{capability} call failed: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    /// Malformed structured output from the model. Routed to the producing
    /// component's soft fallback.
    #[error("malformed model output: {0}")]
    Validation(String),

    /// Terminal LLM failure during answer synthesis. Fails the session.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// A call or the whole session exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl SibylError {
    pub fn capability(capability: &'static str, message: impl Into<String>) -> Self {
        Self::Capability {
            capability,
            message: message.into(),
        }
    }

    /// Pipeline stage to report in the `error` event.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) => "init",
            Self::Capability { capability, .. } => capability,
            Self::Validation(_) => "parse",
            Self::Synthesis(_) => "synthesis",
            Self::Timeout(_) => "deadline",
        }
    }
}

pub type Result<T> = std::result::Result<T, SibylError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_display() {
        let err = SibylError::capability("retrieval", "connection refused");
        assert_eq!(err.to_string(), "retrieval call failed: connection refused");
        assert_eq!(err.stage(), "retrieval");
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(SibylError::Synthesis("x".into()).stage(), "synthesis");
        assert_eq!(SibylError::Timeout("x".into()).stage(), "deadline");
        assert_eq!(SibylError::Config("x".into()).stage(), "init");
    }
}
