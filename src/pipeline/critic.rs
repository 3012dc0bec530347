// src/pipeline/critic.rs
// Draft evaluation: groundedness and coverage

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::llm::{CompletionRequest, LlmClient};
use crate::capabilities::structured::{clamp_unit, parse_structured};
use crate::types::{Critique, CritiqueAction};

const CRITIC_SYSTEM_PROMPT: &str = "You audit a draft answer against the evidence it cites. Judge:\n\
- grounded: every claim is supported by the numbered evidence\n\
- coverage: 0-1, how completely the draft addresses the question\n\
- issues: short imperative fixes (e.g. \"Cover second source.\")\n\
Output ONLY valid JSON: {\"grounded\": true, \"coverage\": 0.0, \"issues\": [\"...\"]}";

const CRITIC_MAX_TOKENS: u32 = 300;

#[derive(Debug, Deserialize)]
struct CritiqueOutput {
    grounded: bool,
    coverage: f32,
    #[serde(default)]
    issues: Vec<String>,
}

/// Evaluates drafts. `accept` iff grounded and coverage meets the threshold;
/// soft-fails to an accept verdict flagged as `critic_error` so telemetry can
/// tell accept-by-fallback from accept-by-pass.
pub struct Critic {
    llm: Arc<dyn LlmClient>,
    model: String,
    threshold: f32,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, threshold: f32) -> Self {
        Self {
            llm,
            model: model.into(),
            threshold,
        }
    }

    /// Returns the critique and whether it is a fallback caused by a critic
    /// failure.
    pub async fn critique(&self, question: &str, draft: &str, evidence: &str) -> (Critique, bool) {
        match self.evaluate(question, draft, evidence).await {
            Ok(output) => {
                let coverage = clamp_unit(output.coverage);
                let action = if output.grounded && coverage >= self.threshold {
                    CritiqueAction::Accept
                } else {
                    CritiqueAction::Revise
                };
                debug!(grounded = output.grounded, coverage, ?action, "critiqued draft");
                (
                    Critique {
                        grounded: output.grounded,
                        coverage,
                        issues: output.issues,
                        action,
                    },
                    false,
                )
            }
            Err(e) => {
                warn!("critic failed, accepting draft: {e}");
                (Critique::accept_fallback(), true)
            }
        }
    }

    async fn evaluate(
        &self,
        question: &str,
        draft: &str,
        evidence: &str,
    ) -> crate::error::Result<CritiqueOutput> {
        let user = format!(
            "## Question\n{question}\n\n## Evidence\n{evidence}\n\n## Draft answer\n{draft}\n"
        );

        let request =
            CompletionRequest::prompt(&self.model, CRITIC_SYSTEM_PROMPT, user, CRITIC_MAX_TOKENS)
                .with_json_schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "grounded": {"type": "boolean"},
                        "coverage": {"type": "number"},
                        "issues": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["grounded", "coverage"]
                }));

        let completion = self.llm.complete(request).await?;
        parse_structured(&completion.text)
    }
}
