// src/pipeline/planner.rs
// Structured retrieval planning

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::llm::{CompletionRequest, LlmClient};
use crate::capabilities::structured::{clamp_unit, parse_structured};
use crate::types::{Plan, PlanStep, RouteMetadata};

const PLANNER_SYSTEM_PROMPT: &str = "You plan retrieval for a grounded question-answering assistant. \
Decide how confident you are that the knowledge base alone can answer, and produce ordered steps.\n\
Actions: vector_search (knowledge base), web_search, both, answer.\n\
Output ONLY valid JSON:\n\
{\"confidence\": 0.0, \"steps\": [{\"action\": \"vector_search\", \"query\": \"...\", \"k\": 5}]}";

const PLANNER_MAX_TOKENS: u32 = 400;

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    steps: Vec<PlanStep>,
}

/// Produces a `Plan` from the question and routing decision. Fails soft with
/// the zero-confidence answer-only plan.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn plan(
        &self,
        question: &str,
        route: &RouteMetadata,
        history_summary: &str,
    ) -> (Plan, Option<String>) {
        match self.generate(question, route, history_summary).await {
            Ok(output) => {
                let steps = if output.steps.is_empty() {
                    vec![PlanStep::answer()]
                } else {
                    output.steps
                };
                let plan = Plan {
                    confidence: clamp_unit(output.confidence),
                    steps,
                };
                debug!(confidence = plan.confidence, steps = plan.steps.len(), "planned");
                (plan, None)
            }
            Err(e) => {
                warn!("planning failed, using fallback plan: {e}");
                (Plan::fallback(), Some(format!("planner failed: {e}")))
            }
        }
    }

    async fn generate(
        &self,
        question: &str,
        route: &RouteMetadata,
        history_summary: &str,
    ) -> crate::error::Result<PlanOutput> {
        let mut user = format!(
            "## Question\n{question}\n\n## Routed intent\n{} (retriever: {:?})\n",
            route.intent.as_str(),
            route.retriever_strategy,
        );
        if !history_summary.is_empty() {
            user.push_str(&format!("\n## Conversation summary\n{history_summary}\n"));
        }

        let request = CompletionRequest::prompt(
            &route.model,
            PLANNER_SYSTEM_PROMPT,
            user,
            PLANNER_MAX_TOKENS,
        )
        .with_json_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "confidence": {"type": "number"},
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "action": {"type": "string", "enum": ["vector_search", "web_search", "both", "answer"]},
                            "query": {"type": "string"},
                            "k": {"type": "integer"}
                        },
                        "required": ["action"]
                    }
                }
            },
            "required": ["confidence", "steps"]
        }));

        let completion = self.llm.complete(request).await?;
        parse_structured(&completion.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stubs::StubLlm;
    use crate::types::{Intent, PlanAction, RetrieverStrategy};

    fn route() -> RouteMetadata {
        RouteMetadata {
            intent: Intent::FactualLookup,
            confidence: 0.8,
            reasoning: "test".into(),
            model: "deepseek-chat".into(),
            retriever_strategy: RetrieverStrategy::Hybrid,
            max_tokens: 600,
        }
    }

    #[tokio::test]
    async fn test_parses_steps() {
        let llm = Arc::new(StubLlm::new());
        llm.script(
            "Question",
            r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "capital of France", "k": 3}]}"#,
        );
        let (plan, diag) = Planner::new(llm).plan("What is the capital of France?", &route(), "").await;

        assert!((plan.confidence - 0.9).abs() < 1e-6);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, PlanAction::VectorSearch);
        assert_eq!(plan.first_search_query(), Some("capital of France"));
        assert!(diag.is_none());
    }

    #[tokio::test]
    async fn test_empty_steps_become_answer() {
        let llm = Arc::new(StubLlm::new());
        llm.script("Question", r#"{"confidence": 0.5, "steps": []}"#);
        let (plan, _) = Planner::new(llm).plan("q", &route(), "").await;

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, PlanAction::Answer);
    }

    #[tokio::test]
    async fn test_llm_failure_is_soft() {
        let llm = Arc::new(StubLlm::failing());
        let (plan, diag) = Planner::new(llm).plan("q", &route(), "").await;

        assert_eq!(plan.confidence, 0.0);
        assert_eq!(plan.steps[0].action, PlanAction::Answer);
        assert!(diag.unwrap().contains("planner failed"));
    }

    #[tokio::test]
    async fn test_malformed_action_is_soft() {
        let llm = Arc::new(StubLlm::new());
        llm.script(
            "Question",
            r#"{"confidence": 0.5, "steps": [{"action": "summon"}]}"#,
        );
        let (plan, diag) = Planner::new(llm).plan("q", &route(), "").await;

        assert_eq!(plan.confidence, 0.0);
        assert!(diag.is_some());
    }
}
