// src/pipeline/router.rs
// Intent classification and model/retriever routing

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::llm::{CompletionRequest, LlmClient};
use crate::capabilities::structured::{clamp_unit, parse_structured};
use crate::config::SibylConfig;
use crate::types::{Intent, RetrieverStrategy, RouteMetadata};

const ROUTER_SYSTEM_PROMPT: &str = "You classify a user question for a retrieval-augmented assistant. \
Choose exactly one intent:\n\
- faq: short known-answer questions\n\
- research: open-ended questions needing multiple sources\n\
- factual_lookup: a specific fact to retrieve\n\
- conversational: chit-chat or follow-ups needing no retrieval\n\
Output ONLY valid JSON: {\"intent\": \"...\", \"confidence\": 0.0, \"reasoning\": \"...\"}";

const ROUTER_MAX_TOKENS: u32 = 200;

#[derive(Debug, Deserialize)]
struct RouteOutput {
    intent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

/// Classifies the question and picks model tier, retriever strategy and
/// output budget. Never blocks the pipeline: a disabled router or a failed
/// classification yields the research-grade fallback route.
pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    config: Arc<SibylConfig>,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, config: Arc<SibylConfig>) -> Self {
        Self { llm, config }
    }

    pub async fn route(
        &self,
        question: &str,
        history_summary: &str,
    ) -> (RouteMetadata, Option<String>) {
        if !self.config.enable_intent_routing {
            return (self.fallback("fallback"), None);
        }

        match self.classify(question, history_summary).await {
            Ok(output) => match self.resolve(output) {
                Ok(route) => {
                    debug!(intent = route.intent.as_str(), confidence = route.confidence, "routed");
                    (route, None)
                }
                Err(diag) => {
                    warn!("route resolution failed: {diag}");
                    (self.fallback("fallback"), Some(diag))
                }
            },
            Err(e) => {
                warn!("intent classification failed: {e}");
                (self.fallback("fallback"), Some(format!("router failed: {e}")))
            }
        }
    }

    async fn classify(
        &self,
        question: &str,
        history_summary: &str,
    ) -> crate::error::Result<RouteOutput> {
        let mut user = format!("## Question\n{question}\n");
        if !history_summary.is_empty() {
            user.push_str(&format!("\n## Conversation summary\n{history_summary}\n"));
        }

        let request = CompletionRequest::prompt(
            &self.config.model_small,
            ROUTER_SYSTEM_PROMPT,
            user,
            ROUTER_MAX_TOKENS,
        )
        .with_json_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "intent": {"type": "string", "enum": ["faq", "research", "factual_lookup", "conversational"]},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"}
            },
            "required": ["intent", "confidence"]
        }));

        let completion = self.llm.complete(request).await?;
        parse_structured(&completion.text)
    }

    fn resolve(&self, output: RouteOutput) -> std::result::Result<RouteMetadata, String> {
        let intent = match output.intent.as_str() {
            "faq" => Intent::Faq,
            "research" => Intent::Research,
            "factual_lookup" => Intent::FactualLookup,
            "conversational" => Intent::Conversational,
            other => return Err(format!("unknown intent '{other}'")),
        };

        let (large, strategy, max_tokens) = match intent {
            Intent::Faq => (false, RetrieverStrategy::Vector, 500),
            Intent::Research => (true, RetrieverStrategy::HybridWeb, 2000),
            Intent::FactualLookup => (false, RetrieverStrategy::Hybrid, 600),
            Intent::Conversational => (false, RetrieverStrategy::Vector, 400),
        };

        Ok(RouteMetadata {
            intent,
            confidence: clamp_unit(output.confidence),
            reasoning: output.reasoning,
            model: self.config.model_for_tier(large).to_string(),
            retriever_strategy: strategy,
            max_tokens,
        })
    }

    fn fallback(&self, reasoning: &str) -> RouteMetadata {
        RouteMetadata {
            intent: Intent::Research,
            confidence: 0.0,
            reasoning: reasoning.to_string(),
            model: self.config.model_large.clone(),
            retriever_strategy: RetrieverStrategy::HybridWeb,
            max_tokens: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stubs::StubLlm;

    fn router(llm: Arc<StubLlm>, routing_enabled: bool) -> IntentRouter {
        let config = SibylConfig {
            enable_intent_routing: routing_enabled,
            ..Default::default()
        };
        IntentRouter::new(llm, Arc::new(config))
    }

    #[tokio::test]
    async fn test_faq_maps_to_small_vector() {
        let llm = Arc::new(StubLlm::new());
        llm.script(
            "Question",
            r#"{"intent": "faq", "confidence": 0.9, "reasoning": "known answer"}"#,
        );
        let (route, diag) = router(llm, true).route("What are your hours?", "").await;

        assert_eq!(route.intent, Intent::Faq);
        assert_eq!(route.retriever_strategy, RetrieverStrategy::Vector);
        assert_eq!(route.max_tokens, 500);
        assert_eq!(route.model, "deepseek-chat");
        assert!(diag.is_none());
    }

    #[tokio::test]
    async fn test_research_maps_to_large_hybrid_web() {
        let llm = Arc::new(StubLlm::new());
        llm.script(
            "Question",
            r#"{"intent": "research", "confidence": 0.7, "reasoning": "broad"}"#,
        );
        let (route, _) = router(llm, true).route("Compare X and Y", "").await;

        assert_eq!(route.intent, Intent::Research);
        assert_eq!(route.retriever_strategy, RetrieverStrategy::HybridWeb);
        assert_eq!(route.max_tokens, 2000);
        assert_eq!(route.model, "deepseek-reasoner");
    }

    #[tokio::test]
    async fn test_disabled_routing_uses_fallback() {
        let llm = Arc::new(StubLlm::new());
        let (route, diag) = router(llm.clone(), false).route("anything", "").await;

        assert_eq!(route.intent, Intent::Research);
        assert_eq!(route.confidence, 0.0);
        assert_eq!(route.reasoning, "fallback");
        assert_eq!(llm.call_count(), 0);
        assert!(diag.is_none());
    }

    #[tokio::test]
    async fn test_classifier_failure_is_soft() {
        let llm = Arc::new(StubLlm::failing());
        let (route, diag) = router(llm, true).route("anything", "").await;

        assert_eq!(route.intent, Intent::Research);
        assert_eq!(route.reasoning, "fallback");
        assert!(diag.is_some());
    }

    #[tokio::test]
    async fn test_unknown_intent_is_soft() {
        let llm = Arc::new(StubLlm::new());
        llm.script("Question", r#"{"intent": "prophecy", "confidence": 1.0}"#);
        let (route, diag) = router(llm, true).route("anything", "").await;

        assert_eq!(route.intent, Intent::Research);
        assert!(diag.unwrap().contains("unknown intent"));
    }

    #[tokio::test]
    async fn test_confidence_is_clamped() {
        let llm = Arc::new(StubLlm::new());
        llm.script(
            "Question",
            r#"{"intent": "faq", "confidence": 7.5, "reasoning": ""}"#,
        );
        let (route, _) = router(llm, true).route("q", "").await;
        assert_eq!(route.confidence, 1.0);
    }
}
