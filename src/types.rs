// src/types.rs
// Shared data model for the orchestration pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Conversation
// ============================================================================

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversation message. Immutable input; the orchestrator never
/// mutates the caller's list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Content of the last user message, or empty if there is none.
pub fn last_user_message(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

// ============================================================================
// Retrieval hits
// ============================================================================

/// A knowledge-base retrieval hit. `id` is unique within the final reference
/// list of a session; citation indices in the answer are 1-based positions
/// into that list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// A web search hit. `rank` is 1-based source order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebResult {
    pub id: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub rank: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f32>,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

// ============================================================================
// Routing and planning
// ============================================================================

/// Classified intent of the user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Faq,
    Research,
    FactualLookup,
    Conversational,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Faq => "faq",
            Self::Research => "research",
            Self::FactualLookup => "factual_lookup",
            Self::Conversational => "conversational",
        }
    }
}

/// Which retrieval sources a route enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrieverStrategy {
    #[serde(rename = "vector")]
    Vector,
    #[serde(rename = "hybrid")]
    Hybrid,
    #[serde(rename = "hybrid+web")]
    HybridWeb,
}

impl RetrieverStrategy {
    pub fn includes_web(&self) -> bool {
        matches!(self, Self::HybridWeb)
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, Self::Hybrid | Self::HybridWeb)
    }
}

/// Routing decision for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMetadata {
    pub intent: Intent,
    pub confidence: f32,
    pub reasoning: String,
    pub model: String,
    pub retriever_strategy: RetrieverStrategy,
    pub max_tokens: u32,
}

/// Action a plan step requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    VectorSearch,
    WebSearch,
    Both,
    Answer,
}

/// One step of a retrieval plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: PlanAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<u32>,
}

impl PlanStep {
    pub fn answer() -> Self {
        Self {
            action: PlanAction::Answer,
            query: None,
            k: None,
        }
    }
}

/// Structured retrieval plan. Always has at least one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub confidence: f32,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Soft-fallback plan used when the planner fails or is disabled.
    pub fn fallback() -> Self {
        Self {
            confidence: 0.0,
            steps: vec![PlanStep::answer()],
        }
    }

    /// First explicit vector-search query in the plan, if any.
    pub fn first_search_query(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| matches!(s.action, PlanAction::VectorSearch | PlanAction::Both))
            .and_then(|s| s.query.as_deref())
            .filter(|q| !q.is_empty())
    }

    /// Whether any step explicitly requests web search.
    pub fn requests_web(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.action, PlanAction::WebSearch | PlanAction::Both))
    }
}

// ============================================================================
// Decomposition
// ============================================================================

/// One dependency-ordered sub-query of a decomposed question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    pub id: u32,
    pub query: String,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub reasoning: String,
}

/// Decomposition of a complex question into sub-queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decomposition {
    pub sub_queries: Vec<SubQuery>,
    pub synthesis_prompt: String,
}

// ============================================================================
// Context sections
// ============================================================================

/// Assembled context sections, each independently budgeted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSections {
    pub history: Vec<Message>,
    pub summary: Vec<String>,
    pub salience: Vec<String>,
    pub web: String,
}

/// Token accounting per section after budgeting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContextBudget {
    pub history_tokens: u32,
    pub summary_tokens: u32,
    pub salience_tokens: u32,
    pub web_tokens: u32,
    pub total_tokens: u32,
}

// ============================================================================
// Critique
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CritiqueAction {
    Accept,
    Revise,
}

/// Critic verdict on a draft answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub grounded: bool,
    pub coverage: f32,
    pub issues: Vec<String>,
    pub action: CritiqueAction,
}

impl Critique {
    /// Accept-by-fallback verdict used when the critic itself fails.
    pub fn accept_fallback() -> Self {
        Self {
            grounded: true,
            coverage: 1.0,
            issues: vec![],
            action: CritiqueAction::Accept,
        }
    }
}

// ============================================================================
// Activity and usage
// ============================================================================

/// Record of one executed sub-operation (search, web fetch, lazy load,
/// decomposition, rerank). Appended in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStep {
    #[serde(rename = "type")]
    pub step_type: String,
    pub description: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActivityStep {
    pub fn new(step_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            description: description.into(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Accumulated token usage across every LLM call of a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl UsageTotals {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn add(&mut self, other: &UsageTotals) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ============================================================================
// Response
// ============================================================================

/// Condensed verdict reported in response metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub grounded: bool,
    pub coverage: f32,
    pub attempts: u32,
}

/// Full critic history for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CriticReport {
    pub iterations: u32,
    pub history: Vec<Critique>,
    pub critic_error: bool,
}

/// Retrieval diagnostics recorded in the trace and response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalDiagnostics {
    pub source: String,
    pub retrieval_mode: String,
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub reference_count: usize,
    pub web_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub plan: Plan,
    pub context_budget: ContextBudget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critic_report: Option<CriticReport>,
    pub evaluation: Evaluation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalDiagnostics>,
    pub usage: UsageTotals,
}

/// Final grounded answer with citations and the activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub citations: Vec<Reference>,
    pub activity: Vec<ActivityStep>,
    pub metadata: ResponseMetadata,
}

/// The literal answer returned when evidence is insufficient.
pub const NO_ANSWER: &str = "I do not know.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_user_message_picks_latest() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
        ];
        assert_eq!(last_user_message(&messages), "second");
    }

    #[test]
    fn test_last_user_message_empty() {
        assert_eq!(last_user_message(&[]), "");
        assert_eq!(last_user_message(&[Message::assistant("hi")]), "");
    }

    #[test]
    fn test_plan_fallback_has_answer_step() {
        let plan = Plan::fallback();
        assert_eq!(plan.confidence, 0.0);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, PlanAction::Answer);
    }

    #[test]
    fn test_plan_first_search_query() {
        let plan = Plan {
            confidence: 0.8,
            steps: vec![
                PlanStep {
                    action: PlanAction::WebSearch,
                    query: Some("web only".into()),
                    k: None,
                },
                PlanStep {
                    action: PlanAction::VectorSearch,
                    query: Some("capital of France".into()),
                    k: Some(3),
                },
            ],
        };
        assert_eq!(plan.first_search_query(), Some("capital of France"));
        assert!(plan.requests_web());
    }

    #[test]
    fn test_retriever_strategy_flags() {
        assert!(!RetrieverStrategy::Vector.includes_web());
        assert!(RetrieverStrategy::HybridWeb.includes_web());
        assert!(RetrieverStrategy::Hybrid.is_hybrid());
        assert!(!RetrieverStrategy::Vector.is_hybrid());
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&RetrieverStrategy::HybridWeb).unwrap();
        assert_eq!(json, "\"hybrid+web\"");
    }

    #[test]
    fn test_usage_accumulation() {
        let mut usage = UsageTotals::default();
        usage.add(&UsageTotals::new(10, 5));
        usage.add(&UsageTotals::new(3, 2));
        assert_eq!(usage.prompt_tokens, 13);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total(), 20);
    }
}
