// src/capabilities/llm.rs
// LLM client capability

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Message, UsageTotals};

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    /// When set, the provider is asked for constrained JSON output matching
    /// this schema. Providers without native schema support may ignore it;
    /// the caller validates the parsed output either way.
    pub json_schema: Option<serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            json_schema: None,
        }
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    /// Convenience for the common system + user prompt pair.
    pub fn prompt(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self::new(
            model,
            vec![Message::system(system), Message::user(user)],
            max_tokens,
        )
    }
}

/// Final result of a completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub response_id: Option<String>,
    pub usage: Option<UsageTotals>,
}

/// Incremental events forwarded during a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta, strictly in-order within one completion.
    Delta(String),
    /// Terminal event with the fully assembled text.
    Done {
        text: String,
        usage: Option<UsageTotals>,
    },
}

/// Chat completion capability. Implementations retry transient failures
/// internally and surface `SibylError::Capability` when exhausted.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a request and return the final text.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;

    /// Complete a request, forwarding deltas through `tx` as they arrive.
    /// The terminal `StreamEvent::Done` carries the assembled text; the same
    /// completion is also returned.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Completion>;
}
