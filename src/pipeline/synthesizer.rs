// src/pipeline/synthesizer.rs
// Grounded answer synthesis, sync and streaming

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capabilities::llm::{Completion, CompletionRequest, LlmClient, StreamEvent};
use crate::error::{Result, SibylError};
use crate::events::{EventSink, SessionEvent};

pub const SYNTHESIS_SYSTEM_PROMPT: &str = "Respond using ONLY the provided context. \
Cite inline as [1], [2]… If evidence is insufficient, reply exactly 'I do not know.'";

const SYNTHESIS_RETRY_ATTEMPTS: u32 = 2;
const SYNTHESIS_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One synthesis attempt.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub question: String,
    /// Budgeted conversation context (recent turns, summary, salience).
    pub conversation_context: String,
    pub context_text: String,
    pub web_context_text: String,
    /// Critic issues from the previous attempt, if any.
    pub revision_notes: Vec<String>,
    pub model: String,
    pub max_tokens: u32,
}

/// Builds the grounded-answer prompt and drives the LLM. Streaming attempts
/// are buffered per attempt: deltas reach the consumer only once the attempt
/// completes, so a retried attempt never leaks partial tokens.
pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Synthesize one attempt, emitting its token burst through `sink` after
    /// the attempt completes. Terminal provider failure after retries is a
    /// `SynthesisError`.
    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        sink: &EventSink,
    ) -> Result<Completion> {
        let completion_request = self.build_request(request);

        let mut last_error = None;
        for attempt in 0..=SYNTHESIS_RETRY_ATTEMPTS {
            if attempt > 0 {
                debug!("retrying synthesis (attempt {})", attempt + 1);
                tokio::time::sleep(SYNTHESIS_RETRY_DELAY).await;
            }

            // Buffer this attempt's deltas; a failed attempt emits nothing.
            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let stream = self.llm.complete_stream(completion_request.clone(), tx);
            let collector = async {
                let mut deltas = Vec::new();
                while let Some(event) = rx.recv().await {
                    if let StreamEvent::Delta(delta) = event {
                        deltas.push(delta);
                    }
                }
                deltas
            };

            let (result, deltas) = tokio::join!(stream, collector);
            match result {
                Ok(completion) => {
                    if deltas.is_empty() && !completion.text.is_empty() {
                        sink.emit(SessionEvent::Token {
                            delta: completion.text.clone(),
                        })
                        .await;
                    } else {
                        for delta in deltas {
                            sink.emit(SessionEvent::Token { delta }).await;
                        }
                    }
                    return Ok(completion);
                }
                Err(e) => {
                    warn!("synthesis attempt failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(SibylError::Synthesis(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "provider returned no completion".into()),
        ))
    }

    fn build_request(&self, request: &SynthesisRequest) -> CompletionRequest {
        let mut user = format!("## Question\n{}\n", request.question);
        if !request.conversation_context.is_empty() {
            user.push_str(&format!(
                "\n## Conversation context\n{}\n",
                request.conversation_context
            ));
        }
        user.push_str("\n## Context\n");
        if request.context_text.is_empty() {
            user.push_str("(no knowledge base context)\n");
        } else {
            user.push_str(&request.context_text);
            user.push('\n');
        }
        if !request.web_context_text.is_empty() {
            user.push_str(&format!("\n## Web context\n{}\n", request.web_context_text));
        }
        if !request.revision_notes.is_empty() {
            user.push_str("\n## Revision notes\nAddress these issues from the previous draft:\n");
            for note in &request.revision_notes {
                user.push_str(&format!("- {note}\n"));
            }
        }

        CompletionRequest::prompt(
            &request.model,
            SYNTHESIS_SYSTEM_PROMPT,
            user,
            request.max_tokens,
        )
    }
}
