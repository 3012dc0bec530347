// src/context/compactor.rs
// LLM compaction of older conversation turns into bullets + salience facts

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::llm::{CompletionRequest, LlmClient};
use crate::capabilities::structured::parse_structured;
use crate::types::Message;

const COMPACTION_SYSTEM_PROMPT: &str = "You compress older conversation turns for an assistant's working memory. \
Summarize the given turns into concise factual bullets, and extract durable user facts, preferences and decisions \
as salience notes. Output ONLY valid JSON:\n\
{\"summary_bullets\": [\"...\"], \"salience_notes\": [{\"fact\": \"...\", \"topic\": \"...\"}]}";

const COMPACTION_MAX_TOKENS: u32 = 800;

/// Result of splitting history into recent turns plus compacted memory.
#[derive(Debug, Clone, Default)]
pub struct CompactedHistory {
    pub recent: Vec<Message>,
    pub summary_bullets: Vec<String>,
    pub salience_notes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CompactionOutput {
    #[serde(default)]
    summary_bullets: Vec<String>,
    #[serde(default)]
    salience_notes: Vec<SalienceNote>,
}

#[derive(Debug, Deserialize)]
struct SalienceNote {
    fact: String,
    #[serde(default)]
    topic: String,
}

/// Splits history into pass-through recent turns and an LLM-compacted prefix.
pub struct HistoryCompactor {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_bullets: usize,
    max_notes: usize,
}

impl HistoryCompactor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        max_bullets: usize,
        max_notes: usize,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            max_bullets,
            max_notes,
        }
    }

    /// Compact `messages`, passing the last `recent_turns` through unchanged.
    ///
    /// Fails soft: on any LLM or parse failure the full history is returned
    /// as `recent` with empty bullets and notes, plus a diagnostic for the
    /// trace.
    pub async fn compact(
        &self,
        messages: &[Message],
        recent_turns: usize,
    ) -> (CompactedHistory, Option<String>) {
        let split = messages.len().saturating_sub(recent_turns);
        if split == 0 {
            return (
                CompactedHistory {
                    recent: messages.to_vec(),
                    ..Default::default()
                },
                None,
            );
        }

        let (older, recent) = messages.split_at(split);
        match self.summarize(older).await {
            Ok(output) => {
                let summary_bullets = output
                    .summary_bullets
                    .into_iter()
                    .filter(|b| !b.trim().is_empty())
                    .take(self.max_bullets)
                    .collect();
                let salience_notes = output
                    .salience_notes
                    .into_iter()
                    .filter(|n| !n.fact.trim().is_empty())
                    .take(self.max_notes)
                    .map(|n| {
                        if n.topic.trim().is_empty() {
                            n.fact
                        } else {
                            format!("{}: {}", n.topic, n.fact)
                        }
                    })
                    .collect();
                debug!(older = older.len(), recent = recent.len(), "compacted history");
                (
                    CompactedHistory {
                        recent: recent.to_vec(),
                        summary_bullets,
                        salience_notes,
                    },
                    None,
                )
            }
            Err(e) => {
                warn!("history compaction failed, passing history through: {e}");
                (
                    CompactedHistory {
                        recent: messages.to_vec(),
                        ..Default::default()
                    },
                    Some(format!("compaction failed: {e}")),
                )
            }
        }
    }

    async fn summarize(&self, older: &[Message]) -> crate::error::Result<CompactionOutput> {
        let mut transcript = String::new();
        for message in older {
            let role = match message.role {
                crate::types::Role::System => "system",
                crate::types::Role::User => "user",
                crate::types::Role::Assistant => "assistant",
            };
            transcript.push_str(&format!("{role}: {}\n", message.content));
        }

        let request = CompletionRequest::prompt(
            &self.model,
            COMPACTION_SYSTEM_PROMPT,
            format!("## Conversation to compress\n{transcript}"),
            COMPACTION_MAX_TOKENS,
        )
        .with_json_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "summary_bullets": {"type": "array", "items": {"type": "string"}},
                "salience_notes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "fact": {"type": "string"},
                            "topic": {"type": "string"}
                        },
                        "required": ["fact"]
                    }
                }
            },
            "required": ["summary_bullets", "salience_notes"]
        }));

        let completion = self.llm.complete(request).await?;
        parse_structured(&completion.text)
    }
}
