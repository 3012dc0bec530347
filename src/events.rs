// src/events.rs
// Session event stream consumed by the streaming transport

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::trace::SessionTrace;
use crate::types::{
    ActivityStep, ContextBudget, CritiqueAction, Intent, Reference, SubQuery, UsageTotals,
    WebResult,
};

/// Events emitted during one session, totally ordered per session. `done` is
/// always the final event; streaming consumers see either `complete` + `done`
/// or `error` + `done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Route {
        intent: Intent,
        model: String,
        confidence: f32,
        reasoning: String,
    },
    Status {
        stage: String,
    },
    Context {
        #[serde(flatten)]
        budget: ContextBudget,
    },
    Plan {
        confidence: f32,
        steps: Vec<crate::types::PlanStep>,
    },
    Decomposition {
        sub_queries: Vec<SubQuery>,
        synthesis_prompt: String,
    },
    Tool {
        retrieval_count: usize,
        web_count: usize,
    },
    Activity {
        steps: Vec<ActivityStep>,
    },
    WebContext {
        tokens: u32,
        trimmed: bool,
        results: Vec<WebResult>,
    },
    Citations {
        references: Vec<Reference>,
    },
    Token {
        delta: String,
    },
    Critique {
        grounded: bool,
        coverage: f32,
        action: CritiqueAction,
        issues: Vec<String>,
        attempt: u32,
    },
    LazyLoad {
        ids: Vec<String>,
        tokens_added: u32,
    },
    SemanticMemory {
        recalled: usize,
        entries: Vec<String>,
    },
    Complete {
        answer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageTotals>,
    },
    Telemetry {
        trace: SessionTrace,
    },
    Trace {
        trace: SessionTrace,
    },
    Error {
        message: String,
        stage: String,
    },
    Done,
}

impl SessionEvent {
    /// Canonical event name, as seen on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Route { .. } => "route",
            Self::Status { .. } => "status",
            Self::Context { .. } => "context",
            Self::Plan { .. } => "plan",
            Self::Decomposition { .. } => "decomposition",
            Self::Tool { .. } => "tool",
            Self::Activity { .. } => "activity",
            Self::WebContext { .. } => "web_context",
            Self::Citations { .. } => "citations",
            Self::Token { .. } => "token",
            Self::Critique { .. } => "critique",
            Self::LazyLoad { .. } => "lazy_load",
            Self::SemanticMemory { .. } => "semantic_memory",
            Self::Complete { .. } => "complete",
            Self::Telemetry { .. } => "telemetry",
            Self::Trace { .. } => "trace",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

/// Emission seam for session events.
///
/// Streaming sessions attach a bounded channel; synchronous sessions use a
/// null sink that drops everything. Sends are backpressure-aware and never
/// fail the pipeline: a closed receiver just means nobody is listening.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSink {
    /// Sink backed by a bounded channel; returns the receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that swallows all events (synchronous endpoint).
    pub fn null() -> Self {
        Self { tx: None }
    }

    pub async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_canonical() {
        assert_eq!(SessionEvent::Done.name(), "done");
        assert_eq!(
            SessionEvent::Token {
                delta: "x".into()
            }
            .name(),
            "token"
        );
        assert_eq!(
            SessionEvent::LazyLoad {
                ids: vec![],
                tokens_added: 0
            }
            .name(),
            "lazy_load"
        );
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::Status {
            stage: "planning".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["stage"], "planning");
    }

    #[tokio::test]
    async fn test_null_sink_never_blocks() {
        let sink = EventSink::null();
        sink.emit(SessionEvent::Done).await;
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(SessionEvent::Status {
            stage: "a".into(),
        })
        .await;
        sink.emit(SessionEvent::Done).await;
        drop(sink);

        assert_eq!(rx.recv().await.unwrap().name(), "status");
        assert_eq!(rx.recv().await.unwrap().name(), "done");
        assert!(rx.recv().await.is_none());
    }
}
