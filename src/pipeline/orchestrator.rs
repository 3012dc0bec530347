// src/pipeline/orchestrator.rs
// Session orchestrator: drives route → compact → plan → dispatch →
// synthesize → critique, owns the critic loop and the lazy-upgrade feedback

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::embedder::Embedder;
use crate::capabilities::llm::LlmClient;
use crate::capabilities::retrieval::RetrievalClient;
use crate::capabilities::web::WebClient;
use crate::config::SibylConfig;
use crate::context::budget::{budget_sections, truncate_text, SectionCaps};
use crate::context::compactor::HistoryCompactor;
use crate::context::selector::select_summaries;
use crate::error::{Result, SibylError};
use crate::events::{EventSink, SessionEvent};
use crate::memory::semantic::{MemoryKind, MemoryScope, RecallOptions, SemanticMemoryStore};
use crate::memory::short_term::ShortTermMemory;
use crate::pipeline::critic::Critic;
use crate::pipeline::decomposer::{DecompositionOutcome, QueryDecomposer};
use crate::pipeline::dispatcher::{build_context_text, DispatchResult, RetrievalDispatcher};
use crate::pipeline::lazy;
use crate::pipeline::planner::Planner;
use crate::pipeline::router::IntentRouter;
use crate::pipeline::synthesizer::{SynthesisRequest, Synthesizer};
use crate::pipeline::web_context::{build_web_text, WebContextAssembler};
use crate::tokens;
use crate::trace::SessionTrace;
use crate::types::{
    last_user_message, ChatResponse, ContextSections, CriticReport, Critique, CritiqueAction,
    Evaluation, Message, ResponseMetadata, RetrievalDiagnostics, UsageTotals, NO_ANSWER,
};

static CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());

/// How the caller consumes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Request/response; subject to the global deadline.
    Sync,
    /// Long-lived event stream; exempt from the global deadline.
    Streaming,
}

/// Drives one full session per `run_session` call. Shared stores are safe
/// for concurrent sessions; everything else is per-session state owned by
/// the running task.
pub struct Orchestrator {
    config: Arc<SibylConfig>,
    llm: Arc<dyn LlmClient>,
    retrieval: Arc<dyn RetrievalClient>,
    web: Option<Arc<dyn WebClient>>,
    embedder: Option<Arc<dyn Embedder>>,
    short_term: Arc<ShortTermMemory>,
    semantic_memory: Option<Arc<SemanticMemoryStore>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<SibylConfig>,
        llm: Arc<dyn LlmClient>,
        retrieval: Arc<dyn RetrievalClient>,
    ) -> Self {
        let short_term = Arc::new(ShortTermMemory::new(config.short_term_max_items));
        Self {
            config,
            llm,
            retrieval,
            web: None,
            embedder: None,
            short_term,
            semantic_memory: None,
        }
    }

    pub fn with_web(mut self, web: Arc<dyn WebClient>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_semantic_memory(mut self, store: Arc<SemanticMemoryStore>) -> Self {
        self.semantic_memory = Some(store);
        self
    }

    /// Run one session end to end, emitting events through `sink`. The
    /// stream always terminates with `complete` + `done` or `error` + `done`.
    pub async fn run_session(
        &self,
        messages: Vec<Message>,
        mode: SessionMode,
        session_id: Option<String>,
        sink: EventSink,
    ) -> Result<ChatResponse> {
        self.run_session_with_cancel(messages, mode, session_id, sink, CancellationToken::new())
            .await
    }

    /// As `run_session`, with cooperative cancellation (used by transports
    /// when the client goes away).
    pub async fn run_session_with_cancel(
        &self,
        messages: Vec<Message>,
        mode: SessionMode,
        session_id: Option<String>,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<ChatResponse> {
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derive_session_id(&messages));
        let mut trace = SessionTrace::new(&session_id);
        info!(session_id = %session_id, ?mode, "session started");

        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        let result = {
            let work = async {
                match mode {
                    SessionMode::Sync => {
                        match tokio::time::timeout(
                            deadline,
                            self.run_pipeline(&messages, &session_id, &sink, &mut trace),
                        )
                        .await
                        {
                            Ok(inner) => inner,
                            Err(_) => Err(SibylError::Timeout(format!(
                                "session exceeded {}ms deadline",
                                self.config.request_timeout_ms
                            ))),
                        }
                    }
                    SessionMode::Streaming => {
                        self.run_pipeline(&messages, &session_id, &sink, &mut trace)
                            .await
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(SibylError::Timeout("session cancelled".into())),
                result = work => result,
            }
        };

        match result {
            Ok(response) => {
                emit(
                    &sink,
                    &mut trace,
                    SessionEvent::Complete {
                        answer: response.answer.clone(),
                        usage: Some(response.metadata.usage),
                    },
                )
                .await;
                trace.usage = response.metadata.usage;
                trace.finish();
                let snapshot = trace.clone();
                emit(&sink, &mut trace, SessionEvent::Telemetry { trace: snapshot }).await;
                let snapshot = trace.clone();
                emit(&sink, &mut trace, SessionEvent::Trace { trace: snapshot }).await;
                emit(&sink, &mut trace, SessionEvent::Done).await;
                info!(session_id = %trace.session_id, "session complete");
                Ok(response)
            }
            Err(e) => {
                warn!(session_id = %trace.session_id, "session failed: {e}");
                trace.finish();
                emit(
                    &sink,
                    &mut trace,
                    SessionEvent::Error {
                        message: e.to_string(),
                        stage: e.stage().to_string(),
                    },
                )
                .await;
                emit(&sink, &mut trace, SessionEvent::Done).await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        messages: &[Message],
        session_id: &str,
        sink: &EventSink,
        trace: &mut SessionTrace,
    ) -> Result<ChatResponse> {
        let question = last_user_message(messages).to_string();

        // ------------------------------------------------------------------
        // Route
        // ------------------------------------------------------------------
        emit(sink, trace, SessionEvent::Status { stage: "routing".into() }).await;
        let prior = self.short_term.load(session_id, None).await;
        let prior_summary = prior
            .summary_bullets
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let router = IntentRouter::new(Arc::clone(&self.llm), Arc::clone(&self.config));
        let (route, route_diag) = router.route(&question, &prior_summary).await;
        if let Some(diag) = route_diag {
            trace.diagnostic("router", diag);
        }
        trace.route = Some(route.clone());
        emit(
            sink,
            trace,
            SessionEvent::Route {
                intent: route.intent,
                model: route.model.clone(),
                confidence: route.confidence,
                reasoning: route.reasoning.clone(),
            },
        )
        .await;

        // ------------------------------------------------------------------
        // Compact history and refresh memory
        // ------------------------------------------------------------------
        emit(sink, trace, SessionEvent::Status { stage: "compacting".into() }).await;
        let compactor = HistoryCompactor::new(
            Arc::clone(&self.llm),
            &self.config.model_small,
            self.config.context_max_summary_items,
            self.config.context_max_salience_items,
        );
        let (compacted, compaction_diag) = compactor
            .compact(messages, self.config.context_max_recent_turns)
            .await;
        if let Some(diag) = compaction_diag {
            trace.diagnostic("compactor", diag);
        }
        let turn = messages.len() as u32;
        self.short_term.upsert(session_id, turn, &compacted).await;

        let mut recalled_texts: Vec<String> = Vec::new();
        if self.config.enable_semantic_memory {
            if let Some(store) = &self.semantic_memory {
                let mut options = RecallOptions::new(
                    self.config.semantic_memory_recall_k,
                    self.config.semantic_memory_min_similarity,
                );
                options.session_id = Some(session_id.to_string());
                options.max_age_days = Some(self.config.semantic_memory_prune_age_days);
                let entries = store.recall(&question, &options).await;
                recalled_texts = entries.iter().map(|e| e.text.clone()).collect();
                emit(
                    sink,
                    trace,
                    SessionEvent::SemanticMemory {
                        recalled: entries.len(),
                        entries: recalled_texts.clone(),
                    },
                )
                .await;
            }
        }

        // ------------------------------------------------------------------
        // Select summaries, assemble sections, budget
        // ------------------------------------------------------------------
        if self.config.enable_semantic_summary {
            if let Some(embedder) = &self.embedder {
                self.short_term.embed_missing(session_id, embedder).await;
            }
        }
        let memory = self.short_term.load(session_id, None).await;
        let selection = select_summaries(
            &question,
            &memory.summary_bullets,
            self.config.context_max_summary_items,
            self.embedder.as_ref(),
            self.config.enable_semantic_summary,
        )
        .await;

        // Recalled memories merge into salience and share its cap.
        let mut salience = memory.salience_notes.clone();
        salience.extend(recalled_texts);
        let max_salience = self.config.context_max_salience_items;
        if salience.len() > max_salience {
            salience.drain(..salience.len() - max_salience);
        }

        let sections = ContextSections {
            history: compacted.recent.clone(),
            summary: selection.selected.clone(),
            salience,
            web: String::new(),
        };
        let caps = SectionCaps::from_config(&self.config);
        let (budgeted, mut budget) = budget_sections(&sections, &caps);
        trace.context_budget = budget;
        emit(sink, trace, SessionEvent::Context { budget }).await;

        // ------------------------------------------------------------------
        // Plan
        // ------------------------------------------------------------------
        emit(sink, trace, SessionEvent::Status { stage: "planning".into() }).await;
        let planner = Planner::new(Arc::clone(&self.llm));
        let history_summary = budgeted.summary.join("\n");
        let (plan, plan_diag) = planner.plan(&question, &route, &history_summary).await;
        if let Some(diag) = plan_diag {
            trace.diagnostic("planner", diag);
        }
        trace.plan = Some(plan.clone());
        emit(
            sink,
            trace,
            SessionEvent::Plan {
                confidence: plan.confidence,
                steps: plan.steps.clone(),
            },
        )
        .await;

        // ------------------------------------------------------------------
        // Gather evidence: decomposition or plain dispatch
        // ------------------------------------------------------------------
        emit(sink, trace, SessionEvent::Status { stage: "retrieving".into() }).await;
        let web_assembler = self
            .web
            .as_ref()
            .map(|web| WebContextAssembler::new(Arc::clone(web), Arc::clone(&self.config)));
        let dispatcher = RetrievalDispatcher::new(
            Arc::clone(&self.retrieval),
            web_assembler,
            self.embedder.clone(),
            Arc::clone(&self.config),
        );

        let mut dispatch: Option<DispatchResult> = None;
        let complexity = QueryDecomposer::assess_complexity(&question);
        if self.config.enable_query_decomposition
            && complexity >= self.config.decomposition_complexity_threshold
        {
            let decomposer = QueryDecomposer::new(
                Arc::clone(&self.llm),
                self.web.clone(),
                Arc::clone(&self.config),
            );
            match decomposer.decompose(&question, &route.model).await {
                (Some(decomposition), _) => {
                    emit(
                        sink,
                        trace,
                        SessionEvent::Decomposition {
                            sub_queries: decomposition.sub_queries.clone(),
                            synthesis_prompt: decomposition.synthesis_prompt.clone(),
                        },
                    )
                    .await;
                    let outcome = decomposer.execute(decomposition, &dispatcher).await;
                    let result = self.synthetic_dispatch(outcome);
                    sink.emit(SessionEvent::Tool {
                        retrieval_count: result.references.len(),
                        web_count: result.web_results.len(),
                    })
                    .await;
                    trace.events.push("tool".into());
                    dispatch = Some(result);
                }
                (None, diag) => {
                    if let Some(diag) = diag {
                        trace.diagnostic("decomposer", diag);
                    }
                }
            }
        }

        let mut dispatch = match dispatch {
            Some(result) => result,
            None => {
                let result = dispatcher.dispatch(&plan, &route, messages, sink).await?;
                trace.events.push("tool".into());
                result
            }
        };

        emit(
            sink,
            trace,
            SessionEvent::Activity {
                steps: dispatch.activity.clone(),
            },
        )
        .await;
        emit(
            sink,
            trace,
            SessionEvent::WebContext {
                tokens: dispatch.web_tokens,
                trimmed: dispatch.web_trimmed,
                results: dispatch.web_results.clone(),
            },
        )
        .await;
        emit(
            sink,
            trace,
            SessionEvent::Citations {
                references: dispatch.references.clone(),
            },
        )
        .await;

        budget.web_tokens = dispatch.web_tokens;
        budget.total_tokens = budget.history_tokens
            + budget.summary_tokens
            + budget.salience_tokens
            + budget.web_tokens;
        trace.context_budget = budget;

        // ------------------------------------------------------------------
        // Synthesize under the critic loop
        // ------------------------------------------------------------------
        let empty_evidence =
            dispatch.references.is_empty() && dispatch.web_results.is_empty();
        let synthesizer = Synthesizer::new(Arc::clone(&self.llm));
        let critic = Critic::new(
            Arc::clone(&self.llm),
            &self.config.model_small,
            self.config.critic_threshold,
        );

        let mut usage = UsageTotals::default();
        let mut critique_history: Vec<Critique> = Vec::new();
        let mut critic_error = false;
        let mut attempts = 0u32;
        let mut answer;

        if empty_evidence {
            // Synthesis is bypassed entirely on empty evidence.
            debug!("no evidence gathered, answering with the grounding fallback");
            answer = NO_ANSWER.to_string();
        } else {
            let conversation_context = render_conversation_context(&budgeted);
            let mut context_text = dispatch.context_text.clone();
            let mut revision_notes: Vec<String> = Vec::new();
            let mut lazy_upgraded = false;
            let max_attempts = self.config.critic_max_retries + 1;

            loop {
                attempts += 1;
                emit(sink, trace, SessionEvent::Status { stage: "synthesizing".into() }).await;
                let request = SynthesisRequest {
                    question: question.clone(),
                    conversation_context: conversation_context.clone(),
                    context_text: context_text.clone(),
                    web_context_text: dispatch.web_context_text.clone(),
                    revision_notes: revision_notes.clone(),
                    model: route.model.clone(),
                    max_tokens: route.max_tokens,
                };
                let completion = synthesizer.synthesize(&request, sink).await?;
                if !completion.text.is_empty() {
                    trace.events.push("token".into());
                }
                if let Some(u) = completion.usage {
                    usage.add(&u);
                }
                answer = completion.text;

                if !self.config.enable_critic {
                    break;
                }

                emit(sink, trace, SessionEvent::Status { stage: "critiquing".into() }).await;
                let evidence = format!("{context_text}\n{}", dispatch.web_context_text);
                let (critique, this_error) = critic.critique(&question, &answer, &evidence).await;
                critic_error |= this_error;
                critique_history.push(critique.clone());
                emit(
                    sink,
                    trace,
                    SessionEvent::Critique {
                        grounded: critique.grounded,
                        coverage: critique.coverage,
                        action: critique.action,
                        issues: critique.issues.clone(),
                        attempt: attempts,
                    },
                )
                .await;

                if critique.action == CritiqueAction::Accept
                    || critique.coverage >= self.config.critic_threshold
                {
                    break;
                }
                if attempts >= max_attempts {
                    debug!("critic retries exhausted, keeping last draft");
                    break;
                }

                // Lazy upgrade: once per session, when coverage is poor and
                // deferred content is still available. Does not add revision
                // notes.
                if !lazy_upgraded
                    && critique.coverage < self.config.lazy_load_threshold
                    && dispatch.lazy_references.iter().any(|r| !r.is_loaded())
                {
                    let (ids, tokens_added, step) =
                        lazy::load_all(&dispatch.lazy_references).await;
                    dispatch.activity.push(step);
                    emit(sink, trace, SessionEvent::LazyLoad { ids, tokens_added }).await;

                    dispatch.references = dispatch
                        .lazy_references
                        .iter()
                        .map(|r| r.current())
                        .collect();
                    context_text = build_context_text(&dispatch.references);
                    lazy_upgraded = true;
                    continue;
                }

                revision_notes = critique.issues.clone();
            }
        }

        // ------------------------------------------------------------------
        // Finalize: citations, memory write, response assembly
        // ------------------------------------------------------------------
        let answer = sanitize_citations(&answer, dispatch.references.len());
        let citations = if answer == NO_ANSWER {
            Vec::new()
        } else {
            dispatch.references.clone()
        };

        if answer != NO_ANSWER && self.config.enable_semantic_memory {
            if let Some(store) = &self.semantic_memory {
                let coverage = critique_history.last().map(|c| c.coverage).unwrap_or(1.0);
                let scope = MemoryScope {
                    session_id: Some(session_id.to_string()),
                    user_id: None,
                    tags: vec![route.intent.as_str().to_string()],
                };
                let written = store
                    .add(
                        &format!("Q: {question}\nA: {answer}"),
                        MemoryKind::Episodic,
                        serde_json::json!({
                            "coverage": coverage,
                            "confidence": plan.confidence,
                        }),
                        &scope,
                    )
                    .await;
                if written.is_none() {
                    trace.diagnostic("memory", "episodic write skipped");
                }
            }
        }

        let evaluation = match critique_history.last() {
            Some(last) => Evaluation {
                grounded: last.grounded,
                coverage: last.coverage,
                attempts,
            },
            None if answer == NO_ANSWER => Evaluation {
                grounded: false,
                coverage: 0.0,
                attempts,
            },
            None => Evaluation {
                grounded: true,
                coverage: 1.0,
                attempts,
            },
        };
        let critic_report = if critique_history.is_empty() {
            None
        } else {
            Some(CriticReport {
                iterations: critique_history.len() as u32,
                history: critique_history.clone(),
                critic_error,
            })
        };

        trace.critiques = critique_history;
        trace.critic_error = critic_error;
        let retrieval_diag = RetrievalDiagnostics {
            source: dispatch.source.clone(),
            retrieval_mode: format!("{} ({})", dispatch.retrieval_mode, dispatch.search_mode),
            escalated: dispatch.escalated,
            fallback_reason: dispatch.fallback_reason.clone(),
            reference_count: dispatch.references.len(),
            web_count: dispatch.web_results.len(),
        };
        trace.retrieval = Some(retrieval_diag.clone());

        Ok(ChatResponse {
            answer,
            citations,
            activity: dispatch.activity,
            metadata: ResponseMetadata {
                plan,
                context_budget: budget,
                critic_report,
                evaluation,
                route: Some(route),
                retrieval: Some(retrieval_diag),
                usage,
            },
        })
    }

    /// Turn a decomposition outcome into the dispatch shape the rest of the
    /// pipeline consumes.
    fn synthetic_dispatch(&self, outcome: DecompositionOutcome) -> DispatchResult {
        let context_text = build_context_text(&outcome.references);
        let raw_web = build_web_text(&outcome.web_results);
        let (web_context_text, web_trimmed) =
            truncate_text(&raw_web, self.config.web_context_max_tokens);
        let web_tokens = tokens::estimate_unchecked(&web_context_text);
        let source = match (!outcome.references.is_empty(), !outcome.web_results.is_empty()) {
            (true, true) => "knowledge_base+web",
            (true, false) => "knowledge_base",
            (false, true) => "web",
            (false, false) => "none",
        }
        .to_string();

        DispatchResult {
            references: outcome.references,
            lazy_references: Vec::new(),
            web_results: outcome.web_results,
            activity: outcome.activity,
            context_text,
            web_context_text,
            web_tokens,
            web_trimmed,
            source,
            retrieval_mode: "decomposed".into(),
            search_mode: "hybrid".into(),
            escalated: false,
            fallback_reason: None,
        }
    }
}

/// Render the budgeted sections into the conversation block of the
/// synthesis prompt.
fn render_conversation_context(sections: &ContextSections) -> String {
    let mut text = String::new();
    if !sections.history.is_empty() {
        text.push_str("Recent turns:\n");
        for message in &sections.history {
            let role = match message.role {
                crate::types::Role::System => "system",
                crate::types::Role::User => "user",
                crate::types::Role::Assistant => "assistant",
            };
            text.push_str(&format!("{role}: {}\n", message.content));
        }
    }
    if !sections.summary.is_empty() {
        text.push_str("Summary:\n");
        for bullet in &sections.summary {
            text.push_str(&format!("- {bullet}\n"));
        }
    }
    if !sections.salience.is_empty() {
        text.push_str("Known facts:\n");
        for note in &sections.salience {
            text.push_str(&format!("- {note}\n"));
        }
    }
    text
}

async fn emit(sink: &EventSink, trace: &mut SessionTrace, event: SessionEvent) {
    trace.events.push(event.name().to_string());
    sink.emit(event).await;
}

/// Deterministic session id from the ordered message contents.
fn derive_session_id(messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update([message.role as u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut id = String::from("sess-");
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Strip citation markers pointing outside the final reference list.
fn sanitize_citations(answer: &str, citation_count: usize) -> String {
    CITATION_RE
        .replace_all(answer, |caps: &regex::Captures<'_>| {
            let index: usize = caps[1].parse().unwrap_or(0);
            if index >= 1 && index <= citation_count {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_deterministic() {
        let messages = vec![Message::user("What is the capital of France?")];
        assert_eq!(derive_session_id(&messages), derive_session_id(&messages));
    }

    #[test]
    fn test_session_id_differs_by_content() {
        let a = derive_session_id(&[Message::user("a")]);
        let b = derive_session_id(&[Message::user("b")]);
        assert_ne!(a, b);
        assert!(a.starts_with("sess-"));
    }

    #[test]
    fn test_sanitize_keeps_valid_citations() {
        assert_eq!(sanitize_citations("Paris [1] and Lyon [2].", 2), "Paris [1] and Lyon [2].");
    }

    #[test]
    fn test_sanitize_strips_out_of_range() {
        assert_eq!(sanitize_citations("Paris [1] and Atlantis [7].", 1), "Paris [1] and Atlantis .");
        assert_eq!(sanitize_citations("Zero [0] is invalid.", 3), "Zero  is invalid.");
    }
}
