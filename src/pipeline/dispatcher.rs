// src/pipeline/dispatcher.rs
// Retrieval dispatch: search fallback chain, web merge, optional rerank

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::capabilities::embedder::Embedder;
use crate::capabilities::retrieval::{RetrievalClient, SearchRequest};
use crate::config::SibylConfig;
use crate::error::{Result, SibylError};
use crate::events::{EventSink, SessionEvent};
use crate::pipeline::lazy::{LazyReference, LazyRetrievalManager};
use crate::pipeline::rerank;
use crate::pipeline::web_context::{WebContext, WebContextAssembler};
use crate::types::{
    last_user_message, ActivityStep, Message, Plan, PlanAction, Reference, RouteMetadata,
    WebResult,
};

/// Everything downstream stages need from retrieval.
#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Citation-ordered references; for the lazy path these carry summary
    /// previews as content until upgraded.
    pub references: Vec<Reference>,
    pub lazy_references: Vec<LazyReference>,
    pub web_results: Vec<WebResult>,
    pub activity: Vec<ActivityStep>,
    pub context_text: String,
    pub web_context_text: String,
    pub web_tokens: u32,
    pub web_trimmed: bool,
    pub source: String,
    pub retrieval_mode: String,
    /// Which stage of the fallback chain produced the hits
    /// (hybrid, hybrid_low_threshold, vector_fallback, none).
    pub search_mode: String,
    pub escalated: bool,
    pub fallback_reason: Option<String>,
}

struct ChainOutcome {
    hits: Vec<Reference>,
    mode: String,
    fallback_reason: Option<String>,
    activity: Vec<ActivityStep>,
    /// True when every attempted stage errored (capability down, not just
    /// empty).
    unavailable: bool,
}

/// Executes the retrieval side of a session: direct or lazy knowledge-base
/// search with a threshold fallback chain, optional web search, optional RRF
/// rerank, and context text assembly.
pub struct RetrievalDispatcher {
    retrieval: Arc<dyn RetrievalClient>,
    web: Option<WebContextAssembler>,
    embedder: Option<Arc<dyn Embedder>>,
    lazy: LazyRetrievalManager,
    config: Arc<SibylConfig>,
}

impl RetrievalDispatcher {
    pub fn new(
        retrieval: Arc<dyn RetrievalClient>,
        web: Option<WebContextAssembler>,
        embedder: Option<Arc<dyn Embedder>>,
        config: Arc<SibylConfig>,
    ) -> Self {
        let lazy = LazyRetrievalManager::new(Arc::clone(&retrieval), config.lazy_summary_max_chars);
        Self {
            retrieval,
            web,
            embedder,
            lazy,
            config,
        }
    }

    pub async fn dispatch(
        &self,
        plan: &Plan,
        route: &RouteMetadata,
        messages: &[Message],
        sink: &EventSink,
    ) -> Result<DispatchResult> {
        let base_query = last_user_message(messages);
        let query = plan.first_search_query().unwrap_or(base_query).to_string();

        let use_lazy = self.config.enable_lazy_retrieval && route.retriever_strategy.is_hybrid();
        let top = if use_lazy {
            self.config.lazy_prefetch_count
        } else {
            plan.steps
                .iter()
                .find(|s| matches!(s.action, PlanAction::VectorSearch | PlanAction::Both))
                .and_then(|s| s.k)
                .map(|k| k as usize)
                .unwrap_or(self.config.rag_top_k)
        };

        let chain = self.search_chain(&query, top).await;
        let mut activity = chain.activity;

        let (mut references, lazy_references, retrieval_mode) = if use_lazy {
            let lazy_refs = self.lazy.wrap(chain.hits);
            let previews = lazy_refs.iter().map(|r| r.current()).collect();
            (previews, lazy_refs, "lazy".to_string())
        } else {
            (chain.hits, Vec::new(), "direct".to_string())
        };

        // Web path: route strategy, explicit plan steps, or low planner
        // confidence (dual retrieval) all force it.
        let low_confidence = plan.confidence < self.config.planner_confidence_dual_retrieval;
        let invoke_web =
            route.retriever_strategy.includes_web() || plan.requests_web() || low_confidence;

        let mut web_ctx = WebContext::default();
        let mut web_unavailable = false;
        let mut escalated = false;
        if invoke_web {
            match &self.web {
                Some(assembler) => {
                    let (ctx, step) = assembler.gather(&query).await;
                    activity.push(step);
                    web_unavailable = ctx.failed;
                    escalated = low_confidence;
                    web_ctx = ctx;
                }
                None => {
                    activity.push(
                        ActivityStep::new("web_search", format!("web search for '{query}'"))
                            .with_error("web client not configured"),
                    );
                    web_unavailable = true;
                }
            }
        }

        // Both evidence sources down is a contract failure, not degradation.
        if chain.unavailable && web_ctx.results.is_empty() && (!invoke_web || web_unavailable) {
            return Err(SibylError::capability(
                "retrieval",
                "knowledge base unavailable and no web evidence",
            ));
        }

        let mut web_results = web_ctx.results;
        let mut lazy_references = lazy_references;
        if self.config.enable_web_reranking && !references.is_empty() && !web_results.is_empty() {
            let outcome = rerank::fuse(
                references,
                web_results,
                &query,
                self.embedder.as_ref(),
                &self.config,
            )
            .await;
            references = outcome.references;
            web_results = outcome.web_results;
            activity.push(outcome.activity);

            // Keep the lazy handles aligned with the surviving references.
            lazy_references
                .retain(|lazy| references.iter().any(|r| r.id == lazy.id()));
        }

        let context_text = build_context_text(&references);
        let source = match (!references.is_empty(), !web_results.is_empty()) {
            (true, true) => "knowledge_base+web",
            (true, false) => "knowledge_base",
            (false, true) => "web",
            (false, false) => "none",
        }
        .to_string();

        sink.emit(SessionEvent::Tool {
            retrieval_count: references.len(),
            web_count: web_results.len(),
        })
        .await;

        debug!(
            references = references.len(),
            web = web_results.len(),
            mode = %retrieval_mode,
            source = %source,
            escalated,
            "dispatch complete"
        );

        Ok(DispatchResult {
            references,
            lazy_references,
            web_results,
            activity,
            context_text,
            web_context_text: web_ctx.context_text,
            web_tokens: web_ctx.tokens,
            web_trimmed: web_ctx.trimmed,
            source,
            retrieval_mode,
            search_mode: chain.mode,
            escalated,
            fallback_reason: chain.fallback_reason,
        })
    }

    /// Hybrid search with threshold `T1`; below the minimum document count,
    /// retry with `T2`; still insufficient, fall back to pure vector search.
    async fn search_chain(&self, query: &str, top: usize) -> ChainOutcome {
        let mut activity = Vec::new();
        let mut attempted = 0u32;
        let mut errored = 0u32;

        let mut run_stage = |step: ActivityStep| activity.push(step);

        // Stage 1: hybrid at the primary threshold.
        let started = Instant::now();
        let t1 = self.config.reranker_threshold;
        let request = SearchRequest::new(query, top).with_threshold(t1);
        attempted += 1;
        let mut hits = match self.retrieval.hybrid_search(&request).await {
            Ok(hits) => {
                run_stage(
                    ActivityStep::new(
                        "retrieval",
                        format!("hybrid search (threshold {t1}): {} hits", hits.len()),
                    )
                    .with_duration(started.elapsed().as_millis() as u64),
                );
                hits
            }
            Err(e) => {
                warn!("hybrid search failed: {e}");
                errored += 1;
                run_stage(
                    ActivityStep::new("retrieval", format!("hybrid search (threshold {t1})"))
                        .with_error(e.to_string()),
                );
                Vec::new()
            }
        };
        let mut mode = "hybrid".to_string();

        // Stage 2: relaxed threshold.
        if hits.len() < self.config.retrieval_min_docs {
            let started = Instant::now();
            let t2 = self.config.retrieval_fallback_reranker_threshold;
            let request = SearchRequest::new(query, top).with_threshold(t2);
            attempted += 1;
            match self.retrieval.hybrid_search(&request).await {
                Ok(retry) => {
                    run_stage(
                        ActivityStep::new(
                            "retrieval_fallback",
                            format!("hybrid retry (threshold {t2}): {} hits", retry.len()),
                        )
                        .with_duration(started.elapsed().as_millis() as u64),
                    );
                    if retry.len() > hits.len() {
                        hits = retry;
                        mode = "hybrid_low_threshold".to_string();
                    }
                }
                Err(e) => {
                    warn!("hybrid retry failed: {e}");
                    errored += 1;
                    run_stage(
                        ActivityStep::new("retrieval_fallback", format!("hybrid retry (threshold {t2})"))
                            .with_error(e.to_string()),
                    );
                }
            }
        }

        // Stage 3: pure vector fallback.
        if hits.len() < self.config.retrieval_min_docs {
            let started = Instant::now();
            let request = SearchRequest::new(query, top);
            attempted += 1;
            match self.retrieval.vector_search(&request).await {
                Ok(fallback) => {
                    run_stage(
                        ActivityStep::new(
                            "vector_fallback",
                            format!("vector search: {} hits", fallback.len()),
                        )
                        .with_duration(started.elapsed().as_millis() as u64),
                    );
                    if fallback.len() > hits.len() {
                        hits = fallback;
                        mode = "vector_fallback".to_string();
                    }
                }
                Err(e) => {
                    warn!("vector fallback failed: {e}");
                    errored += 1;
                    run_stage(
                        ActivityStep::new("vector_fallback", "vector search")
                            .with_error(e.to_string()),
                    );
                }
            }
        }

        let fallback_reason = if hits.is_empty() {
            mode = "none".to_string();
            Some("no documents matched after full fallback chain".to_string())
        } else {
            None
        };

        ChainOutcome {
            hits,
            mode,
            fallback_reason,
            activity,
            unavailable: attempted > 0 && errored == attempted,
        }
    }

    /// The retrieval mode string of the last chain run is carried in
    /// `DispatchResult::retrieval_mode`; expose the chain for the
    /// decomposer's per-sub-query searches.
    pub async fn search_for_subquery(&self, query: &str) -> (Vec<Reference>, Vec<ActivityStep>) {
        let chain = self.search_chain(query, self.config.rag_top_k).await;
        (chain.hits, chain.activity)
    }
}

/// Number references `[1]..[N]` in citation order.
pub fn build_context_text(references: &[Reference]) -> String {
    let mut text = String::new();
    for (index, reference) in references.iter().enumerate() {
        let title = reference.title.as_deref().unwrap_or(&reference.id);
        let content = reference.content.as_deref().unwrap_or("");
        text.push_str(&format!("[{}] {title}\n{content}\n\n", index + 1));
    }
    text
}
