// src/pipeline/lazy.rs
// Summary-first references with deferred full-content loading

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::capabilities::retrieval::RetrievalClient;
use crate::error::Result;
use crate::tokens;
use crate::types::{ActivityStep, Reference};

/// A retrieval hit carried as a short summary, with the full chunk loadable
/// on demand. Loading never changes the reference identity: the summary-time
/// fields stay, only `content` is upgraded. `load_full` is idempotent and
/// safe to race.
#[derive(Clone)]
pub struct LazyReference {
    reference: Reference,
    pub summary: String,
    pub summary_tokens: u32,
    full: Arc<OnceCell<Reference>>,
    retrieval: Arc<dyn RetrievalClient>,
}

impl std::fmt::Debug for LazyReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyReference")
            .field("reference", &self.reference)
            .field("summary", &self.summary)
            .field("summary_tokens", &self.summary_tokens)
            .field("full", &self.full)
            .finish_non_exhaustive()
    }
}

impl LazyReference {
    pub fn id(&self) -> &str {
        &self.reference.id
    }

    pub fn is_loaded(&self) -> bool {
        self.full.initialized()
    }

    /// Fetch the full chunk by id, populating `content`. Subsequent calls
    /// return the cached result; `summary_tokens` never changes.
    pub async fn load_full(&self) -> Result<Reference> {
        let reference = &self.reference;
        let retrieval = &self.retrieval;
        let loaded = self
            .full
            .get_or_try_init(|| async {
                let mut full = retrieval.get_by_id(&reference.id).await?;
                if full.title.is_none() {
                    full.title = reference.title.clone();
                }
                if full.score.is_none() {
                    full.score = reference.score;
                }
                if full.url.is_none() {
                    full.url = reference.url.clone();
                }
                debug!(id = %reference.id, "lazy reference loaded");
                Ok::<_, crate::error::SibylError>(full)
            })
            .await?;
        Ok(loaded.clone())
    }

    /// The reference as currently known: full content when loaded, summary
    /// preview otherwise.
    pub fn current(&self) -> Reference {
        if let Some(full) = self.full.get() {
            return full.clone();
        }
        let mut preview = self.reference.clone();
        preview.content = Some(self.summary.clone());
        preview
    }
}

/// Wraps search hits into lazy references and coordinates bulk full loads.
pub struct LazyRetrievalManager {
    retrieval: Arc<dyn RetrievalClient>,
    summary_max_chars: usize,
}

impl LazyRetrievalManager {
    pub fn new(retrieval: Arc<dyn RetrievalClient>, summary_max_chars: usize) -> Self {
        Self {
            retrieval,
            summary_max_chars,
        }
    }

    /// Convert full hits into summary-only lazy references.
    pub fn wrap(&self, hits: Vec<Reference>) -> Vec<LazyReference> {
        hits.into_iter()
            .map(|mut hit| {
                let content = hit.content.take().unwrap_or_default();
                let summary: String = content.chars().take(self.summary_max_chars).collect();
                let summary_tokens = tokens::estimate_unchecked(&summary);
                LazyReference {
                    reference: hit,
                    summary,
                    summary_tokens,
                    full: Arc::new(OnceCell::new()),
                    retrieval: Arc::clone(&self.retrieval),
                }
            })
            .collect()
    }
}

/// Load every not-yet-loaded reference in parallel. Returns the ids that
/// were upgraded, the net token growth, and an activity step.
pub async fn load_all(references: &[LazyReference]) -> (Vec<String>, u32, ActivityStep) {
    let started = Instant::now();
    let pending: Vec<&LazyReference> = references.iter().filter(|r| !r.is_loaded()).collect();

    let results =
        futures::future::join_all(pending.iter().map(|reference| reference.load_full())).await;

    let mut loaded_ids = Vec::new();
    let mut tokens_added = 0u32;
    let mut errors = Vec::new();
    for (reference, result) in pending.iter().zip(results) {
        match result {
            Ok(full) => {
                let full_tokens =
                    tokens::estimate_unchecked(full.content.as_deref().unwrap_or(""));
                tokens_added += full_tokens.saturating_sub(reference.summary_tokens);
                loaded_ids.push(reference.id().to_string());
            }
            Err(e) => errors.push(format!("{}: {e}", reference.id())),
        }
    }

    let mut step = ActivityStep::new(
        "lazy_load",
        format!(
            "loaded {} of {} deferred references",
            loaded_ids.len(),
            pending.len()
        ),
    )
    .with_duration(started.elapsed().as_millis() as u64);
    if !errors.is_empty() {
        step = step.with_error(errors.join("; "));
    }

    (loaded_ids, tokens_added, step)
}
