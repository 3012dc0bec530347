// src/pipeline/rerank.rs
// Reciprocal rank fusion across knowledge-base and web evidence

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::capabilities::embedder::{cosine_similarity, Embedder};
use crate::config::SibylConfig;
use crate::types::{ActivityStep, Reference, WebResult};

/// Outcome of fusing the two evidence lists. Each list keeps only the
/// documents surviving the combined top-k, reordered by fused score.
#[derive(Debug)]
pub struct RerankOutcome {
    pub references: Vec<Reference>,
    pub web_results: Vec<WebResult>,
    pub activity: ActivityStep,
}

enum DocSource {
    Kb(usize),
    Web(usize),
}

/// Fuse references and web results with RRF: `score(d) = Σ 1/(k + rank)`.
/// With semantic boost enabled and an embedder available, the final score is
/// `rrf·(1−w) + cos(query, doc)·w`.
pub async fn fuse(
    references: Vec<Reference>,
    web_results: Vec<WebResult>,
    query: &str,
    embedder: Option<&Arc<dyn Embedder>>,
    config: &SibylConfig,
) -> RerankOutcome {
    let started = Instant::now();
    let k = config.rrf_k_constant;

    let mut docs: Vec<(DocSource, f32)> = Vec::new();
    for (index, _) in references.iter().enumerate() {
        docs.push((DocSource::Kb(index), 1.0 / (k + (index as f32 + 1.0))));
    }
    for (index, _) in web_results.iter().enumerate() {
        docs.push((DocSource::Web(index), 1.0 / (k + (index as f32 + 1.0))));
    }

    // Optional semantic boost against the query.
    if config.enable_semantic_boost {
        if let Some(embedder) = embedder {
            let mut texts = vec![query.to_string()];
            for reference in &references {
                texts.push(reference.content.clone().unwrap_or_default());
            }
            for result in &web_results {
                texts.push(result.body.clone().unwrap_or_else(|| result.snippet.clone()));
            }
            match embedder.embed(&texts).await {
                Ok(vectors) if vectors.len() == texts.len() => {
                    let query_vec = &vectors[0];
                    let weight = config.semantic_boost_weight;
                    for (position, (_, score)) in docs.iter_mut().enumerate() {
                        let similarity = cosine_similarity(query_vec, &vectors[position + 1]);
                        *score = *score * (1.0 - weight) + similarity * weight;
                    }
                }
                Ok(_) => warn!("semantic boost skipped: embedding count mismatch"),
                Err(e) => warn!("semantic boost skipped: {e}"),
            }
        }
    }

    docs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    docs.truncate(config.reranking_top_k);

    let mut kept_refs = Vec::new();
    let mut kept_web = Vec::new();
    for (source, _) in &docs {
        match source {
            DocSource::Kb(index) => kept_refs.push(references[*index].clone()),
            DocSource::Web(index) => kept_web.push(web_results[*index].clone()),
        }
    }

    debug!(
        kb_in = references.len(),
        web_in = web_results.len(),
        kb_out = kept_refs.len(),
        web_out = kept_web.len(),
        "reciprocal rank fusion"
    );

    let activity = ActivityStep::new(
        "rerank",
        format!(
            "rrf fused {} kb + {} web into top {}",
            references.len(),
            web_results.len(),
            docs.len()
        ),
    )
    .with_duration(started.elapsed().as_millis() as u64);

    RerankOutcome {
        references: kept_refs,
        web_results: kept_web,
        activity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reference(id: &str) -> Reference {
        Reference {
            id: id.into(),
            content: Some(format!("content of {id}")),
            ..Default::default()
        }
    }

    fn web(id: &str, rank: u32) -> WebResult {
        WebResult {
            id: id.into(),
            title: id.into(),
            url: format!("https://example.com/{id}"),
            snippet: format!("snippet of {id}"),
            body: None,
            rank,
            relevance: None,
            fetched_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn test_rrf_scores_by_rank() {
        // rank 1 in each source scores 1/(60+1); rank 2 scores 1/(60+2).
        let score_1 = 1.0f32 / 61.0;
        let score_2 = 1.0f32 / 62.0;
        assert!(score_1 > score_2);
    }

    #[tokio::test]
    async fn test_fusion_keeps_top_k() {
        let config = SibylConfig {
            reranking_top_k: 3,
            ..Default::default()
        };
        let refs: Vec<Reference> = (0..4).map(|i| reference(&format!("d{i}"))).collect();
        let webs: Vec<WebResult> = (0..4).map(|i| web(&format!("w{i}"), i + 1)).collect();

        let outcome = fuse(refs, webs, "query", None, &config).await;
        assert_eq!(outcome.references.len() + outcome.web_results.len(), 3);
        // The first-ranked documents of each source survive.
        assert_eq!(outcome.references[0].id, "d0");
        assert_eq!(outcome.web_results[0].id, "w0");
    }

    #[tokio::test]
    async fn test_fusion_preserves_score_order() {
        let config = SibylConfig {
            reranking_top_k: 10,
            ..Default::default()
        };
        let refs: Vec<Reference> = (0..3).map(|i| reference(&format!("d{i}"))).collect();
        let outcome = fuse(refs, vec![], "query", None, &config).await;

        let ids: Vec<&str> = outcome.references.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
        assert!(outcome.web_results.is_empty());
    }
}
