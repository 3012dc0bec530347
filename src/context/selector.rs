// src/context/selector.rs
// Choose which summary bullets enter the context

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::embedder::{cosine_similarity, Embedder};
use crate::memory::short_term::SummaryBullet;

/// How the selection was made and what it kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionStats {
    pub mode: String,
    pub total_candidates: usize,
    pub selected_count: usize,
    pub discarded_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub selected: Vec<String>,
    pub stats: SelectionStats,
}

/// Select up to `max_items` bullets for the context. Uses semantic similarity
/// against cached bullet embeddings when enabled and available, otherwise
/// falls back to recency. Never fails: missing embeddings or an embedding
/// error just mean the recency path.
pub async fn select_summaries(
    query: &str,
    bullets: &[SummaryBullet],
    max_items: usize,
    embedder: Option<&Arc<dyn Embedder>>,
    semantic_enabled: bool,
) -> SelectionResult {
    if bullets.is_empty() || max_items == 0 {
        return SelectionResult {
            selected: vec![],
            stats: SelectionStats {
                mode: "recency".into(),
                total_candidates: bullets.len(),
                selected_count: 0,
                discarded_count: bullets.len(),
                max_score: None,
                min_score: None,
                mean_score: None,
            },
        };
    }

    if semantic_enabled {
        if let Some(embedder) = embedder {
            if bullets.iter().any(|b| b.embedding.is_some()) {
                match embedder.embed(&[query.to_string()]).await {
                    Ok(vectors) if !vectors.is_empty() => {
                        return semantic_select(&vectors[0], bullets, max_items);
                    }
                    Ok(_) => warn!("query embedding empty, using recency selection"),
                    Err(e) => warn!("query embedding failed, using recency selection: {e}"),
                }
            } else {
                debug!("no cached bullet embeddings, using recency selection");
            }
        }
    }

    recency_select(bullets, max_items)
}

fn semantic_select(
    query_embedding: &[f32],
    bullets: &[SummaryBullet],
    max_items: usize,
) -> SelectionResult {
    let mut scored: Vec<(usize, f32)> = bullets
        .iter()
        .enumerate()
        .map(|(i, bullet)| {
            let score = bullet
                .embedding
                .as_deref()
                .map(|e| cosine_similarity(query_embedding, e))
                .unwrap_or(0.0);
            (i, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let kept = &scored[..max_items.min(scored.len())];

    let scores: Vec<f32> = kept.iter().map(|(_, s)| *s).collect();
    let max_score = scores.iter().cloned().fold(None, |acc: Option<f32>, s| {
        Some(acc.map_or(s, |m| m.max(s)))
    });
    let min_score = scores.iter().cloned().fold(None, |acc: Option<f32>, s| {
        Some(acc.map_or(s, |m| m.min(s)))
    });
    let mean_score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    };

    // Keep selected bullets in conversation order.
    let mut indices: Vec<usize> = kept.iter().map(|(i, _)| *i).collect();
    indices.sort_unstable();
    let selected: Vec<String> = indices.iter().map(|&i| bullets[i].text.clone()).collect();

    SelectionResult {
        stats: SelectionStats {
            mode: "semantic".into(),
            total_candidates: bullets.len(),
            selected_count: selected.len(),
            discarded_count: bullets.len() - selected.len(),
            max_score,
            min_score,
            mean_score,
        },
        selected,
    }
}

fn recency_select(bullets: &[SummaryBullet], max_items: usize) -> SelectionResult {
    let mut indexed: Vec<(usize, u32)> = bullets.iter().map(|b| b.turn).enumerate().collect();
    indexed.sort_by(|a, b| b.1.cmp(&a.1));
    let mut indices: Vec<usize> = indexed
        .into_iter()
        .take(max_items)
        .map(|(i, _)| i)
        .collect();
    indices.sort_unstable();

    let selected: Vec<String> = indices.iter().map(|&i| bullets[i].text.clone()).collect();
    SelectionResult {
        stats: SelectionStats {
            mode: "recency".into(),
            total_candidates: bullets.len(),
            selected_count: selected.len(),
            discarded_count: bullets.len() - selected.len(),
            max_score: None,
            min_score: None,
            mean_score: None,
        },
        selected,
    }
}
