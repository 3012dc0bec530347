// src/providers/qdrant.rs
// Qdrant-backed document index client

use async_trait::async_trait;
use qdrant_client::qdrant::{GetPointsBuilder, SearchPointsBuilder};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::capabilities::embedder::Embedder;
use crate::capabilities::retrieval::{RetrievalClient, SearchRequest};
use crate::error::{Result, SibylError};
use crate::types::Reference;

/// Scale factor mapping cosine similarity onto the 0-4 reranker score range
/// the thresholds are expressed in.
const RERANK_SCALE: f32 = 4.0;

/// Boost applied per query term found verbatim in the chunk (the lexical leg
/// of hybrid search).
const TERM_BOOST: f32 = 0.15;

/// Document index over a Qdrant collection. Points carry the chunk payload:
/// `doc_id`, `title`, `content`, optional `page_number` and `url`.
pub struct QdrantRetrievalClient {
    qdrant: Qdrant,
    embedder: Arc<dyn Embedder>,
    collection: String,
}

impl QdrantRetrievalClient {
    pub fn connect(
        url: &str,
        collection: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let qdrant = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .map_err(|e| SibylError::Config(format!("cannot connect to qdrant: {e}")))?;
        Ok(Self {
            qdrant,
            embedder,
            collection: collection.into(),
        })
    }

    async fn dense_search(&self, request: &SearchRequest, limit: usize) -> Result<Vec<Reference>> {
        let embedding = self
            .embedder
            .embed(&[request.query.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SibylError::capability("embedder", "no query embedding"))?;

        let search =
            SearchPointsBuilder::new(&self.collection, embedding, limit as u64).with_payload(true);

        let response = self
            .qdrant
            .search_points(search)
            .await
            .map_err(|e| SibylError::capability("retrieval", e.to_string()))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = &point.payload;
                let content = payload.get("content")?.as_str()?.to_string();
                let id = payload
                    .get("doc_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())?;
                let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
                for (key, value) in payload {
                    if matches!(key.as_str(), "content" | "doc_id" | "title" | "page_number" | "url")
                    {
                        continue;
                    }
                    if let Some(s) = value.as_str() {
                        metadata.insert(key.clone(), serde_json::Value::String(s.to_string()));
                    } else if let Some(i) = value.as_integer() {
                        metadata.insert(key.clone(), serde_json::Value::Number(i.into()));
                    } else if let Some(b) = value.as_bool() {
                        metadata.insert(key.clone(), serde_json::Value::Bool(b));
                    }
                }
                Some(Reference {
                    id,
                    title: payload
                        .get("title")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    content: Some(content),
                    score: Some(point.score * RERANK_SCALE),
                    page_number: payload
                        .get("page_number")
                        .and_then(|v| v.as_integer())
                        .map(|n| n as u32),
                    url: payload
                        .get("url")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    metadata: if metadata.is_empty() {
                        None
                    } else {
                        Some(metadata)
                    },
                })
            })
            .collect())
    }
}

#[async_trait]
impl RetrievalClient for QdrantRetrievalClient {
    /// Dense search plus a lexical term-overlap boost, filtered by the
    /// caller's reranker-scale threshold.
    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<Reference>> {
        // Over-fetch so the boost can reorder before the cut.
        let mut hits = self.dense_search(request, request.top * 2).await?;

        let terms: Vec<String> = request
            .query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect();
        for hit in &mut hits {
            let haystack = hit.content.as_deref().unwrap_or("").to_lowercase();
            let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
            if let Some(score) = &mut hit.score {
                *score += matched as f32 * TERM_BOOST;
            }
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(threshold) = request.threshold {
            hits.retain(|hit| hit.score.unwrap_or(0.0) >= threshold);
        }
        hits.truncate(request.top);

        debug!(query = %request.query, hits = hits.len(), "hybrid search");
        Ok(hits)
    }

    async fn vector_search(&self, request: &SearchRequest) -> Result<Vec<Reference>> {
        self.dense_search(request, request.top).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Reference> {
        let point_id = hash_point_id(id);
        let response = self
            .qdrant
            .get_points(
                GetPointsBuilder::new(&self.collection, vec![point_id.into()]).with_payload(true),
            )
            .await
            .map_err(|e| SibylError::capability("retrieval", e.to_string()))?;

        let point = response
            .result
            .into_iter()
            .next()
            .ok_or_else(|| SibylError::capability("retrieval", format!("unknown document {id}")))?;

        let content = point
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(Reference {
            id: id.to_string(),
            title: point
                .payload
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            content,
            score: None,
            page_number: point
                .payload
                .get("page_number")
                .and_then(|v| v.as_integer())
                .map(|n| n as u32),
            url: point
                .payload
                .get("url")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            metadata: None,
        })
    }
}

/// Hash a string document id to a u64 Qdrant point id.
fn hash_point_id(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}
