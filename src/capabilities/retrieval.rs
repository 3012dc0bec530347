// src/capabilities/retrieval.rs
// Knowledge-base retrieval capability

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::types::Reference;

/// Parameters for one index search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub top: usize,
    /// Reranker score threshold; hits below it are dropped by the index.
    pub threshold: Option<f32>,
    pub filters: Option<HashMap<String, String>>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, top: usize) -> Self {
        Self {
            query: query.into(),
            top,
            threshold: None,
            filters: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// Document index capability: hybrid (vector + lexical + semantic rerank)
/// and pure vector search, plus chunk lookup by id for lazy full loads.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<Reference>>;

    async fn vector_search(&self, request: &SearchRequest) -> Result<Vec<Reference>>;

    async fn get_by_id(&self, id: &str) -> Result<Reference>;
}
