// src/capabilities/web.rs
// Web search and page fetch capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::WebResult;

/// Parameters for one web search.
#[derive(Debug, Clone)]
pub struct WebSearchRequest {
    pub query: String,
    pub count: usize,
    /// Freshness hint understood by the search backend (e.g. "pw" for the
    /// past week).
    pub freshness: Option<String>,
}

impl WebSearchRequest {
    pub fn new(query: impl Into<String>, count: usize) -> Self {
        Self {
            query: query.into(),
            count,
            freshness: None,
        }
    }
}

/// A fetched page body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// External web search capability.
#[async_trait]
pub trait WebClient: Send + Sync {
    async fn search(&self, request: &WebSearchRequest) -> Result<Vec<WebResult>>;

    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}
