// src/providers/brave.rs
// Brave-compatible web search client plus plain page fetch

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::capabilities::web::{FetchedPage, WebClient, WebSearchRequest};
use crate::error::{Result, SibylError};
use crate::types::WebResult;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// Upper bound on fetched page bodies before downstream budgeting.
const FETCH_MAX_BYTES: usize = 200_000;

/// Web search over the Brave search API; page fetches are plain GETs with a
/// size cap.
pub struct BraveWebClient {
    http_client: reqwest::Client,
    api_key: String,
}

impl BraveWebClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http_client,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl WebClient for BraveWebClient {
    async fn search(&self, request: &WebSearchRequest) -> Result<Vec<WebResult>> {
        let mut query_url = format!(
            "{SEARCH_ENDPOINT}?q={}&count={}",
            urlencoding::encode(&request.query),
            request.count
        );
        if let Some(freshness) = &request.freshness {
            query_url.push_str(&format!("&freshness={freshness}"));
        }

        let response = self
            .http_client
            .get(&query_url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| SibylError::capability("web", e.to_string()))?;

        if !response.status().is_success() {
            return Err(SibylError::capability(
                "web",
                format!("search returned {}", response.status()),
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SibylError::capability("web", format!("malformed response: {e}")))?;

        let now = Utc::now();
        let results: Vec<WebResult> = json["web"]["results"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .take(request.count)
                    .enumerate()
                    .filter_map(|(index, entry)| {
                        let url = entry["url"].as_str()?.to_string();
                        Some(WebResult {
                            id: format!("web-{}", index + 1),
                            title: entry["title"].as_str().unwrap_or(&url).to_string(),
                            url,
                            snippet: entry["description"].as_str().unwrap_or("").to_string(),
                            body: None,
                            rank: index as u32 + 1,
                            relevance: None,
                            fetched_at: now,
                            metadata: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(query = %request.query, results = results.len(), "web search");
        Ok(results)
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let parsed = Url::parse(url)
            .map_err(|e| SibylError::capability("web", format!("invalid url {url}: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(SibylError::capability(
                "web",
                format!("unsupported scheme in {url}"),
            ));
        }

        let response = self
            .http_client
            .get(parsed)
            .send()
            .await
            .map_err(|e| SibylError::capability("web", e.to_string()))?;

        if !response.status().is_success() {
            return Err(SibylError::capability(
                "web",
                format!("fetch returned {}", response.status()),
            ));
        }

        let mut body = response
            .text()
            .await
            .map_err(|e| SibylError::capability("web", e.to_string()))?;
        if body.len() > FETCH_MAX_BYTES {
            let mut end = FETCH_MAX_BYTES;
            while end > 0 && !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        Ok(FetchedPage {
            body,
            fetched_at: Utc::now(),
        })
    }
}
