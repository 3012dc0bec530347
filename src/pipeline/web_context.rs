// src/pipeline/web_context.rs
// Web search and web context assembly

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::capabilities::web::{WebClient, WebSearchRequest};
use crate::config::{SibylConfig, WebSearchMode};
use crate::context::budget::truncate_text;
use crate::tokens;
use crate::types::{ActivityStep, WebResult};

/// Freshness hint passed to the search backend (past month).
const FRESHNESS_HINT: &str = "pm";

/// Assembled web evidence for one session.
#[derive(Debug, Clone, Default)]
pub struct WebContext {
    pub results: Vec<WebResult>,
    pub context_text: String,
    pub tokens: u32,
    pub trimmed: bool,
    /// True when the search call itself failed (as opposed to returning
    /// nothing).
    pub failed: bool,
}

/// Queries the web, optionally fetches full bodies, and budgets the
/// resulting context text. Fails soft: errors yield an empty context plus an
/// activity step carrying the error.
pub struct WebContextAssembler {
    web: Arc<dyn WebClient>,
    config: Arc<SibylConfig>,
}

impl WebContextAssembler {
    pub fn new(web: Arc<dyn WebClient>, config: Arc<SibylConfig>) -> Self {
        Self { web, config }
    }

    pub async fn gather(&self, query: &str) -> (WebContext, ActivityStep) {
        let started = Instant::now();
        let request = WebSearchRequest {
            query: query.to_string(),
            count: self.config.web_results_max,
            freshness: Some(FRESHNESS_HINT.to_string()),
        };

        let mut results = match self.web.search(&request).await {
            Ok(results) => results,
            Err(e) => {
                warn!("web search failed: {e}");
                let step = ActivityStep::new("web_search", format!("web search for '{query}'"))
                    .with_duration(started.elapsed().as_millis() as u64)
                    .with_error(e.to_string());
                return (
                    WebContext {
                        failed: true,
                        ..Default::default()
                    },
                    step,
                );
            }
        };

        if self.config.web_search_mode == WebSearchMode::Full {
            self.fetch_bodies(&mut results).await;
        }

        let raw_text = build_web_text(&results);
        let (context_text, trimmed) = truncate_text(&raw_text, self.config.web_context_max_tokens);
        let token_count = tokens::estimate_unchecked(&context_text);

        debug!(
            results = results.len(),
            tokens = token_count,
            trimmed,
            "assembled web context"
        );

        let step = ActivityStep::new(
            "web_search",
            format!("web search for '{query}': {} results", results.len()),
        )
        .with_duration(started.elapsed().as_millis() as u64);

        (
            WebContext {
                results,
                context_text,
                tokens: token_count,
                trimmed,
                failed: false,
            },
            step,
        )
    }

    /// Fetch full page bodies concurrently; a failed fetch keeps the snippet.
    async fn fetch_bodies(&self, results: &mut [WebResult]) {
        let fetches = results.iter().map(|result| self.web.fetch(&result.url));
        let pages = futures::future::join_all(fetches).await;
        for (result, page) in results.iter_mut().zip(pages) {
            match page {
                Ok(page) => {
                    result.body = Some(page.body);
                    result.fetched_at = page.fetched_at;
                }
                Err(e) => warn!(url = %result.url, "page fetch failed: {e}"),
            }
        }
    }
}

/// Render web results into the context block fed to synthesis.
pub fn build_web_text(results: &[WebResult]) -> String {
    let mut text = String::new();
    for result in results {
        let content = result.body.as_deref().unwrap_or(&result.snippet);
        text.push_str(&format!("### {}\n{}\n{}\n\n", result.title, result.url, content));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stubs::StubWeb;

    fn assembler(web: Arc<StubWeb>, mode: WebSearchMode, cap: u32) -> WebContextAssembler {
        let config = SibylConfig {
            web_search_mode: mode,
            web_context_max_tokens: cap,
            ..Default::default()
        };
        WebContextAssembler::new(web, Arc::new(config))
    }

    #[tokio::test]
    async fn test_snippet_mode_uses_snippets() {
        let web = Arc::new(StubWeb::new());
        web.add_result("rust async", "Async Book", "https://rust-lang.org/async", "snippet text");

        let (context, step) = assembler(web, WebSearchMode::Snippets, 8000)
            .gather("rust async")
            .await;

        assert_eq!(context.results.len(), 1);
        assert!(context.context_text.contains("snippet text"));
        assert!(!context.trimmed);
        assert!(!context.failed);
        assert_eq!(step.step_type, "web_search");
        assert!(step.error.is_none());
    }

    #[tokio::test]
    async fn test_context_is_budgeted() {
        let web = Arc::new(StubWeb::new());
        web.add_result("q", "Long", "https://example.com", &"x".repeat(10_000));

        let (context, _) = assembler(web, WebSearchMode::Snippets, 100).gather("q").await;

        assert!(context.trimmed);
        assert!(context.tokens <= 100);
    }

    #[tokio::test]
    async fn test_search_failure_is_soft() {
        let web = Arc::new(StubWeb::failing());
        let (context, step) = assembler(web, WebSearchMode::Snippets, 8000).gather("q").await;

        assert!(context.results.is_empty());
        assert_eq!(context.tokens, 0);
        assert!(!context.trimmed);
        assert!(context.failed);
        assert!(step.error.is_some());
    }

    #[tokio::test]
    async fn test_full_mode_fetches_bodies() {
        let web = Arc::new(StubWeb::new());
        web.add_result("q", "Page", "https://example.com/page", "snippet");
        web.set_page("https://example.com/page", "full page body");

        let (context, _) = assembler(web.clone(), WebSearchMode::Full, 8000).gather("q").await;

        assert_eq!(context.results[0].body.as_deref(), Some("full page body"));
        assert!(context.context_text.contains("full page body"));
        assert_eq!(web.fetch_calls(), 1);
    }
}
