// src/testing/stubs.rs
// Scripted stand-ins for the four external capabilities.
//
// Each stub matches scripted responses and records calls so tests can assert
// on what the pipeline actually did. All stubs are deterministic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::capabilities::embedder::Embedder;
use crate::capabilities::llm::{Completion, CompletionRequest, LlmClient, StreamEvent};
use crate::capabilities::retrieval::{RetrievalClient, SearchRequest};
use crate::capabilities::web::{FetchedPage, WebClient, WebSearchRequest};
use crate::error::{Result, SibylError};
use crate::types::{Reference, UsageTotals, WebResult};

// ============================================================================
// LLM
// ============================================================================

/// Scripted LLM. Responses are matched by substring against the concatenated
/// request messages, first script wins. Unmatched requests fail so tests
/// notice missing scripts.
#[derive(Default)]
pub struct StubLlm {
    scripts: Mutex<Vec<(String, VecDeque<String>)>>,
    calls: Mutex<Vec<CompletionRequest>>,
    failing: bool,
}

impl StubLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stub whose every call fails with a capability error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    /// Script a response for requests whose prompt contains `needle`.
    /// Scripting the same needle again queues a follow-up response.
    pub fn script(&self, needle: &str, response: &str) {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some((_, queue)) = scripts.iter_mut().find(|(n, _)| n == needle) {
            queue.push_back(response.to_string());
        } else {
            scripts.push((needle.to_string(), VecDeque::from([response.to_string()])));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, request: &CompletionRequest) -> Result<String> {
        if self.failing {
            return Err(SibylError::capability("llm", "scripted failure"));
        }
        let prompt: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut scripts = self.scripts.lock().unwrap();
        for (needle, queue) in scripts.iter_mut() {
            if prompt.contains(needle.as_str()) {
                // Keep the last response for repeat calls.
                let response = if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return Ok(response);
            }
        }
        Err(SibylError::capability(
            "llm",
            format!("no scripted response matches prompt: {:.80}", prompt),
        ))
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        self.calls.lock().unwrap().push(request.clone());
        let text = self.answer(&request)?;
        Ok(Completion {
            text,
            response_id: None,
            usage: Some(UsageTotals::new(10, 10)),
        })
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Completion> {
        self.calls.lock().unwrap().push(request.clone());
        let text = self.answer(&request)?;

        // Stream in small chunks to exercise delta handling.
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(6) {
            let delta: String = chunk.iter().collect();
            let _ = tx.send(StreamEvent::Delta(delta)).await;
        }
        let usage = Some(UsageTotals::new(10, 10));
        let _ = tx
            .send(StreamEvent::Done {
                text: text.clone(),
                usage,
            })
            .await;

        Ok(Completion {
            text,
            response_id: None,
            usage,
        })
    }
}

// ============================================================================
// Retrieval
// ============================================================================

/// Scripted document index. Hybrid and vector responses are queues consumed
/// per call; an empty queue yields no hits. `get_by_id` serves from an
/// explicit document map.
#[derive(Default)]
pub struct StubRetrieval {
    hybrid_queue: Mutex<VecDeque<Vec<Reference>>>,
    vector_queue: Mutex<VecDeque<Vec<Reference>>>,
    documents: Mutex<HashMap<String, Reference>>,
    fail_hybrid: Mutex<bool>,
    fail_vector: Mutex<bool>,
    hybrid_calls: Mutex<Vec<SearchRequest>>,
    vector_calls: Mutex<Vec<SearchRequest>>,
    get_by_id_calls: Mutex<usize>,
}

impl StubRetrieval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_hybrid(&self, hits: Vec<Reference>) {
        self.hybrid_queue.lock().unwrap().push_back(hits);
    }

    pub fn push_vector(&self, hits: Vec<Reference>) {
        self.vector_queue.lock().unwrap().push_back(hits);
    }

    pub fn insert_document(&self, reference: Reference) {
        self.documents
            .lock()
            .unwrap()
            .insert(reference.id.clone(), reference);
    }

    pub fn set_fail_hybrid(&self, fail: bool) {
        *self.fail_hybrid.lock().unwrap() = fail;
    }

    pub fn set_fail_vector(&self, fail: bool) {
        *self.fail_vector.lock().unwrap() = fail;
    }

    pub fn hybrid_calls(&self) -> Vec<SearchRequest> {
        self.hybrid_calls.lock().unwrap().clone()
    }

    pub fn vector_call_count(&self) -> usize {
        self.vector_calls.lock().unwrap().len()
    }

    pub fn get_by_id_calls(&self) -> usize {
        *self.get_by_id_calls.lock().unwrap()
    }
}

#[async_trait]
impl RetrievalClient for StubRetrieval {
    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<Reference>> {
        self.hybrid_calls.lock().unwrap().push(request.clone());
        if *self.fail_hybrid.lock().unwrap() {
            return Err(SibylError::capability("retrieval", "scripted failure"));
        }
        Ok(self
            .hybrid_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn vector_search(&self, request: &SearchRequest) -> Result<Vec<Reference>> {
        self.vector_calls.lock().unwrap().push(request.clone());
        if *self.fail_vector.lock().unwrap() {
            return Err(SibylError::capability("retrieval", "scripted failure"));
        }
        Ok(self
            .vector_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn get_by_id(&self, id: &str) -> Result<Reference> {
        *self.get_by_id_calls.lock().unwrap() += 1;
        self.documents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SibylError::capability("retrieval", format!("unknown document {id}")))
    }
}

// ============================================================================
// Web
// ============================================================================

/// Scripted web search: a fixed result list for any query, plus a page map
/// for full fetches.
#[derive(Default)]
pub struct StubWeb {
    results: Mutex<Vec<WebResult>>,
    pages: Mutex<HashMap<String, String>>,
    failing: bool,
    search_calls: Mutex<Vec<WebSearchRequest>>,
    fetch_calls: Mutex<usize>,
}

impl StubWeb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn add_result(&self, id: &str, title: &str, url: &str, snippet: &str) {
        let mut results = self.results.lock().unwrap();
        let rank = results.len() as u32 + 1;
        results.push(WebResult {
            id: id.to_string(),
            title: title.to_string(),
            url: url.to_string(),
            snippet: snippet.to_string(),
            body: None,
            rank,
            relevance: None,
            fetched_at: Utc::now(),
            metadata: None,
        });
    }

    pub fn set_page(&self, url: &str, body: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }

    pub fn search_call_count(&self) -> usize {
        self.search_calls.lock().unwrap().len()
    }

    pub fn fetch_calls(&self) -> usize {
        *self.fetch_calls.lock().unwrap()
    }
}

#[async_trait]
impl WebClient for StubWeb {
    async fn search(&self, request: &WebSearchRequest) -> Result<Vec<WebResult>> {
        self.search_calls.lock().unwrap().push(request.clone());
        if self.failing {
            return Err(SibylError::capability("web", "scripted failure"));
        }
        let results = self.results.lock().unwrap();
        Ok(results.iter().take(request.count).cloned().collect())
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        *self.fetch_calls.lock().unwrap() += 1;
        if self.failing {
            return Err(SibylError::capability("web", "scripted failure"));
        }
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .map(|body| FetchedPage {
                body: body.clone(),
                fetched_at: Utc::now(),
            })
            .ok_or_else(|| SibylError::capability("web", format!("no page for {url}")))
    }
}

// ============================================================================
// Embedder
// ============================================================================

/// Deterministic embedder: the vector is a byte histogram of the text, so
/// identical texts embed identically and similar texts land close.
pub struct StubEmbedder {
    dimensions: usize,
    failing: bool,
    calls: Mutex<usize>,
}

impl StubEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            failing: false,
            calls: Mutex::new(0),
        }
    }

    pub fn failing(dimensions: usize) -> Self {
        Self {
            dimensions,
            failing: true,
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (index, byte) in text.bytes().enumerate() {
            vector[index % self.dimensions] += byte as f32 / 255.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        *self.calls.lock().unwrap() += 1;
        if self.failing {
            return Err(SibylError::capability("embedder", "scripted failure"));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
