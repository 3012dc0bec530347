// src/providers/gemini_embed.rs
// Gemini embeddings client

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::capabilities::embedder::Embedder;
use crate::error::{Result, SibylError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Embedding dimensions requested from gemini-embedding-001.
const EMBEDDING_DIM: u32 = 1536;

/// Embedder backed by the Gemini embeddings REST API.
pub struct GeminiEmbedder {
    http_client: reqwest::Client,
    api_key: String,
}

impl GeminiEmbedder {
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

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent?key={}",
            self.api_key
        );
        let body = serde_json::json!({
            "model": "models/gemini-embedding-001",
            "content": {"parts": [{"text": text}]},
            "outputDimensionality": EMBEDDING_DIM,
        });

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                debug!("retrying embed (attempt {})", attempt + 1);
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let result = self
                .http_client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let json: serde_json::Value = match response.json().await {
                        Ok(json) => json,
                        Err(e) => {
                            last_error = Some(format!("malformed response: {e}"));
                            continue;
                        }
                    };

                    if let Some(error) = json.get("error") {
                        let error_text = error.to_string();
                        // Key and quota problems will not improve on retry.
                        if error_text.contains("API_KEY") || error_text.contains("QUOTA") {
                            return Err(SibylError::capability("embedder", error_text));
                        }
                        last_error = Some(error_text);
                        continue;
                    }

                    let embedding: Vec<f32> = json["embedding"]["values"]
                        .as_array()
                        .ok_or_else(|| {
                            SibylError::capability("embedder", "missing embedding values")
                        })?
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect();
                    return Ok(embedding);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SibylError::capability(
            "embedder",
            last_error.unwrap_or_else(|| "embedding failed".into()),
        ))
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_one(text).await?);
        }
        Ok(vectors)
    }
}
