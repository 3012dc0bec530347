// src/providers/openai.rs
// OpenAI-compatible chat completions client (sync + SSE streaming)

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capabilities::llm::{Completion, CompletionRequest, LlmClient, StreamEvent};
use crate::error::{Result, SibylError};
use crate::types::UsageTotals;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Chat completions client for any OpenAI-compatible endpoint (DeepSeek,
/// OpenAI, local gateways).
pub struct OpenAiCompatClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    id: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http_client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        crate::types::Role::System => "system",
                        crate::types::Role::User => "user",
                        crate::types::Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if let Some(schema) = &request.json_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {"name": "structured_output", "schema": schema},
            });
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                debug!("retrying chat completion (attempt {})", attempt + 1);
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let result = self
                .http_client
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    // Client errors will not improve on retry.
                    if status.is_client_error() {
                        return Err(SibylError::capability(
                            "llm",
                            format!("provider rejected request ({status}): {text}"),
                        ));
                    }
                    warn!("provider error ({status}), will retry: {text}");
                    last_error = Some(format!("{status}: {text}"));
                }
                Err(e) => {
                    warn!("chat completion request failed: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(SibylError::capability(
            "llm",
            last_error.unwrap_or_else(|| "request failed".into()),
        ))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = self.request_body(&request, false);
        let response = self.send(&body).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SibylError::capability("llm", format!("malformed response: {e}")))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(Completion {
            text,
            response_id: parsed.id,
            usage: parsed
                .usage
                .map(|u| UsageTotals::new(u.prompt_tokens, u.completion_tokens)),
        })
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Completion> {
        let body = self.request_body(&request, true);
        let response = self.send(&body).await?;

        let mut assembled = String::new();
        let mut usage: Option<UsageTotals> = None;
        let mut pending = String::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(piece) = byte_stream.next().await {
            let bytes = piece
                .map_err(|e| SibylError::capability("llm", format!("stream interrupted: {e}")))?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            // Drain every complete line; a trailing partial stays pending
            // until the next network piece arrives.
            while let Some(split_at) = pending.find('\n') {
                let line: String = pending.drain(..=split_at).collect();
                let Some(payload) = sse_payload(&line) else {
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<StreamChunk>(payload) else {
                    continue;
                };
                if let Some(frame_usage) = frame.usage {
                    usage = Some(UsageTotals::new(
                        frame_usage.prompt_tokens,
                        frame_usage.completion_tokens,
                    ));
                }
                for choice in frame.choices.unwrap_or_default() {
                    if let Some(delta) = choice.delta.and_then(|d| d.content) {
                        assembled.push_str(&delta);
                        let _ = tx.send(StreamEvent::Delta(delta)).await;
                    }
                }
            }
        }

        let _ = tx
            .send(StreamEvent::Done {
                text: assembled.clone(),
                usage,
            })
            .await;

        Ok(Completion {
            text: assembled,
            response_id: None,
            usage,
        })
    }
}

/// JSON payload of one SSE line, or `None` for blanks, comments and the
/// `[DONE]` sentinel.
fn sse_payload(line: &str) -> Option<&str> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        None
    } else {
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_endpoint_joins_cleanly() {
        let client = OpenAiCompatClient::new("https://api.deepseek.com/v1/", "key");
        assert_eq!(client.endpoint(), "https://api.deepseek.com/v1/chat/completions");
    }

    #[test]
    fn test_request_body_shape() {
        let client = OpenAiCompatClient::new("https://api.deepseek.com/v1", "key");
        let request = CompletionRequest::new(
            "deepseek-chat",
            vec![Message::system("sys"), Message::user("hi")],
            256,
        );
        let body = client.request_body(&request, false);

        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_sse_payload_extracts_data() {
        assert_eq!(sse_payload("data: {\"x\": 1}\n"), Some("{\"x\": 1}"));
        assert_eq!(sse_payload("data:{\"x\": 1}"), Some("{\"x\": 1}"));
    }

    #[test]
    fn test_sse_payload_skips_noise() {
        assert_eq!(sse_payload(""), None);
        assert_eq!(sse_payload("\n"), None);
        assert_eq!(sse_payload(": keep-alive comment"), None);
        assert_eq!(sse_payload("data: [DONE]"), None);
        assert_eq!(sse_payload("data:"), None);
    }

    #[test]
    fn test_request_body_with_schema() {
        let client = OpenAiCompatClient::new("https://api.deepseek.com/v1", "key");
        let request = CompletionRequest::prompt("deepseek-chat", "sys", "hi", 100)
            .with_json_schema(serde_json::json!({"type": "object"}));
        let body = client.request_body(&request, false);

        assert_eq!(body["response_format"]["type"], "json_schema");
    }
}
