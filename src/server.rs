// src/server.rs
// HTTP surface: POST /chat (JSON) and POST /chat/stream (SSE)

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::events::EventSink;
use crate::pipeline::{Orchestrator, SessionMode};
use crate::types::{ChatResponse, Message};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Build the router. The synchronous route gets a transport-level timeout;
/// the streaming route is long-lived and exempt.
pub fn router(orchestrator: Arc<Orchestrator>, request_timeout: Duration) -> Router {
    let state = AppState { orchestrator };
    Router::new()
        .route("/chat", post(chat))
        .route_layer(TimeoutLayer::new(request_timeout))
        .route("/chat/stream", post(chat_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    bind: &str,
    orchestrator: Arc<Orchestrator>,
    request_timeout: Duration,
) -> anyhow::Result<()> {
    let app = router(orchestrator, request_timeout);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    state
        .orchestrator
        .run_session(body.messages, SessionMode::Sync, body.session_id, EventSink::null())
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequestBody>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (sink, rx) = EventSink::channel(64);
    let orchestrator = Arc::clone(&state.orchestrator);
    let stream_id = uuid::Uuid::new_v4();
    info!(%stream_id, "streaming session opened");
    tokio::spawn(async move {
        // Failures surface as error + done events on the stream.
        let result = orchestrator
            .run_session(body.messages, SessionMode::Streaming, body.session_id, sink)
            .await;
        if let Err(e) = result {
            info!(%stream_id, "streaming session ended with error: {e}");
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let sse = SseEvent::default().event(event.name());
        Ok(sse
            .json_data(&event)
            .unwrap_or_else(|_| SseEvent::default().event("error").data("serialization failed")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
