// src/main.rs
// CLI entry point: serve the HTTP surface or run one-shot sessions

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use sibyl::capabilities::embedder::Embedder;
use sibyl::config::{ProviderSettings, SibylConfig};
use sibyl::events::EventSink;
use sibyl::memory::semantic::SemanticMemoryStore;
use sibyl::pipeline::{Orchestrator, SessionMode};
use sibyl::providers::{BraveWebClient, GeminiEmbedder, OpenAiCompatClient, QdrantRetrievalClient};
use sibyl::types::Message;

const DEFAULT_LLM_BASE_URL: &str = "https://api.deepseek.com/v1";
const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
const DEFAULT_COLLECTION: &str = "sibyl_documents";
const DEFAULT_DATABASE_URL: &str = "sqlite://sibyl_memory.db?mode=rwc";

#[derive(Parser)]
#[command(name = "sibyl", about = "Agentic retrieval-augmented generation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (POST /chat, POST /chat/stream)
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
    /// Ask a single question and print the grounded answer
    Ask {
        question: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Inspect or maintain the semantic memory store
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Entry counts by kind
    Stats,
    /// Remove old, rarely used entries
    Prune {
        #[arg(long, default_value_t = 90)]
        max_age_days: i64,
        #[arg(long, default_value_t = 1)]
        min_usage: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sibyl=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(SibylConfig::from_env()?);
    let settings = ProviderSettings::load();

    match cli.command {
        Command::Serve { bind } => {
            let orchestrator = build_orchestrator(&config, &settings).await?;
            let timeout = Duration::from_millis(config.request_timeout_ms);
            sibyl::server::serve(&bind, orchestrator, timeout).await
        }
        Command::Ask { question, session } => {
            let orchestrator = build_orchestrator(&config, &settings).await?;
            let response = orchestrator
                .run_session(
                    vec![Message::user(question)],
                    SessionMode::Sync,
                    session,
                    EventSink::null(),
                )
                .await?;

            println!("{}\n", response.answer);
            for (index, citation) in response.citations.iter().enumerate() {
                let title = citation.title.as_deref().unwrap_or(&citation.id);
                println!("[{}] {title}", index + 1);
            }
            Ok(())
        }
        Command::Memory { command } => {
            let store = build_memory_store(&settings).await?;
            match command {
                MemoryCommand::Stats => {
                    let stats = store.stats().await?;
                    println!("total: {}", stats.total);
                    let mut kinds: Vec<_> = stats.by_kind.iter().collect();
                    kinds.sort();
                    for (kind, count) in kinds {
                        println!("{kind}: {count}");
                    }
                }
                MemoryCommand::Prune {
                    max_age_days,
                    min_usage,
                } => {
                    let removed = store.prune(max_age_days, min_usage).await?;
                    println!("removed {removed} entries");
                }
            }
            Ok(())
        }
    }
}

fn build_embedder(settings: &ProviderSettings) -> anyhow::Result<Arc<dyn Embedder>> {
    let gemini_key = settings
        .get_or_env(settings.gemini_api_key.as_ref(), "GEMINI_API_KEY")
        .context("GEMINI_API_KEY is required for embeddings")?;
    Ok(Arc::new(GeminiEmbedder::new(gemini_key)))
}

async fn build_orchestrator(
    config: &Arc<SibylConfig>,
    settings: &ProviderSettings,
) -> anyhow::Result<Arc<Orchestrator>> {
    let Some(llm_key) = settings.get_or_env(settings.llm_api_key.as_ref(), "LLM_API_KEY") else {
        bail!("LLM_API_KEY is required");
    };
    let base_url = settings
        .get_or_env(settings.llm_base_url.as_ref(), "LLM_BASE_URL")
        .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string());
    let llm = Arc::new(OpenAiCompatClient::new(base_url, llm_key));

    let embedder = build_embedder(settings)?;

    let qdrant_url = settings
        .get_or_env(settings.qdrant_url.as_ref(), "QDRANT_URL")
        .unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string());
    let collection = settings
        .get_or_env(settings.qdrant_collection.as_ref(), "QDRANT_COLLECTION")
        .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());
    let retrieval = Arc::new(QdrantRetrievalClient::connect(
        &qdrant_url,
        collection,
        Arc::clone(&embedder),
    )?);

    let mut orchestrator =
        Orchestrator::new(Arc::clone(config), llm, retrieval).with_embedder(Arc::clone(&embedder));

    if let Some(web_key) =
        settings.get_or_env(settings.web_search_api_key.as_ref(), "WEB_SEARCH_API_KEY")
    {
        orchestrator = orchestrator.with_web(Arc::new(BraveWebClient::new(web_key)));
    }

    if config.enable_semantic_memory {
        let database_url = settings
            .get_or_env(settings.database_url.as_ref(), "DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let store = SemanticMemoryStore::connect(&database_url, Arc::clone(&embedder)).await?;
        orchestrator = orchestrator.with_semantic_memory(Arc::new(store));
    }

    Ok(Arc::new(orchestrator))
}

async fn build_memory_store(settings: &ProviderSettings) -> anyhow::Result<SemanticMemoryStore> {
    let embedder = build_embedder(settings)?;
    let database_url = settings
        .get_or_env(settings.database_url.as_ref(), "DATABASE_URL")
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    Ok(SemanticMemoryStore::connect(&database_url, embedder).await?)
}
