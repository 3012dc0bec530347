// src/config.rs
// Pipeline configuration: feature flags, budgets, thresholds

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Result, SibylError};

/// Mode for web context assembly: snippets only, or full page bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSearchMode {
    Snippets,
    Full,
}

/// Configuration for the orchestration pipeline. Every option has a default;
/// `from_env` reads the canonical environment variable names.
#[derive(Debug, Clone)]
pub struct SibylConfig {
    // Feature flags
    pub enable_critic: bool,
    pub enable_intent_routing: bool,
    pub enable_lazy_retrieval: bool,
    pub enable_semantic_summary: bool,
    pub enable_semantic_memory: bool,
    pub enable_query_decomposition: bool,
    pub enable_web_reranking: bool,
    pub enable_semantic_boost: bool,

    // Context budgets
    pub context_history_token_cap: u32,
    pub context_summary_token_cap: u32,
    pub context_salience_token_cap: u32,
    pub web_context_max_tokens: u32,
    pub context_max_recent_turns: usize,
    pub context_max_summary_items: usize,
    pub context_max_salience_items: usize,

    // Retrieval
    pub rag_top_k: usize,
    pub reranker_threshold: f32,
    pub retrieval_min_docs: usize,
    pub retrieval_fallback_reranker_threshold: f32,
    pub lazy_summary_max_chars: usize,
    pub lazy_prefetch_count: usize,
    pub lazy_load_threshold: f32,

    // Planner / critic
    pub planner_confidence_dual_retrieval: f32,
    pub critic_max_retries: u32,
    pub critic_threshold: f32,

    // Reranking
    pub rrf_k_constant: f32,
    pub reranking_top_k: usize,
    pub semantic_boost_weight: f32,

    // Decomposition
    pub decomposition_complexity_threshold: f32,
    pub decomposition_max_subqueries: usize,

    // Memory
    pub semantic_memory_recall_k: usize,
    pub semantic_memory_min_similarity: f32,
    pub semantic_memory_prune_age_days: i64,
    /// Retention cap for per-session summary bullets and salience notes.
    pub short_term_max_items: usize,

    // Web search
    pub web_results_max: usize,
    pub web_search_mode: WebSearchMode,

    // Models
    pub model_small: String,
    pub model_large: String,

    // Timeouts
    pub request_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for SibylConfig {
    fn default() -> Self {
        Self {
            enable_critic: true,
            enable_intent_routing: true,
            enable_lazy_retrieval: false,
            enable_semantic_summary: true,
            enable_semantic_memory: false,
            enable_query_decomposition: false,
            enable_web_reranking: false,
            enable_semantic_boost: false,

            context_history_token_cap: 1800,
            context_summary_token_cap: 600,
            context_salience_token_cap: 400,
            web_context_max_tokens: 8000,
            context_max_recent_turns: 12,
            context_max_summary_items: 6,
            context_max_salience_items: 6,

            rag_top_k: 5,
            reranker_threshold: 3.0,
            retrieval_min_docs: 3,
            retrieval_fallback_reranker_threshold: 2.0,
            lazy_summary_max_chars: 300,
            lazy_prefetch_count: 10,
            lazy_load_threshold: 0.5,

            planner_confidence_dual_retrieval: 0.45,
            critic_max_retries: 2,
            critic_threshold: 0.75,

            rrf_k_constant: 60.0,
            reranking_top_k: 10,
            semantic_boost_weight: 0.3,

            decomposition_complexity_threshold: 0.6,
            decomposition_max_subqueries: 8,

            semantic_memory_recall_k: 3,
            semantic_memory_min_similarity: 0.6,
            semantic_memory_prune_age_days: 90,
            short_term_max_items: 24,

            web_results_max: 5,
            web_search_mode: WebSearchMode::Snippets,

            model_small: "deepseek-chat".into(),
            model_large: "deepseek-reasoner".into(),

            request_timeout_ms: 60_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl SibylConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults. Malformed values are a fatal `ConfigError`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        env_bool("ENABLE_CRITIC", &mut cfg.enable_critic)?;
        env_bool("ENABLE_INTENT_ROUTING", &mut cfg.enable_intent_routing)?;
        env_bool("ENABLE_LAZY_RETRIEVAL", &mut cfg.enable_lazy_retrieval)?;
        env_bool("ENABLE_SEMANTIC_SUMMARY", &mut cfg.enable_semantic_summary)?;
        env_bool("ENABLE_SEMANTIC_MEMORY", &mut cfg.enable_semantic_memory)?;
        env_bool(
            "ENABLE_QUERY_DECOMPOSITION",
            &mut cfg.enable_query_decomposition,
        )?;
        env_bool("ENABLE_WEB_RERANKING", &mut cfg.enable_web_reranking)?;
        env_bool("ENABLE_SEMANTIC_BOOST", &mut cfg.enable_semantic_boost)?;

        env_u32("CONTEXT_HISTORY_TOKEN_CAP", &mut cfg.context_history_token_cap)?;
        env_u32("CONTEXT_SUMMARY_TOKEN_CAP", &mut cfg.context_summary_token_cap)?;
        env_u32(
            "CONTEXT_SALIENCE_TOKEN_CAP",
            &mut cfg.context_salience_token_cap,
        )?;
        env_u32("WEB_CONTEXT_MAX_TOKENS", &mut cfg.web_context_max_tokens)?;
        env_usize("CONTEXT_MAX_RECENT_TURNS", &mut cfg.context_max_recent_turns)?;
        env_usize(
            "CONTEXT_MAX_SUMMARY_ITEMS",
            &mut cfg.context_max_summary_items,
        )?;
        env_usize(
            "CONTEXT_MAX_SALIENCE_ITEMS",
            &mut cfg.context_max_salience_items,
        )?;

        env_usize("RAG_TOP_K", &mut cfg.rag_top_k)?;
        env_f32("RERANKER_THRESHOLD", &mut cfg.reranker_threshold)?;
        env_usize("RETRIEVAL_MIN_DOCS", &mut cfg.retrieval_min_docs)?;
        env_f32(
            "RETRIEVAL_FALLBACK_RERANKER_THRESHOLD",
            &mut cfg.retrieval_fallback_reranker_threshold,
        )?;
        env_usize("LAZY_SUMMARY_MAX_CHARS", &mut cfg.lazy_summary_max_chars)?;
        env_usize("LAZY_PREFETCH_COUNT", &mut cfg.lazy_prefetch_count)?;
        env_f32("LAZY_LOAD_THRESHOLD", &mut cfg.lazy_load_threshold)?;

        env_f32(
            "PLANNER_CONFIDENCE_DUAL_RETRIEVAL",
            &mut cfg.planner_confidence_dual_retrieval,
        )?;
        env_u32("CRITIC_MAX_RETRIES", &mut cfg.critic_max_retries)?;
        env_f32("CRITIC_THRESHOLD", &mut cfg.critic_threshold)?;

        env_f32("RRF_K_CONSTANT", &mut cfg.rrf_k_constant)?;
        env_usize("RERANKING_TOP_K", &mut cfg.reranking_top_k)?;
        env_f32("SEMANTIC_BOOST_WEIGHT", &mut cfg.semantic_boost_weight)?;

        env_f32(
            "DECOMPOSITION_COMPLEXITY_THRESHOLD",
            &mut cfg.decomposition_complexity_threshold,
        )?;
        env_usize(
            "DECOMPOSITION_MAX_SUBQUERIES",
            &mut cfg.decomposition_max_subqueries,
        )?;

        env_usize("SEMANTIC_MEMORY_RECALL_K", &mut cfg.semantic_memory_recall_k)?;
        env_f32(
            "SEMANTIC_MEMORY_MIN_SIMILARITY",
            &mut cfg.semantic_memory_min_similarity,
        )?;
        env_i64(
            "SEMANTIC_MEMORY_PRUNE_AGE_DAYS",
            &mut cfg.semantic_memory_prune_age_days,
        )?;
        env_usize("SHORT_TERM_MAX_ITEMS", &mut cfg.short_term_max_items)?;

        env_usize("WEB_RESULTS_MAX", &mut cfg.web_results_max)?;
        if let Ok(mode) = std::env::var("WEB_SEARCH_MODE") {
            cfg.web_search_mode = match mode.to_lowercase().as_str() {
                "snippets" => WebSearchMode::Snippets,
                "full" => WebSearchMode::Full,
                other => {
                    return Err(SibylError::Config(format!(
                        "WEB_SEARCH_MODE must be 'snippets' or 'full', got '{other}'"
                    )));
                }
            };
        }

        if let Ok(model) = std::env::var("MODEL_SMALL") {
            cfg.model_small = model;
        }
        if let Ok(model) = std::env::var("MODEL_LARGE") {
            cfg.model_large = model;
        }

        env_u64("REQUEST_TIMEOUT_MS", &mut cfg.request_timeout_ms)?;
        env_u64("CALL_TIMEOUT_MS", &mut cfg.call_timeout_ms)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints. Fatal at init.
    pub fn validate(&self) -> Result<()> {
        if self.model_small.is_empty() || self.model_large.is_empty() {
            return Err(SibylError::Config("model names must not be empty".into()));
        }
        for (name, value) in [
            ("CONTEXT_HISTORY_TOKEN_CAP", self.context_history_token_cap),
            ("CONTEXT_SUMMARY_TOKEN_CAP", self.context_summary_token_cap),
            ("CONTEXT_SALIENCE_TOKEN_CAP", self.context_salience_token_cap),
            ("WEB_CONTEXT_MAX_TOKENS", self.web_context_max_tokens),
        ] {
            if value == 0 {
                return Err(SibylError::Config(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("LAZY_LOAD_THRESHOLD", self.lazy_load_threshold),
            (
                "PLANNER_CONFIDENCE_DUAL_RETRIEVAL",
                self.planner_confidence_dual_retrieval,
            ),
            ("CRITIC_THRESHOLD", self.critic_threshold),
            ("SEMANTIC_BOOST_WEIGHT", self.semantic_boost_weight),
            (
                "DECOMPOSITION_COMPLEXITY_THRESHOLD",
                self.decomposition_complexity_threshold,
            ),
            (
                "SEMANTIC_MEMORY_MIN_SIMILARITY",
                self.semantic_memory_min_similarity,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SibylError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.decomposition_max_subqueries == 0 {
            return Err(SibylError::Config(
                "DECOMPOSITION_MAX_SUBQUERIES must be at least 1".into(),
            ));
        }
        if self.rag_top_k == 0 || self.lazy_prefetch_count == 0 {
            return Err(SibylError::Config(
                "retrieval result counts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Model tier for a routed intent.
    pub fn model_for_tier(&self, large: bool) -> &str {
        if large {
            &self.model_large
        } else {
            &self.model_small
        }
    }
}

fn env_raw(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, slot: &mut bool) -> Result<()> {
    if let Some(raw) = env_raw(name) {
        *slot = match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(SibylError::Config(format!(
                    "{name} must be a boolean, got '{other}'"
                )));
            }
        };
    }
    Ok(())
}

fn env_u32(name: &str, slot: &mut u32) -> Result<()> {
    if let Some(raw) = env_raw(name) {
        *slot = raw
            .parse()
            .map_err(|_| SibylError::Config(format!("{name} must be an integer, got '{raw}'")))?;
    }
    Ok(())
}

fn env_u64(name: &str, slot: &mut u64) -> Result<()> {
    if let Some(raw) = env_raw(name) {
        *slot = raw
            .parse()
            .map_err(|_| SibylError::Config(format!("{name} must be an integer, got '{raw}'")))?;
    }
    Ok(())
}

fn env_i64(name: &str, slot: &mut i64) -> Result<()> {
    if let Some(raw) = env_raw(name) {
        *slot = raw
            .parse()
            .map_err(|_| SibylError::Config(format!("{name} must be an integer, got '{raw}'")))?;
    }
    Ok(())
}

fn env_usize(name: &str, slot: &mut usize) -> Result<()> {
    if let Some(raw) = env_raw(name) {
        *slot = raw
            .parse()
            .map_err(|_| SibylError::Config(format!("{name} must be an integer, got '{raw}'")))?;
    }
    Ok(())
}

fn env_f32(name: &str, slot: &mut f32) -> Result<()> {
    if let Some(raw) = env_raw(name) {
        *slot = raw
            .parse()
            .map_err(|_| SibylError::Config(format!("{name} must be a number, got '{raw}'")))?;
    }
    Ok(())
}

// ============================================================================
// Provider settings (composition-time, binary only)
// ============================================================================

/// Connection settings for the concrete providers wired up by the binary.
/// Loaded from `~/.sibyl/config.toml` with environment variable fallback.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderSettings {
    /// API key for the OpenAI-compatible chat completions endpoint.
    pub llm_api_key: Option<String>,
    /// Base URL of the chat completions endpoint.
    pub llm_base_url: Option<String>,
    /// Gemini API key for embeddings.
    pub gemini_api_key: Option<String>,
    /// Qdrant endpoint for the document index.
    pub qdrant_url: Option<String>,
    /// Qdrant collection holding indexed documents.
    pub qdrant_collection: Option<String>,
    /// Brave-compatible web search API key.
    pub web_search_api_key: Option<String>,
    /// SQLite database URL for the semantic memory store.
    pub database_url: Option<String>,
}

impl ProviderSettings {
    /// Load from the config file, if present.
    pub fn load() -> Self {
        let path = settings_path();
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("failed to read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Get a value with fallback to an environment variable.
    pub fn get_or_env(&self, field: Option<&String>, env_var: &str) -> Option<String> {
        field.cloned().or_else(|| env_raw(env_var))
    }
}

/// Path of the provider settings file.
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".sibyl")
        .join("config.toml")
}
