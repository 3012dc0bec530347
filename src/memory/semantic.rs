// src/memory/semantic.rs
// Durable embedding-indexed memory over SQLite

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::embedder::{cosine_similarity, Embedder};
use crate::error::{Result, SibylError};

/// Similarity bonus per matched tag, applied after cosine scoring.
const TAG_BOOST: f32 = 0.05;

/// Kind of a durable memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Episodic,
    Semantic,
    Procedural,
    Preference,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Preference => "preference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(Self::Episodic),
            "semantic" => Some(Self::Semantic),
            "procedural" => Some(Self::Procedural),
            "preference" => Some(Self::Preference),
            _ => None,
        }
    }
}

/// A recalled memory row, with the query similarity attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemoryEntry {
    pub id: i64,
    pub text: String,
    pub kind: MemoryKind,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub usage_count: i64,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub similarity: f32,
}

/// Ownership attribution for a stored memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryScope {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
}

/// Filters for a recall query.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub k: usize,
    pub kind: Option<MemoryKind>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub min_similarity: f32,
    pub max_age_days: Option<i64>,
}

impl RecallOptions {
    pub fn new(k: usize, min_similarity: f32) -> Self {
        Self {
            k,
            kind: None,
            session_id: None,
            user_id: None,
            tags: vec![],
            min_similarity,
            max_age_days: None,
        }
    }
}

/// Store-level counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: i64,
    pub by_kind: HashMap<String, i64>,
}

/// Durable, embedding-indexed memory store. Reads are concurrent; writes are
/// single statements and therefore atomic per operation.
pub struct SemanticMemoryStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl SemanticMemoryStore {
    /// Open (or create) the store at `database_url` and run the schema.
    pub async fn connect(database_url: &str, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| SibylError::Config(format!("cannot open memory store: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                kind TEXT NOT NULL,
                embedding TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                session_id TEXT,
                user_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                usage_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| SibylError::Config(format!("memory schema failed: {e}")))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind)",
            "CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC)",
        ] {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| SibylError::Config(format!("memory schema failed: {e}")))?;
        }

        Ok(Self { pool, embedder })
    }

    /// Store a memory. Fails soft: embedding or insert failure returns `None`.
    pub async fn add(
        &self,
        text: &str,
        kind: MemoryKind,
        metadata: serde_json::Value,
        scope: &MemoryScope,
    ) -> Option<i64> {
        let embedding = match self.embedder.embed(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => {
                warn!("embedder returned no vector, skipping memory write");
                return None;
            }
            Err(e) => {
                warn!("memory embedding failed, skipping write: {e}");
                return None;
            }
        };

        let now = Utc::now().timestamp();
        let embedding_json = serde_json::to_string(&embedding).ok()?;
        let tags_json = serde_json::to_string(&scope.tags).ok()?;

        let result = sqlx::query(
            r#"
            INSERT INTO memories (text, kind, embedding, metadata, session_id, user_id, tags,
                                  usage_count, created_at, last_accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(text)
        .bind(kind.as_str())
        .bind(&embedding_json)
        .bind(metadata.to_string())
        .bind(scope.session_id.as_deref())
        .bind(scope.user_id.as_deref())
        .bind(&tags_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(id, kind = kind.as_str(), "stored memory");
                Some(id)
            }
            Err(e) => {
                warn!("memory insert failed: {e}");
                None
            }
        }
    }

    /// Recall the top-k entries most similar to `query` under the given
    /// filters. Matching rows get their `usage_count` bumped and
    /// `last_accessed_at` refreshed atomically. Never errors: failures and
    /// empty matches both yield an empty list.
    pub async fn recall(&self, query: &str, options: &RecallOptions) -> Vec<SemanticMemoryEntry> {
        let query_embedding = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => return vec![],
            Err(e) => {
                warn!("recall embedding failed: {e}");
                return vec![];
            }
        };

        let rows = match self.fetch_candidates(options).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("memory recall query failed: {e}");
                return vec![];
            }
        };

        let mut scored: Vec<SemanticMemoryEntry> = rows
            .into_iter()
            .map(|mut entry| {
                let mut similarity = cosine_similarity(&query_embedding, &entry.embedding);
                for tag in &options.tags {
                    if entry.tags.iter().any(|t| t == tag) {
                        similarity += TAG_BOOST;
                    }
                }
                entry.similarity = similarity;
                entry
            })
            .filter(|entry| entry.similarity >= options.min_similarity)
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(options.k);

        if !scored.is_empty() {
            let ids: Vec<i64> = scored.iter().map(|e| e.id).collect();
            if let Err(e) = self.bump_usage(&ids).await {
                warn!("usage bump failed: {e}");
            } else {
                for entry in &mut scored {
                    entry.usage_count += 1;
                }
            }
        }

        scored
    }

    /// Delete entries older than `max_age_days` whose usage stayed below
    /// `min_usage_count`. Idempotent. Returns the number of removed rows.
    pub async fn prune(&self, max_age_days: i64, min_usage_count: i64) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - max_age_days * 86_400;
        let result = sqlx::query(
            "DELETE FROM memories WHERE created_at < ? AND usage_count < ?",
        )
        .bind(cutoff)
        .bind(min_usage_count)
        .execute(&self.pool)
        .await
        .map_err(|e| SibylError::capability("memory", e.to_string()))?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "pruned semantic memory");
        }
        Ok(removed)
    }

    /// Total entry count plus a per-kind breakdown.
    pub async fn stats(&self) -> Result<MemoryStats> {
        let rows = sqlx::query("SELECT kind, COUNT(*) as count FROM memories GROUP BY kind")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SibylError::capability("memory", e.to_string()))?;

        let mut by_kind = HashMap::new();
        let mut total = 0i64;
        for row in rows {
            let kind: String = row.get("kind");
            let count: i64 = row.get("count");
            total += count;
            by_kind.insert(kind, count);
        }
        Ok(MemoryStats { total, by_kind })
    }

    async fn fetch_candidates(
        &self,
        options: &RecallOptions,
    ) -> std::result::Result<Vec<SemanticMemoryEntry>, sqlx::Error> {
        let mut sql = String::from(
            "SELECT id, text, kind, embedding, metadata, session_id, user_id, tags,
                    usage_count, created_at, last_accessed_at
             FROM memories WHERE 1=1",
        );
        if options.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if options.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if options.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if options.max_age_days.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(kind) = options.kind {
            query = query.bind(kind.as_str());
        }
        if let Some(session_id) = &options.session_id {
            query = query.bind(session_id);
        }
        if let Some(user_id) = &options.user_id {
            query = query.bind(user_id);
        }
        if let Some(days) = options.max_age_days {
            query = query.bind(Utc::now().timestamp() - days * 86_400);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let kind: String = row.get("kind");
                let embedding: String = row.get("embedding");
                let metadata: String = row.get("metadata");
                let tags: String = row.get("tags");
                Some(SemanticMemoryEntry {
                    id: row.get("id"),
                    text: row.get("text"),
                    kind: MemoryKind::parse(&kind)?,
                    embedding: serde_json::from_str(&embedding).ok()?,
                    metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                    session_id: row.get("session_id"),
                    user_id: row.get("user_id"),
                    tags: serde_json::from_str(&tags).unwrap_or_default(),
                    usage_count: row.get("usage_count"),
                    created_at: row.get("created_at"),
                    last_accessed_at: row.get("last_accessed_at"),
                    similarity: 0.0,
                })
            })
            .collect())
    }

    async fn bump_usage(&self, ids: &[i64]) -> std::result::Result<(), sqlx::Error> {
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE memories SET usage_count = usage_count + 1, last_accessed_at = ? WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(Utc::now().timestamp());
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}
