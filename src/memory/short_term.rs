// src/memory/short_term.rs
// Per-session summary bullets and salience notes with embedding cache

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::capabilities::embedder::Embedder;
use crate::context::compactor::CompactedHistory;

/// A single compacted summary sentence. The embedding is computed lazily on
/// first semantic use and cached here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryBullet {
    pub text: String,
    pub turn: u32,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// Snapshot of one session's short-term memory.
#[derive(Debug, Clone, Default)]
pub struct SessionMemory {
    pub summary_bullets: Vec<SummaryBullet>,
    pub salience_notes: Vec<String>,
}

/// In-process short-term memory, keyed by session id. Mutations within one
/// session are serialized by the write lock; sessions are independent.
pub struct ShortTermMemory {
    sessions: RwLock<HashMap<String, SessionMemory>>,
    max_items: usize,
}

impl ShortTermMemory {
    pub fn new(max_items: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_items,
        }
    }

    /// Append freshly compacted bullets and notes for a session, deduplicated
    /// by normalized text, keeping at most `max_items` most-recent of each.
    pub async fn upsert(&self, session_id: &str, turn: u32, compacted: &CompactedHistory) {
        let mut sessions = self.sessions.write().await;
        let memory = sessions.entry(session_id.to_string()).or_default();

        for bullet in &compacted.summary_bullets {
            let normalized = normalize(bullet);
            if memory
                .summary_bullets
                .iter()
                .any(|b| normalize(&b.text) == normalized)
            {
                continue;
            }
            memory.summary_bullets.push(SummaryBullet {
                text: bullet.clone(),
                turn,
                embedding: None,
            });
        }
        while memory.summary_bullets.len() > self.max_items {
            memory.summary_bullets.remove(0);
        }

        for note in &compacted.salience_notes {
            let normalized = normalize(note);
            if memory.salience_notes.iter().any(|n| normalize(n) == normalized) {
                continue;
            }
            memory.salience_notes.push(note.clone());
        }
        while memory.salience_notes.len() > self.max_items {
            memory.salience_notes.remove(0);
        }

        debug!(
            session_id,
            bullets = memory.summary_bullets.len(),
            notes = memory.salience_notes.len(),
            "updated short-term memory"
        );
    }

    /// Load a snapshot of a session's memory. With `max_age_turns`, bullets
    /// older than that many turns behind the newest are dropped.
    pub async fn load(&self, session_id: &str, max_age_turns: Option<u32>) -> SessionMemory {
        let sessions = self.sessions.read().await;
        let Some(memory) = sessions.get(session_id) else {
            return SessionMemory::default();
        };

        let mut snapshot = memory.clone();
        if let Some(age) = max_age_turns {
            let latest = snapshot
                .summary_bullets
                .iter()
                .map(|b| b.turn)
                .max()
                .unwrap_or(0);
            let cutoff = latest.saturating_sub(age);
            snapshot.summary_bullets.retain(|b| b.turn >= cutoff);
        }
        snapshot
    }

    /// Clear one session, or everything.
    pub async fn clear(&self, session_id: Option<&str>) {
        let mut sessions = self.sessions.write().await;
        match session_id {
            Some(id) => {
                sessions.remove(id);
            }
            None => sessions.clear(),
        }
    }

    /// Compute and cache embeddings for bullets that do not have one yet.
    /// Fails soft: an embedding failure leaves the cache as-is.
    pub async fn embed_missing(&self, session_id: &str, embedder: &Arc<dyn Embedder>) {
        let texts: Vec<String> = {
            let sessions = self.sessions.read().await;
            let Some(memory) = sessions.get(session_id) else {
                return;
            };
            memory
                .summary_bullets
                .iter()
                .filter(|b| b.embedding.is_none())
                .map(|b| b.text.clone())
                .collect()
        };
        if texts.is_empty() {
            return;
        }

        let embeddings = match embedder.embed(&texts).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                warn!(session_id, "bullet embedding failed: {e}");
                return;
            }
        };

        let mut sessions = self.sessions.write().await;
        if let Some(memory) = sessions.get_mut(session_id) {
            let mut supplied = embeddings.into_iter();
            for bullet in memory
                .summary_bullets
                .iter_mut()
                .filter(|b| b.embedding.is_none())
            {
                match supplied.next() {
                    Some(embedding) => bullet.embedding = Some(embedding),
                    None => break,
                }
            }
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stubs::StubEmbedder;

    fn compacted(bullets: &[&str], notes: &[&str]) -> CompactedHistory {
        CompactedHistory {
            recent: vec![],
            summary_bullets: bullets.iter().map(|s| s.to_string()).collect(),
            salience_notes: notes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let store = ShortTermMemory::new(10);
        store
            .upsert("s1", 1, &compacted(&["likes cats"], &["pets: owns a cat"]))
            .await;

        let memory = store.load("s1", None).await;
        assert_eq!(memory.summary_bullets.len(), 1);
        assert_eq!(memory.salience_notes, vec!["pets: owns a cat"]);
    }

    #[tokio::test]
    async fn test_dedup_by_normalized_text() {
        let store = ShortTermMemory::new(10);
        store.upsert("s1", 1, &compacted(&["Likes  Cats"], &[])).await;
        store.upsert("s1", 2, &compacted(&["likes cats"], &[])).await;

        let memory = store.load("s1", None).await;
        assert_eq!(memory.summary_bullets.len(), 1);
        assert_eq!(memory.summary_bullets[0].turn, 1);
    }

    #[tokio::test]
    async fn test_retention_cap_drops_oldest() {
        let store = ShortTermMemory::new(2);
        store.upsert("s1", 1, &compacted(&["a"], &[])).await;
        store.upsert("s1", 2, &compacted(&["b"], &[])).await;
        store.upsert("s1", 3, &compacted(&["c"], &[])).await;

        let memory = store.load("s1", None).await;
        let texts: Vec<_> = memory.summary_bullets.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_age_filter() {
        let store = ShortTermMemory::new(10);
        store.upsert("s1", 1, &compacted(&["old"], &[])).await;
        store.upsert("s1", 9, &compacted(&["new"], &[])).await;

        let memory = store.load("s1", Some(3)).await;
        let texts: Vec<_> = memory.summary_bullets.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["new"]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = ShortTermMemory::new(10);
        store.upsert("s1", 1, &compacted(&["a"], &[])).await;

        assert!(store.load("s2", None).await.summary_bullets.is_empty());

        store.clear(Some("s1")).await;
        assert!(store.load("s1", None).await.summary_bullets.is_empty());
    }

    #[tokio::test]
    async fn test_embed_missing_caches() {
        let store = ShortTermMemory::new(10);
        store.upsert("s1", 1, &compacted(&["a", "b"], &[])).await;

        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        store.embed_missing("s1", &embedder).await;

        let memory = store.load("s1", None).await;
        assert!(memory.summary_bullets.iter().all(|b| b.embedding.is_some()));

        // A second call has nothing left to embed.
        store.embed_missing("s1", &embedder).await;
        let again = store.load("s1", None).await;
        assert_eq!(
            memory.summary_bullets[0].embedding,
            again.summary_bullets[0].embedding
        );
    }
}
