// src/memory/mod.rs
// Session-scoped short-term memory and durable semantic memory

pub mod semantic;
pub mod short_term;

pub use semantic::{
    MemoryKind, MemoryScope, MemoryStats, RecallOptions, SemanticMemoryEntry, SemanticMemoryStore,
};
pub use short_term::{SessionMemory, ShortTermMemory, SummaryBullet};
