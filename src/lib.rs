//! Sibyl - Agentic retrieval-augmented generation orchestrator
//!
//! Coordinates a hybrid knowledge base, optional web search, an LLM used for
//! classification, planning, synthesis and critique, and short-term plus
//! durable memory stores into one grounded-answer pipeline:
//! intent routing → context assembly → planning → tool dispatch →
//! synthesis → critique-revise loop, with streaming event emission and
//! per-section token budgeting.

pub mod capabilities;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod memory;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod testing;
pub mod tokens;
pub mod trace;
pub mod types;

pub use config::SibylConfig;
pub use error::{Result, SibylError};
pub use events::{EventSink, SessionEvent};
pub use pipeline::{Orchestrator, SessionMode};
pub use trace::SessionTrace;
pub use types::{ChatResponse, Message, Reference, Role};
