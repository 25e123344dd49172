//! The conversation engine: turn orchestration and prompt composition.
//!
//! One turn = one user message plus its assistant reply, processed as a
//! unit: history window + inbound persist + concurrent memory recall →
//! composed prompt → generation (batch or streaming) → durable record of
//! the exchange with full provenance → background sync to the memory engine.

pub mod engine;
pub mod prompt_composer;
pub mod types;

pub use engine::{ConversationEngine, EngineError, LlmProvider, MemoryProvider, TurnStore};
pub use prompt_composer::PromptComposer;
pub use types::{RecallResult, RecalledMemoryItem, TurnReply, TurnStreamEvent};
