//! Prompt composition under a fixed token budget, and compaction of long
//! conversations once usage crosses the threshold.

mod compaction;
mod engine;
mod message;

pub use compaction::{
    CompactionEngine, CompactionResult, CompactionStats, CompactionVerification, FlushedItem,
    Quality,
};
pub use engine::{
    estimate_tokens, truncate_to_tokens, AssembledContext, ContextEngine, ContextUsage,
    TokenBudget,
};
pub use message::{Message, MessageKind, Role};
