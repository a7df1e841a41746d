//! The immutable record of one completed turn, handed from the agent loop
//! to the post-task chain.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTrace {
    /// Monotonic `task_NNNN` within one agent loop instance.
    pub task_id: String,
    pub timestamp: String,
    pub user_message: String,
    pub system_response: String,
    #[serde(default)]
    pub user_feedback: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Estimated context size, not a provider-reported count.
    pub tokens_used: usize,
    pub model: String,
    pub duration_ms: u64,
}

/// Per-task facts the signal detector consumes alongside the reflection.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub task_id: String,
    pub user_corrections: u32,
    pub tokens_used: usize,
    pub rules_used: Vec<String>,
}

impl TaskContext {
    pub fn from_trace(trace: &TaskTrace) -> Self {
        Self {
            task_id: trace.task_id.clone(),
            user_corrections: u32::from(trace.user_feedback.is_some()),
            tokens_used: trace.tokens_used,
            rules_used: Vec::new(),
        }
    }
}
