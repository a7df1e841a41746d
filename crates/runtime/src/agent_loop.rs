//! One turn end to end: retrieve, assemble, call the model, reply, then
//! hand the trace to the post-task queue.

use std::sync::Arc;

use tracing::{info, warn};

use noema_context::{CompactionEngine, ContextEngine, Message, TokenBudget};
use noema_insight::TaskTrace;
use noema_llm::LlmClient;
use noema_memory::{MemoryStore, RulesInterpreter};
use noema_store::{clock, JsonlLog, Workspace};

use crate::pipeline::PostTaskPipeline;

const FALLBACK_REPLY: &str =
    "Sorry, I could not produce a reply just now. Please try again in a moment.";
const KEEP_RECENT_ROUNDS: usize = 5;
const MAX_OUTPUT_TOKENS: u32 = 4000;

pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_history_rounds: usize,
    memory: MemoryStore,
    context: ContextEngine,
    compaction: CompactionEngine,
    history: Vec<Message>,
    task_counter: u32,
    pipeline: Option<PostTaskPipeline>,
}

impl AgentLoop {
    /// `model` answers the user; `light_model` powers compaction.
    pub fn new(
        workspace: Workspace,
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        light_model: impl Into<String>,
    ) -> Self {
        let rules = RulesInterpreter::load(workspace.rules_dir());
        let context = ContextEngine::new(rules, TokenBudget::default());
        let compaction = CompactionEngine::new(
            llm.clone(),
            light_model,
            JsonlLog::new(workspace.compaction_flush_log()),
        );
        Self {
            llm,
            model: model.into(),
            max_history_rounds: 20,
            memory: MemoryStore::new(workspace),
            context,
            compaction,
            history: Vec::new(),
            task_counter: 0,
            pipeline: None,
        }
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.context.set_budget(budget);
        self
    }

    pub fn with_max_history_rounds(mut self, rounds: usize) -> Self {
        self.max_history_rounds = rounds;
        self
    }

    /// Attach the post-task queue. Without one, turns still complete; they
    /// just leave no reflection, signals, observations, or metrics behind.
    pub fn attach_pipeline(&mut self, pipeline: PostTaskPipeline) {
        self.pipeline = Some(pipeline);
    }

    /// Take the pipeline back for draining at shutdown.
    pub fn take_pipeline(&mut self) -> Option<PostTaskPipeline> {
        self.pipeline.take()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.task_counter = 0;
    }

    /// Process one user turn and return its trace. The reply inside the
    /// trace is final; the post-task chain runs behind it.
    pub async fn process_message(
        &mut self,
        user_message: &str,
        user_feedback: Option<&str>,
        project: Option<&str>,
    ) -> TaskTrace {
        let start = std::time::Instant::now();
        self.task_counter += 1;
        let task_id = format!("task_{:04}", self.task_counter);
        let timestamp = clock::now_iso();

        // Retrieval.
        let memories = self.memory.relevant_memories(user_message, project, 5);
        let preferences = self.memory.user_preferences();
        let error_trace = self.memory.recent_errors(7);

        // Assembly.
        let anchor: String = user_message.chars().take(200).collect();
        self.context.set_task_anchor(Some(anchor));
        let mut assembled = self.context.assemble(
            user_message,
            &self.history,
            &memories,
            &preferences,
            &error_trace,
        );

        // Compaction when the budget is nearly spent. A failed or no-op
        // compaction never aborts the turn.
        if self.context.usage(&assembled).needs_compaction {
            let result = self.compaction.compact(&self.history, KEEP_RECENT_ROUNDS).await;
            info!(
                original_tokens = result.stats.original_tokens,
                compacted_tokens = result.stats.compacted_tokens,
                "conversation compacted"
            );
            self.history = result.compacted_history;
            assembled = self.context.assemble(
                user_message,
                &self.history,
                &memories,
                &preferences,
                &error_trace,
            );
        }

        // Inference. An empty reply becomes a polite fallback.
        let mut response = self
            .llm
            .complete(
                &assembled.system_prompt,
                user_message,
                &self.model,
                MAX_OUTPUT_TOKENS,
            )
            .await;
        if response.is_empty() {
            warn!(
                message = %user_message.chars().take(80).collect::<String>(),
                "model returned an empty response"
            );
            response = FALLBACK_REPLY.to_string();
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        // History: append the round, keep the newest rounds.
        self.history.push(Message::user(user_message));
        self.history.push(Message::assistant(response.clone()));
        let max_messages = self.max_history_rounds * 2;
        if self.history.len() > max_messages {
            let drop = self.history.len() - max_messages;
            self.history.drain(..drop);
        }

        let trace = TaskTrace {
            task_id,
            timestamp,
            user_message: user_message.to_string(),
            system_response: response,
            user_feedback: user_feedback.map(str::to_string),
            tools_used: Vec::new(),
            tokens_used: assembled.total_tokens,
            model: self.model.clone(),
            duration_ms,
        };

        // Fire and forget; the reply is already final.
        if let Some(pipeline) = &self.pipeline {
            pipeline.dispatch(trace.clone());
        }
        trace
    }
}
