//! Token-budgeted prompt assembly.
//!
//! Sections are composed in descending priority so the stable parts
//! (constitution, task anchor) form a fixed prefix and the dynamic parts
//! come later. That ordering is load-bearing for prompt-prefix caching;
//! reordering sections is a user-visible regression.

use std::collections::BTreeMap;

use tracing::info;

use noema_memory::RulesInterpreter;

use crate::message::Message;

const DEFAULT_TOTAL_BUDGET: usize = 150_000;
const DEFAULT_OUTPUT_RESERVE: usize = 8_000;

/// Fixed share of the available budget granted to each section.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    pub total: usize,
    pub output_reserve: usize,
    pub system_identity_ratio: f64,
    pub task_anchor_ratio: f64,
    pub experience_rules_ratio: f64,
    pub memory_ratio: f64,
    pub history_ratio: f64,
    pub preferences_ratio: f64,
    pub error_trace_ratio: f64,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            total: DEFAULT_TOTAL_BUDGET,
            output_reserve: DEFAULT_OUTPUT_RESERVE,
            system_identity_ratio: 0.12,
            task_anchor_ratio: 0.04,
            experience_rules_ratio: 0.08,
            memory_ratio: 0.15,
            history_ratio: 0.25,
            preferences_ratio: 0.02,
            error_trace_ratio: 0.03,
        }
    }
}

impl TokenBudget {
    pub fn with_total(total: usize, output_reserve: usize) -> Self {
        Self {
            total,
            output_reserve,
            ..Self::default()
        }
    }

    pub fn available(&self) -> usize {
        self.total.saturating_sub(self.output_reserve)
    }

    fn section_budget(&self, ratio: f64) -> usize {
        (self.available() as f64 * ratio) as usize
    }
}

/// The assembled prompt plus the trimmed history that goes with it.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub system_prompt: String,
    pub conversation_history: Vec<Message>,
    pub total_tokens: usize,
    pub sections_used: Vec<String>,
    pub budget_usage: BTreeMap<String, usize>,
}

/// Derived usage view over an assembled context.
#[derive(Debug, Clone)]
pub struct ContextUsage {
    pub total_tokens: usize,
    pub budget_available: usize,
    pub usage_ratio: f64,
    pub sections: BTreeMap<String, usize>,
    pub needs_compaction: bool,
}

/// Coarse token estimate: two characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 2
}

/// Cut text down to a budget, appending a visible marker when shortened.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let max_chars = max_tokens * 2;
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n\n[... truncated due to token budget ...]")
}

struct Section {
    name: &'static str,
    content: String,
    tokens: usize,
    priority: u8,
}

pub struct ContextEngine {
    rules: RulesInterpreter,
    budget: TokenBudget,
    task_anchor: Option<String>,
}

impl ContextEngine {
    pub fn new(rules: RulesInterpreter, budget: TokenBudget) -> Self {
        Self {
            rules,
            budget,
            task_anchor: None,
        }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn set_budget(&mut self, budget: TokenBudget) {
        self.budget = budget;
    }

    pub fn rules(&self) -> &RulesInterpreter {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RulesInterpreter {
        &mut self.rules
    }

    pub fn set_task_anchor(&mut self, anchor: Option<String>) {
        self.task_anchor = anchor;
    }

    /// Compose the system prompt and trim the history, both within budget.
    pub fn assemble(
        &self,
        user_message: &str,
        conversation_history: &[Message],
        memories: &[String],
        user_preferences: &str,
        error_trace: &str,
    ) -> AssembledContext {
        let mut sections: Vec<Section> = Vec::new();
        let mut budget_usage = BTreeMap::new();

        // Constitution rules, the stable prefix.
        let identity_budget = self.budget.section_budget(self.budget.system_identity_ratio);
        let constitution = self.rules.build_section(user_message, identity_budget, 0);
        if !constitution.constitution_prompt.is_empty() {
            sections.push(Section {
                name: "constitution",
                content: constitution.constitution_prompt,
                tokens: constitution.constitution_tokens,
                priority: 100,
            });
        }
        budget_usage.insert("constitution".to_string(), constitution.constitution_tokens);

        // Task anchor.
        if let Some(anchor) = &self.task_anchor {
            let anchor_budget = self.budget.section_budget(self.budget.task_anchor_ratio);
            let text = truncate_to_tokens(&format!("## Current Task\n\n{anchor}"), anchor_budget);
            let tokens = estimate_tokens(&text);
            sections.push(Section {
                name: "task_anchor",
                content: text,
                tokens,
                priority: 90,
            });
            budget_usage.insert("task_anchor".to_string(), tokens);
        }

        // Experience rules, scored against the task.
        let experience_budget = self
            .budget
            .section_budget(self.budget.experience_rules_ratio);
        let experience = self.rules.build_section(user_message, 0, experience_budget);
        if !experience.experience_prompt.is_empty() {
            sections.push(Section {
                name: "experience_rules",
                content: experience.experience_prompt,
                tokens: experience.experience_tokens,
                priority: 70,
            });
        }
        budget_usage.insert("experience_rules".to_string(), experience.experience_tokens);

        // Retrieved memories.
        if !memories.is_empty() {
            let memory_budget = self.budget.section_budget(self.budget.memory_ratio);
            let joined = format!("## Related Memories\n\n{}", memories.join("\n\n---\n\n"));
            let text = truncate_to_tokens(&joined, memory_budget);
            let tokens = estimate_tokens(&text);
            sections.push(Section {
                name: "memory",
                content: text,
                tokens,
                priority: 60,
            });
            budget_usage.insert("memory".to_string(), tokens);
        }

        // User preferences.
        if !user_preferences.is_empty() {
            let pref_budget = self.budget.section_budget(self.budget.preferences_ratio);
            let text = truncate_to_tokens(
                &format!("## User Preferences\n\n{user_preferences}"),
                pref_budget,
            );
            let tokens = estimate_tokens(&text);
            sections.push(Section {
                name: "preferences",
                content: text,
                tokens,
                priority: 50,
            });
            budget_usage.insert("preferences".to_string(), tokens);
        }

        // Error trace to avoid repeating.
        if !error_trace.is_empty() {
            let err_budget = self.budget.section_budget(self.budget.error_trace_ratio);
            let text =
                truncate_to_tokens(&format!("## Mistakes to Avoid\n\n{error_trace}"), err_budget);
            let tokens = estimate_tokens(&text);
            sections.push(Section {
                name: "error_trace",
                content: text,
                tokens,
                priority: 40,
            });
            budget_usage.insert("error_trace".to_string(), tokens);
        }

        sections.sort_by(|a, b| b.priority.cmp(&a.priority));
        let system_prompt = sections
            .iter()
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let system_tokens: usize = sections.iter().map(|section| section.tokens).sum();

        // History gets its own slice of the budget after the prompt.
        let history_budget = self.budget.section_budget(self.budget.history_ratio);
        let trimmed = trim_history(conversation_history, history_budget);
        let history_tokens: usize = trimmed
            .iter()
            .map(|message| estimate_tokens(&message.content))
            .sum();
        budget_usage.insert("history".to_string(), history_tokens);

        let assembled = AssembledContext {
            system_prompt,
            conversation_history: trimmed,
            total_tokens: system_tokens + history_tokens,
            sections_used: sections.iter().map(|s| s.name.to_string()).collect(),
            budget_usage,
        };
        info!(
            total_tokens = assembled.total_tokens,
            sections = ?assembled.sections_used,
            "context assembled"
        );
        assembled
    }

    pub fn usage(&self, context: &AssembledContext) -> ContextUsage {
        let available = self.budget.available();
        let ratio = if available > 0 {
            context.total_tokens as f64 / available as f64
        } else {
            0.0
        };
        ContextUsage {
            total_tokens: context.total_tokens,
            budget_available: available,
            usage_ratio: ratio,
            sections: context.budget_usage.clone(),
            needs_compaction: available > 0 && ratio >= 0.85,
        }
    }
}

/// Keep the newest messages that fit, returned in chronological order.
/// Message contents are never altered.
fn trim_history(history: &[Message], max_tokens: usize) -> Vec<Message> {
    let mut kept = Vec::new();
    let mut used = 0;
    for message in history.iter().rev() {
        let tokens = estimate_tokens(&message.content);
        if used + tokens > max_tokens {
            break;
        }
        kept.push(message.clone());
        used += tokens;
    }
    kept.reverse();
    kept
}
