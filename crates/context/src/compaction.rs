//! Conversation compaction: once usage crosses the threshold, the old
//! prefix is distilled into a summary message and durable items are flushed
//! to the memory log, while the recent tail is kept verbatim.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use noema_llm::{extract_json_array, LlmClient};
use noema_store::{clock, JsonlLog};

use crate::message::Message;

const COMPACTION_THRESHOLD: f64 = 0.85;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation compactor. Compress the \
conversation history below into a concise summary.\n\nRequirements:\n\
1. Keep every key decision and conclusion.\n\
2. Keep important facts (numbers, dates, names).\n\
3. Keep unfinished tasks and open to-dos.\n\
4. Drop pleasantries, repetition, and intermediate reasoning.\n\
5. Target 10-20% of the original length.\n\n\
Output plain text, no JSON.";

const FLUSH_SYSTEM_PROMPT: &str = "Extract the information worth remembering long-term \
from the conversation below.\n\nOutput a JSON array:\n\
[\n  {\"type\": \"decision\", \"content\": \"user chose React over Vue\"},\n\
  {\"type\": \"fact\", \"content\": \"the project deadline is March 15\"},\n\
  {\"type\": \"preference\", \"content\": \"user prefers short answers\"},\n\
  {\"type\": \"todo\", \"content\": \"research the cron mechanism\"}\n]\n\n\
Return an empty array [] when there is nothing worth keeping.";

/// Markers that flag a message as carrying a key decision. Checked by
/// substring so "decided" and "decision" both hit.
const DECISION_MARKERS: &[&str] = &["decision", "decided", "deadline", "TODO"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlushedItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
struct FlushRecord<'a> {
    timestamp: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Good,
    Acceptable,
    Poor,
}

#[derive(Debug, Clone)]
pub struct CompactionVerification {
    pub quality: Quality,
    pub missing_key_info: Vec<String>,
    pub key_decisions_preserved: usize,
    pub key_decisions_total: usize,
}

#[derive(Debug, Clone)]
pub struct CompactionStats {
    pub original_tokens: usize,
    pub compacted_tokens: usize,
    pub compression_ratio: f64,
    pub key_decisions_preserved: usize,
    pub key_decisions_total: usize,
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub compacted_history: Vec<Message>,
    pub summary: String,
    pub flushed_to_memory: Vec<FlushedItem>,
    pub stats: CompactionStats,
}

pub struct CompactionEngine {
    llm: Arc<dyn LlmClient>,
    model: String,
    flush_log: JsonlLog,
}

impl CompactionEngine {
    /// `flush_log` is `memory/user/compaction_flush.jsonl`; `model` is the
    /// light-tier model name.
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, flush_log: JsonlLog) -> Self {
        Self {
            llm,
            model: model.into(),
            flush_log,
        }
    }

    /// True once current usage reaches 85% of the budget.
    pub fn should_compact(&self, current_tokens: usize, budget: usize) -> bool {
        budget > 0 && (current_tokens as f64 / budget as f64) >= COMPACTION_THRESHOLD
    }

    /// Compact everything but the last `keep_recent` rounds. A history that
    /// already fits inside the tail is returned unchanged with ratio 1.0.
    pub async fn compact(&self, history: &[Message], keep_recent: usize) -> CompactionResult {
        let original_tokens = estimate_messages_tokens(history);
        let keep_count = keep_recent * 2;

        if history.len() <= keep_count {
            return CompactionResult {
                compacted_history: history.to_vec(),
                summary: String::new(),
                flushed_to_memory: Vec::new(),
                stats: CompactionStats {
                    original_tokens,
                    compacted_tokens: original_tokens,
                    compression_ratio: 1.0,
                    key_decisions_preserved: 0,
                    key_decisions_total: 0,
                },
            };
        }

        let split = history.len() - keep_count;
        let (old_messages, recent_messages) = history.split_at(split);

        let flushed = self.flush_to_memory(old_messages).await;
        let summary = self.summarize(old_messages).await;

        let mut compacted_history =
            Vec::with_capacity(recent_messages.len() + 1);
        compacted_history.push(Message::summary(summary.clone(), clock::now_iso()));
        compacted_history.extend_from_slice(recent_messages);

        let compacted_tokens = estimate_messages_tokens(&compacted_history);
        let compression_ratio = if original_tokens > 0 {
            compacted_tokens as f64 / original_tokens as f64
        } else {
            1.0
        };

        let verification = self.verify_compaction(old_messages, &summary, &flushed);
        info!(
            original_tokens,
            compacted_tokens,
            quality = ?verification.quality,
            "compaction complete"
        );

        CompactionResult {
            compacted_history,
            summary,
            flushed_to_memory: flushed,
            stats: CompactionStats {
                original_tokens,
                compacted_tokens,
                compression_ratio,
                key_decisions_preserved: verification.key_decisions_preserved,
                key_decisions_total: verification.key_decisions_total,
            },
        }
    }

    /// Quality is advisory: it never gates the compaction result.
    pub fn verify_compaction(
        &self,
        original: &[Message],
        summary: &str,
        flushed: &[FlushedItem],
    ) -> CompactionVerification {
        let decisions = extract_key_decisions(original);
        let total = decisions.len();
        if total == 0 {
            return CompactionVerification {
                quality: Quality::Good,
                missing_key_info: Vec::new(),
                key_decisions_preserved: 0,
                key_decisions_total: 0,
            };
        }

        let flushed_text = flushed
            .iter()
            .map(|item| item.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let target_text = format!("{summary} {flushed_text}");

        let mut preserved = 0;
        let mut missing = Vec::new();
        for decision in decisions {
            if target_text.contains(&decision) {
                preserved += 1;
            } else {
                missing.push(decision);
            }
        }

        let ratio = preserved as f64 / total as f64;
        let quality = if ratio >= 1.0 {
            Quality::Good
        } else if ratio >= 0.7 {
            Quality::Acceptable
        } else {
            Quality::Poor
        };

        CompactionVerification {
            quality,
            missing_key_info: missing,
            key_decisions_preserved: preserved,
            key_decisions_total: total,
        }
    }

    async fn flush_to_memory(&self, messages: &[Message]) -> Vec<FlushedItem> {
        if messages.is_empty() {
            return Vec::new();
        }

        let raw = self
            .llm
            .complete(
                FLUSH_SYSTEM_PROMPT,
                &messages_to_text(messages),
                &self.model,
                800,
            )
            .await;

        let extracted: Vec<FlushedItem> = extract_json_array(&raw)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();

        if extracted.is_empty() {
            return extracted;
        }

        let now = clock::now_iso();
        for item in &extracted {
            if let Err(err) = self.flush_log.append(&FlushRecord {
                timestamp: &now,
                kind: &item.kind,
                content: &item.content,
            }) {
                error!(%err, "failed to write compaction flush log");
            }
        }
        extracted
    }

    async fn summarize(&self, messages: &[Message]) -> String {
        if messages.is_empty() {
            return String::new();
        }
        let text = messages_to_text(messages);

        let raw = self
            .llm
            .complete(SUMMARY_SYSTEM_PROMPT, &text, &self.model, 1200)
            .await;
        let summary = raw.trim();
        if !summary.is_empty() {
            return summary.to_string();
        }
        // Empty model output: fall back to the head of the raw transcript.
        text.chars().take(500).collect()
    }
}

fn messages_to_text(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let timestamp = message.timestamp.as_deref().unwrap_or("");
            format!("[{timestamp}] {}: {}", message.role, message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Dual-rule estimator: CJK-heavy text packs roughly one token per two
/// characters, mostly-ASCII text one per four.
pub(crate) fn estimate_messages_tokens(messages: &[Message]) -> usize {
    let mut total_chars = 0usize;
    let mut non_ascii = 0usize;
    for message in messages {
        for ch in message.content.chars() {
            total_chars += 1;
            if !ch.is_ascii() {
                non_ascii += 1;
            }
        }
    }
    if total_chars == 0 {
        return 0;
    }
    if non_ascii as f64 / total_chars as f64 > 0.2 {
        (total_chars / 2).max(1)
    } else {
        (total_chars / 4).max(1)
    }
}

fn extract_key_decisions(messages: &[Message]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut decisions = Vec::new();
    for message in messages {
        if message.content.is_empty() {
            continue;
        }
        if DECISION_MARKERS
            .iter()
            .any(|marker| message.content.contains(marker))
        {
            let head: String = message.content.chars().take(80).collect();
            if seen.insert(head.clone()) {
                decisions.push(head);
            }
        }
    }
    decisions
}
