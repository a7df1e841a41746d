//! Post-task reflection: classify the trace, extract a lesson, persist it
//! by class. The engine always produces a valid record and never errors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use noema_llm::{extract_json_object, LlmClient};
use noema_store::{append_md_bullet, clock, JsonlLog, Workspace};

use crate::trace::TaskTrace;

const SYSTEM_PROMPT: &str = "You are a reflection engine. Analyze the task trace below and \
extract the lesson.\n\nRespond with exactly this JSON shape and nothing else:\n\
{\n  \"type\": \"ERROR or PREFERENCE or NONE\",\n\
  \"outcome\": \"SUCCESS or PARTIAL or FAILURE\",\n\
  \"lesson\": \"one-sentence lesson\",\n\
  \"root_cause\": \"wrong_assumption or missed_consideration or tool_misuse or knowledge_gap or null\",\n\
  \"reusable_experience\": \"a reusable takeaway, or null\"\n}\n\n\
Classification rules:\n\
- ERROR: there was a correct answer and the task got it wrong (wrong assumption, missed \
consideration, tool misuse, knowledge gap).\n\
- PREFERENCE: no ground truth, the output just did not match the user's taste (too long, \
wrong format, wrong tone).\n\
- NONE: nothing notable.\n\n\
When type is ERROR, root_cause is required.\n\
When type is PREFERENCE or NONE, root_cause must be null.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReflectionKind {
    Error,
    Preference,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskOutcome {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    WrongAssumption,
    MissedConsideration,
    ToolMisuse,
    KnowledgeGap,
}

impl RootCause {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "wrong_assumption" => Some(Self::WrongAssumption),
            "missed_consideration" => Some(Self::MissedConsideration),
            "tool_misuse" => Some(Self::ToolMisuse),
            "knowledge_gap" => Some(Self::KnowledgeGap),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WrongAssumption => "wrong_assumption",
            Self::MissedConsideration => "missed_consideration",
            Self::ToolMisuse => "tool_misuse",
            Self::KnowledgeGap => "knowledge_gap",
        }
    }
}

/// Invariant: `root_cause` is `Some` iff `kind == Error`; normalisation
/// enforces it on every record, including fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: ReflectionKind,
    pub outcome: TaskOutcome,
    pub lesson: String,
    pub root_cause: Option<RootCause>,
    pub reusable_experience: Option<String>,
    pub timestamp: String,
}

pub struct ReflectionEngine {
    llm: Arc<dyn LlmClient>,
    model: String,
    workspace: Workspace,
    reflections_log: JsonlLog,
    error_log: JsonlLog,
}

impl ReflectionEngine {
    /// `model` is the light-tier model name.
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, workspace: Workspace) -> Self {
        let reflections_log = JsonlLog::new(workspace.reflections_log());
        let error_log = JsonlLog::new(workspace.error_log());
        Self {
            llm,
            model: model.into(),
            workspace,
            reflections_log,
            error_log,
        }
    }

    /// Analyze one trace. Always returns a valid reflection and always
    /// persists it, falling back to a `reflection_failed` record when the
    /// model output is missing or unusable.
    pub async fn lightweight_reflect(&self, trace: &TaskTrace) -> Reflection {
        let feedback = trace.user_feedback.as_deref().unwrap_or("none");
        let response_head: String = trace.system_response.chars().take(500).collect();
        let user_prompt = format!(
            "Task id: {}\nUser message: {}\nSystem response: {}\nUser feedback: {}\n\
             Tools used: {:?}\nTokens used: {}\nDuration: {}ms",
            trace.task_id,
            trace.user_message,
            response_head,
            feedback,
            trace.tools_used,
            trace.tokens_used,
            trace.duration_ms,
        );

        let raw = self
            .llm
            .complete(SYSTEM_PROMPT, &user_prompt, &self.model, 500)
            .await;

        let reflection = match extract_json_object(&raw) {
            Some(parsed) => normalize(&trace.task_id, &parsed),
            None => fallback(&trace.task_id),
        };

        self.write_reflection(&reflection);
        info!(
            task_id = %reflection.task_id,
            kind = ?reflection.kind,
            outcome = ?reflection.outcome,
            "reflection recorded"
        );
        reflection
    }

    /// Persist a reflection by class. Write failures are logged; none of
    /// them propagate.
    pub fn write_reflection(&self, reflection: &Reflection) {
        if let Err(err) = self.reflections_log.append(reflection) {
            error!(%err, "failed to append reflections.jsonl");
        }

        match reflection.kind {
            ReflectionKind::Preference => {
                if let Err(err) = append_md_bullet(
                    &self.workspace.preferences_file(),
                    "User Preferences",
                    &format!(
                        "{} [{}] {}",
                        reflection.timestamp, reflection.task_id, reflection.lesson
                    ),
                ) {
                    error!(%err, "failed to append preferences.md");
                }
            }
            ReflectionKind::Error => {
                if let Err(err) = self.error_log.append(reflection) {
                    error!(%err, "failed to append error_log.jsonl");
                }
                let root = reflection
                    .root_cause
                    .map(RootCause::as_str)
                    .unwrap_or("unknown");
                if let Err(err) = append_md_bullet(
                    &self.workspace.error_patterns_file(),
                    "Known Error Patterns",
                    &format!(
                        "{} [{}] ({}) {}",
                        reflection.timestamp, reflection.task_id, root, reflection.lesson
                    ),
                ) {
                    error!(%err, "failed to append error_patterns.md");
                }
            }
            ReflectionKind::None => {}
        }
    }
}

fn fallback(task_id: &str) -> Reflection {
    Reflection {
        task_id: task_id.to_string(),
        kind: ReflectionKind::None,
        outcome: TaskOutcome::Success,
        lesson: "reflection_failed".to_string(),
        root_cause: None,
        reusable_experience: None,
        timestamp: clock::now_iso(),
    }
}

/// Clamp a parsed model object onto the closed schema. Out-of-range values
/// fall back to NONE / SUCCESS; an ERROR with an invalid root cause gets
/// `knowledge_gap`; any other kind forces the root cause to null.
fn normalize(task_id: &str, parsed: &serde_json::Value) -> Reflection {
    let kind = match parsed
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("ERROR") => ReflectionKind::Error,
        Some("PREFERENCE") => ReflectionKind::Preference,
        _ => ReflectionKind::None,
    };

    let outcome = match parsed
        .get("outcome")
        .and_then(|v| v.as_str())
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("PARTIAL") => TaskOutcome::Partial,
        Some("FAILURE") => TaskOutcome::Failure,
        _ => TaskOutcome::Success,
    };

    let lesson = parsed
        .get("lesson")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("reflection_failed")
        .to_string();

    let root_cause = if kind == ReflectionKind::Error {
        parsed
            .get("root_cause")
            .and_then(|v| v.as_str())
            .and_then(RootCause::parse)
            .or(Some(RootCause::KnowledgeGap))
    } else {
        None
    };

    let reusable_experience = parsed
        .get("reusable_experience")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Reflection {
        task_id: task_id.to_string(),
        kind,
        outcome,
        lesson,
        root_cause,
        reusable_experience,
        timestamp: clock::now_iso(),
    }
}
