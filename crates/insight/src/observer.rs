//! Observer: a one-line light log per task, and scheduled deep analysis
//! over the accumulated day.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use noema_llm::{extract_json_object, LlmClient};
use noema_store::{clock, JsonlLog, Workspace};

use crate::reflection::{Reflection, ReflectionKind, TaskOutcome};
use crate::signal::{Signal, SignalPriority, SignalStore};
use crate::trace::TaskTrace;

const LIGHT_SYSTEM_PROMPT: &str = "You are the observer's light mode. Write a one-line \
observation note for the task below.\n\nOutput format: plain text, one line, at most 100 \
characters, capturing anything unusual, a pattern, or a point worth attention.\n\n\
If the task completed with nothing notable, output \"normal\".";

const DEEP_SYSTEM_PROMPT: &str = "You are the Observer, a system health analyst. You observe \
and report; you never decide changes.\n\nAnalyze the data below and identify patterns worth \
attention.\n\nFocus, in priority order:\n\
1. Genuine error patterns (wrong assumptions, missed considerations), not taste issues.\n\
2. Efficiency problems (wasted tokens, repeated work).\n\
3. Skill and knowledge gaps.\n\
4. Shifts in user preference (lowest priority, just record them).\n\n\
Respond with JSON in this shape:\n{\n  \"tasks_analyzed\": 12,\n  \"key_findings\": [\n    {\n\
      \"type\": \"error_pattern or efficiency or skill_gap or preference\",\n\
      \"description\": \"the concrete finding\",\n\
      \"confidence\": \"HIGH or MEDIUM or LOW\",\n\
      \"evidence\": [\"task_028 corrected\", \"task_033 corrected\"],\n\
      \"recommendation\": \"suggested direction for the architect\"\n    }\n  ],\n\
  \"overall_health\": \"good or degraded or critical\"\n}\n\n\
Sort key_findings by priority (error_pattern first).";

fn finding_priority(kind: &str) -> u8 {
    match kind {
        "error_pattern" => 0,
        "efficiency" => 1,
        "skill_gap" => 2,
        "preference" => 3,
        _ => 99,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeepTrigger {
    Daily,
    Emergency,
}

impl std::fmt::Display for DeepTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeepTrigger::Daily => "daily",
            DeepTrigger::Emergency => "emergency",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Good,
    Degraded,
    Critical,
}

impl Health {
    fn parse(value: &str) -> Self {
        match value {
            "degraded" => Health::Degraded,
            "critical" => Health::Critical,
            _ => Health::Good,
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Health::Good => "good",
            Health::Degraded => "degraded",
            Health::Critical => "critical",
        })
    }
}

/// One line of `observations/light_logs/<date>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightObservation {
    pub timestamp: String,
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub tokens: usize,
    pub model: String,
    pub signals: Vec<String>,
    pub error_type: Option<String>,
    /// At most 100 characters.
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub confidence: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepReport {
    pub trigger: DeepTrigger,
    pub date: String,
    pub tasks_analyzed: usize,
    pub key_findings: Vec<Finding>,
    pub overall_health: Health,
}

pub struct ObserverEngine {
    llm_light: Arc<dyn LlmClient>,
    llm_deep: Arc<dyn LlmClient>,
    light_model: String,
    deep_model: String,
    workspace: Workspace,
}

impl ObserverEngine {
    pub fn new(
        llm_light: Arc<dyn LlmClient>,
        llm_deep: Arc<dyn LlmClient>,
        light_model: impl Into<String>,
        deep_model: impl Into<String>,
        workspace: Workspace,
    ) -> Self {
        Self {
            llm_light,
            llm_deep,
            light_model: light_model.into(),
            deep_model: deep_model.into(),
            workspace,
        }
    }

    /// One light observation per task, appended to today's log. Outcome and
    /// error type come from the reflection when present, otherwise from the
    /// presence of user feedback.
    pub async fn lightweight_observe(
        &self,
        trace: &TaskTrace,
        reflection: Option<&Reflection>,
    ) -> LightObservation {
        let mut outcome = TaskOutcome::Success;
        let mut error_type = None;
        let mut signals = Vec::new();

        match reflection {
            Some(reflection) => {
                outcome = reflection.outcome;
                match reflection.kind {
                    ReflectionKind::Error => {
                        error_type = Some("ERROR".to_string());
                        signals.push("task_failure".to_string());
                    }
                    ReflectionKind::Preference => {
                        error_type = Some("PREFERENCE".to_string());
                        signals.push("user_pattern".to_string());
                    }
                    ReflectionKind::None => {}
                }
            }
            None if trace.user_feedback.is_some() => {
                outcome = TaskOutcome::Partial;
                signals.push("user_pattern".to_string());
            }
            None => {}
        }

        let response_head: String = trace.system_response.chars().take(500).collect();
        let reflection_text = reflection
            .and_then(|r| serde_json::to_string(r).ok())
            .unwrap_or_else(|| "none".to_string());
        let user_prompt = format!(
            "Task id: {}\nUser message: {}\nSystem response: {}\nUser feedback: {}\nReflection: {}",
            trace.task_id,
            trace.user_message,
            response_head,
            trace.user_feedback.as_deref().unwrap_or("none"),
            reflection_text,
        );

        let raw = self
            .llm_light
            .complete(LIGHT_SYSTEM_PROMPT, &user_prompt, &self.light_model, 120)
            .await;
        let note = raw
            .trim()
            .lines()
            .next()
            .filter(|line| !line.is_empty())
            .map(|line| line.chars().take(100).collect())
            .unwrap_or_else(|| "normal".to_string());

        let observation = LightObservation {
            timestamp: clock::now_iso(),
            task_id: trace.task_id.clone(),
            outcome,
            tokens: trace.tokens_used,
            model: trace.model.clone(),
            signals,
            error_type,
            note,
        };

        let log = JsonlLog::new(self.workspace.light_log_for(&clock::today()));
        if let Err(err) = log.append(&observation) {
            error!(%err, "failed to append light observation");
        }
        observation
    }

    /// Produce and persist the deep report for today. Model failure still
    /// yields a valid (empty-findings) report.
    pub async fn deep_analyze(&self, trigger: DeepTrigger) -> DeepReport {
        let today = clock::today();
        let light_logs: Vec<LightObservation> =
            JsonlLog::new(self.workspace.light_log_for(&today)).read_all();
        let active_signals: Vec<Signal> =
            JsonlLog::new(self.workspace.active_signals_log()).read_all();
        let rule_files = self.list_rule_files();

        let user_message = format!(
            "=== Today's light observation log ===\n{}\n\n=== Active signals ===\n{}\n\n\
             === Current rule files ===\n{}\n\nTrigger: {trigger}",
            serde_json::to_string(&light_logs).unwrap_or_default(),
            serde_json::to_string(&active_signals).unwrap_or_default(),
            serde_json::to_string(&rule_files).unwrap_or_default(),
        );

        let raw = self
            .llm_deep
            .complete(DEEP_SYSTEM_PROMPT, &user_message, &self.deep_model, 2000)
            .await;
        let parsed = extract_json_object(&raw);

        let report = match parsed {
            Some(parsed) => {
                let findings = normalize_findings(parsed.get("key_findings"));
                DeepReport {
                    trigger,
                    date: today.clone(),
                    tasks_analyzed: parsed
                        .get("tasks_analyzed")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as usize)
                        .unwrap_or(light_logs.len()),
                    key_findings: findings,
                    overall_health: Health::parse(
                        parsed
                            .get("overall_health")
                            .and_then(|v| v.as_str())
                            .unwrap_or("good"),
                    ),
                }
            }
            None => DeepReport {
                trigger,
                date: today.clone(),
                tasks_analyzed: light_logs.len(),
                key_findings: Vec::new(),
                overall_health: Health::Good,
            },
        };

        let markdown = render_markdown_report(&report, &light_logs, &active_signals);
        let path = self.workspace.deep_report_for(&today);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&path, markdown) {
            error!(%err, path = %path.display(), "failed to write deep report");
        }
        info!(%trigger, findings = report.key_findings.len(), "deep analysis complete");
        report
    }

    fn list_rule_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for tier in ["constitution", "experience"] {
            let dir = self.workspace.rules_dir().join(tier);
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "md") {
                        if let Some(rel) = self.workspace.relativize(&path) {
                            files.push(rel.display().to_string());
                        }
                    }
                }
            }
        }
        files.sort();
        files
    }
}

fn normalize_findings(raw: Option<&serde_json::Value>) -> Vec<Finding> {
    let items = raw.and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let mut findings: Vec<Finding> = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let item = item.as_object()?;
            let get = |key: &str| {
                item.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            Some(Finding {
                finding_id: item
                    .get("finding_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("f_{:03}", index + 1)),
                kind: {
                    let kind = get("type");
                    if kind.is_empty() {
                        "preference".to_string()
                    } else {
                        kind
                    }
                },
                description: get("description"),
                confidence: {
                    let confidence = get("confidence");
                    if confidence.is_empty() {
                        "LOW".to_string()
                    } else {
                        confidence
                    }
                },
                evidence: item
                    .get("evidence")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                recommendation: get("recommendation"),
            })
        })
        .collect();
    findings.sort_by_key(|finding| finding_priority(&finding.kind));
    findings
}

fn render_markdown_report(
    report: &DeepReport,
    light_logs: &[LightObservation],
    active_signals: &[Signal],
) -> String {
    let success = light_logs
        .iter()
        .filter(|row| row.outcome == TaskOutcome::Success)
        .count();
    let partial = light_logs
        .iter()
        .filter(|row| row.outcome == TaskOutcome::Partial)
        .count();
    let failure = light_logs
        .iter()
        .filter(|row| row.outcome == TaskOutcome::Failure)
        .count();
    let critical = active_signals
        .iter()
        .filter(|s| s.priority == SignalPriority::Critical)
        .count();
    let high = active_signals
        .iter()
        .filter(|s| s.priority == SignalPriority::High)
        .count();
    let tokens: usize = light_logs.iter().map(|row| row.tokens).sum();

    let mut lines = vec![
        format!("# Observer Deep Report - {}", report.date),
        String::new(),
        format!("> Trigger: {}", report.trigger),
        format!("> Tasks analyzed: {}", report.tasks_analyzed),
        format!("> System health: {}", report.overall_health),
        String::new(),
        "## Key Findings".to_string(),
        String::new(),
    ];

    if report.key_findings.is_empty() {
        lines.push("No high-confidence findings today.".to_string());
        lines.push(String::new());
    } else {
        for (index, finding) in report.key_findings.iter().enumerate() {
            lines.push(format!(
                "### {}. [{}] {}",
                index + 1,
                finding.kind,
                finding.description
            ));
            lines.push(format!("- **Confidence**: {}", finding.confidence));
            lines.push(format!("- **Evidence**: {:?}", finding.evidence));
            lines.push(format!("- **Recommendation**: {}", finding.recommendation));
            lines.push(String::new());
        }
    }

    lines.push("## Data Summary".to_string());
    lines.push(format!(
        "- Tasks today: {} (success {success}, partial {partial}, failure {failure})",
        light_logs.len()
    ));
    lines.push(format!(
        "- Signals: {} (CRITICAL: {critical}, HIGH: {high})",
        active_signals.len()
    ));
    lines.push(format!("- Tokens used: {tokens}"));
    lines.push(String::new());
    lines.join("\n")
}

/// Decides when deep analysis actually runs: once per day inside the ±30
/// minute window around the configured time, or immediately when CRITICAL
/// signals pile up. Emergency takes precedence over the daily check.
pub struct ObserverScheduler {
    observer: Arc<ObserverEngine>,
    signal_store: Arc<SignalStore>,
    daily_time: String,
    emergency_threshold: usize,
    daily_done_date: Mutex<Option<String>>,
}

impl ObserverScheduler {
    pub fn new(
        observer: Arc<ObserverEngine>,
        signal_store: Arc<SignalStore>,
        daily_time: impl Into<String>,
        emergency_threshold: usize,
    ) -> Self {
        Self {
            observer,
            signal_store,
            daily_time: daily_time.into(),
            emergency_threshold,
            daily_done_date: Mutex::new(None),
        }
    }

    pub async fn check_and_run(&self) -> Option<DeepReport> {
        let critical =
            self.signal_store
                .count_recent(None, Some(SignalPriority::Critical), 24);
        if critical >= self.emergency_threshold {
            return Some(self.observer.deep_analyze(DeepTrigger::Emergency).await);
        }

        let now = clock::now();
        let today = clock::today();
        let already_done = self
            .daily_done_date
            .lock()
            .expect("daily-done lock poisoned")
            .as_deref()
            == Some(today.as_str());
        if self.is_in_daily_window(now) && !already_done {
            let report = self.observer.deep_analyze(DeepTrigger::Daily).await;
            self.mark_daily_done();
            return Some(report);
        }
        None
    }

    pub fn mark_daily_done(&self) {
        *self
            .daily_done_date
            .lock()
            .expect("daily-done lock poisoned") = Some(clock::today());
    }

    /// Window check on a circular 24-hour clock, so a configured time near
    /// midnight still gets a correct ±30 minute window.
    pub fn is_in_daily_window(&self, now: chrono::NaiveDateTime) -> bool {
        use chrono::Timelike;
        let (hour, minute) = self.parse_daily_time();
        let now_minutes = (now.hour() * 60 + now.minute()) as i32;
        let target_minutes = (hour * 60 + minute) as i32;
        let delta = (now_minutes - target_minutes).abs();
        delta.min(1440 - delta) <= 30
    }

    fn parse_daily_time(&self) -> (u32, u32) {
        let mut parts = self.daily_time.splitn(2, ':');
        let hour = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .map(|h| h.min(23));
        let minute = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .map(|m| m.min(59));
        match (hour, minute) {
            (Some(hour), Some(minute)) => (hour, minute),
            _ => (2, 0),
        }
    }
}
