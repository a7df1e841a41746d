//! Operational metrics: a typed event log plus daily rollups.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::error;

use noema_store::{clock, JsonlLog, Workspace};

use crate::reflection::TaskOutcome;
use crate::signal::SignalPriority;

/// One line of `metrics/events.jsonl`. The tag is the `event_type` field;
/// unknown variants fail deserialization and are skipped by the reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "lowercase")]
pub enum MetricsEvent {
    Task {
        timestamp: String,
        task_id: String,
        outcome: TaskOutcome,
        tokens: usize,
        model: String,
        duration_ms: u64,
        #[serde(default)]
        user_corrections: u32,
        #[serde(default)]
        error_type: Option<String>,
    },
    Signal {
        timestamp: String,
        signal_type: String,
        priority: SignalPriority,
        source: String,
    },
    Proposal {
        timestamp: String,
        proposal_id: String,
        level: u8,
        status: String,
        #[serde(default)]
        files_affected: Vec<String>,
    },
}

impl MetricsEvent {
    fn timestamp(&self) -> &str {
        match self {
            MetricsEvent::Task { timestamp, .. }
            | MetricsEvent::Signal { timestamp, .. }
            | MetricsEvent::Proposal { timestamp, .. } => timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u64,
    pub success: u64,
    pub partial: u64,
    pub failure: u64,
    pub success_rate: f64,
}

/// The shape flushed to `metrics/daily/<date>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: String,
    pub tasks: TaskCounts,
    /// Per-model token counts plus a `total` entry.
    pub tokens: BTreeMap<String, u64>,
    pub user_corrections: u64,
    pub signals_detected: u64,
    pub observer_deep_analyses: u64,
    pub architect_proposals: u64,
    pub modifications_executed: u64,
    pub modifications_rolled_back: u64,
}

impl DailySummary {
    fn empty(date: &str) -> Self {
        let mut tokens = BTreeMap::new();
        tokens.insert("total".to_string(), 0);
        Self {
            date: date.to_string(),
            tasks: TaskCounts::default(),
            tokens,
            user_corrections: 0,
            signals_detected: 0,
            observer_deep_analyses: 0,
            architect_proposals: 0,
            modifications_executed: 0,
            modifications_rolled_back: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrendPoint {
    pub date: String,
    pub value: f64,
}

pub struct MetricsTracker {
    events: JsonlLog,
    daily_dir: PathBuf,
}

impl MetricsTracker {
    pub fn new(workspace: &Workspace) -> Self {
        Self {
            events: JsonlLog::new(workspace.metrics_events_log()),
            daily_dir: workspace.daily_metrics_dir(),
        }
    }

    pub fn record_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        tokens: usize,
        model: &str,
        duration_ms: u64,
        user_corrections: u32,
        error_type: Option<String>,
    ) {
        self.append(MetricsEvent::Task {
            timestamp: clock::now_iso(),
            task_id: task_id.to_string(),
            outcome,
            tokens,
            model: model.to_string(),
            duration_ms,
            user_corrections,
            error_type,
        });
    }

    pub fn record_signal(&self, signal_type: &str, priority: SignalPriority, source: &str) {
        self.append(MetricsEvent::Signal {
            timestamp: clock::now_iso(),
            signal_type: signal_type.to_string(),
            priority,
            source: source.to_string(),
        });
    }

    pub fn record_proposal(
        &self,
        proposal_id: &str,
        level: u8,
        status: &str,
        files_affected: Vec<String>,
    ) {
        self.append(MetricsEvent::Proposal {
            timestamp: clock::now_iso(),
            proposal_id: proposal_id.to_string(),
            level,
            status: status.to_string(),
            files_affected,
        });
    }

    /// Aggregate all events whose timestamp falls on the given date
    /// (today when `None`).
    pub fn get_daily_summary(&self, date: Option<&str>) -> DailySummary {
        let day = date.map(str::to_string).unwrap_or_else(clock::today);
        let mut summary = DailySummary::empty(&day);

        for event in self.events_for_date(&day) {
            match event {
                MetricsEvent::Task {
                    outcome,
                    tokens,
                    model,
                    user_corrections,
                    ..
                } => {
                    summary.tasks.total += 1;
                    match outcome {
                        TaskOutcome::Success => summary.tasks.success += 1,
                        TaskOutcome::Partial => summary.tasks.partial += 1,
                        TaskOutcome::Failure => summary.tasks.failure += 1,
                    }
                    *summary.tokens.entry(model).or_insert(0) += tokens as u64;
                    *summary.tokens.entry("total".to_string()).or_insert(0) += tokens as u64;
                    summary.user_corrections += u64::from(user_corrections);
                }
                MetricsEvent::Signal { signal_type, .. } => {
                    summary.signals_detected += 1;
                    if signal_type == "observer_deep_analysis" {
                        summary.observer_deep_analyses += 1;
                    }
                }
                MetricsEvent::Proposal { status, .. } => {
                    summary.architect_proposals += 1;
                    match status.as_str() {
                        "executed" => summary.modifications_executed += 1,
                        "rolled_back" => summary.modifications_rolled_back += 1,
                        _ => {}
                    }
                }
            }
        }

        if summary.tasks.total > 0 {
            summary.tasks.success_rate =
                summary.tasks.success as f64 / summary.tasks.total as f64;
        }
        summary
    }

    /// Success rate over the trailing `days` days, today included.
    pub fn get_success_rate(&self, days: i64) -> f64 {
        if days <= 0 {
            return 0.0;
        }
        self.success_rate_in_window(days, 1)
    }

    /// Day-bucketed trend of one metric over the trailing window.
    pub fn get_trend(&self, metric: &str, days: i64) -> Result<Vec<TrendPoint>> {
        if days <= 0 {
            return Ok(Vec::new());
        }
        if !matches!(
            metric,
            "success_rate" | "total_tasks" | "total_tokens" | "user_corrections"
        ) {
            bail!("unsupported metric: {metric}");
        }

        let today = clock::now().date();
        let start = today - Duration::days(days - 1);
        let mut trend = Vec::with_capacity(days as usize);
        for offset in 0..days {
            let day = (start + Duration::days(offset)).format("%Y-%m-%d").to_string();
            let summary = self.get_daily_summary(Some(&day));
            let value = match metric {
                "success_rate" => summary.tasks.success_rate,
                "total_tasks" => summary.tasks.total as f64,
                "total_tokens" => summary.tokens.get("total").copied().unwrap_or(0) as f64,
                _ => summary.user_corrections as f64,
            };
            trend.push(TrendPoint { date: day, value });
        }
        Ok(trend)
    }

    /// Repair is warranted when CRITICAL signals pile up (≥3 in 24 h) or the
    /// recent 3-day success rate drops more than 20% below the preceding
    /// 7-day baseline (which must be non-zero to count).
    pub fn should_trigger_repair(&self) -> bool {
        if self.critical_signals_in_last_24h() >= 3 {
            return true;
        }
        let baseline = self.success_rate_in_window(10, 4);
        if baseline <= 0.0 {
            return false;
        }
        let recent = self.success_rate_in_window(3, 1);
        (baseline - recent) / baseline > 0.20
    }

    /// Write the daily summary to `metrics/daily/<date>.yaml`.
    pub fn flush_daily(&self, date: Option<&str>) -> Result<()> {
        let summary = self.get_daily_summary(date);
        std::fs::create_dir_all(&self.daily_dir)?;
        let path = self.daily_dir.join(format!("{}.yaml", summary.date));
        std::fs::write(&path, serde_yaml::to_string(&summary)?)?;
        Ok(())
    }

    fn append(&self, event: MetricsEvent) {
        if let Err(err) = self.events.append(&event) {
            error!(%err, "failed to append metrics event");
        }
    }

    fn events_for_date(&self, date: &str) -> Vec<MetricsEvent> {
        self.events
            .read_all::<MetricsEvent>()
            .into_iter()
            .filter(|event| event.timestamp().starts_with(date))
            .collect()
    }

    fn events_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<MetricsEvent> {
        self.events
            .read_all::<MetricsEvent>()
            .into_iter()
            .filter(|event| {
                clock::parse_iso(event.timestamp())
                    .map(|ts| {
                        let day = ts.date();
                        start <= day && day <= end
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    fn critical_signals_in_last_24h(&self) -> usize {
        let cutoff = clock::now() - Duration::hours(24);
        self.events
            .read_all::<MetricsEvent>()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    MetricsEvent::Signal {
                        priority: SignalPriority::Critical,
                        ..
                    }
                ) && clock::parse_iso(event.timestamp()).is_some_and(|ts| ts >= cutoff)
            })
            .count()
    }

    fn success_rate_in_window(&self, start_days_ago: i64, end_days_ago: i64) -> f64 {
        let today = clock::now().date();
        let start = today - Duration::days(start_days_ago - 1);
        let end = today - Duration::days(end_days_ago - 1);

        let mut total = 0usize;
        let mut success = 0usize;
        for event in self.events_between(start, end) {
            if let MetricsEvent::Task { outcome, .. } = event {
                total += 1;
                if outcome == TaskOutcome::Success {
                    success += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            success as f64 / total as f64
        }
    }
}
