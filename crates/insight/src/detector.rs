//! Signal derivation: per-task rules over one reflection, and cross-task
//! pattern rules over the recent signal window and metrics events.

use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use noema_store::{clock, JsonlLog, Workspace};

use crate::metrics::MetricsEvent;
use crate::reflection::{Reflection, ReflectionKind, TaskOutcome};
use crate::signal::{Signal, SignalPriority, SignalStore};
use crate::trace::TaskContext;

pub struct SignalDetector {
    store: Arc<SignalStore>,
    metrics_events: JsonlLog,
}

impl SignalDetector {
    pub fn new(store: Arc<SignalStore>, workspace: &Workspace) -> Self {
        Self {
            store,
            metrics_events: JsonlLog::new(workspace.metrics_events_log()),
        }
    }

    /// Per-task rules, each contributing at most one signal. Detected
    /// signals are persisted before being returned.
    pub fn detect(&self, reflection: &Reflection, ctx: &TaskContext) -> Vec<Signal> {
        let task_id = &ctx.task_id;
        let source = format!("reflection:{task_id}");
        let mut detected = Vec::new();

        if ctx.user_corrections > 0 {
            detected.push(Signal::new(
                "user_correction",
                SignalPriority::Medium,
                source.clone(),
                format!("User corrected output ({} time(s)).", ctx.user_corrections),
                vec![task_id.clone()],
            ));
        }

        if reflection.kind == ReflectionKind::Error && reflection.outcome == TaskOutcome::Failure {
            let mut description = "Task failed due to detected execution error.".to_string();
            if let Some(cause) = reflection.root_cause {
                description.push_str(&format!(" root_cause={}", cause.as_str()));
            }
            if !reflection.lesson.is_empty() {
                description.push_str(&format!(" lesson={}", reflection.lesson));
            }
            detected.push(Signal::new(
                "task_failure",
                SignalPriority::High,
                source.clone(),
                description,
                vec![task_id.clone()],
            ));
        }

        if reflection.kind == ReflectionKind::None
            && reflection.outcome == TaskOutcome::Success
            && !ctx.rules_used.is_empty()
        {
            detected.push(Signal::new(
                "rule_validated",
                SignalPriority::Low,
                source.clone(),
                "Rule-assisted task completed successfully.",
                vec![task_id.clone()],
            ));
        }

        if ctx.tokens_used > 10_000 {
            detected.push(Signal::new(
                "efficiency_opportunity",
                SignalPriority::Low,
                source,
                format!("High token usage detected: {}.", ctx.tokens_used),
                vec![task_id.clone()],
            ));
        }

        for signal in &detected {
            self.store.add(signal);
        }
        if !detected.is_empty() {
            info!(task_id = %task_id, count = detected.len(), "signals detected");
        }
        detected
    }

    /// Cross-task rules over the lookback window. Each pattern signal is
    /// idempotent per `(signal_type, source)`: if one already exists in the
    /// window it is not emitted again.
    pub fn detect_patterns(&self, lookback_hours: i64) -> Vec<Signal> {
        let lookback_hours = lookback_hours.max(1);
        let window_start = clock::now() - Duration::hours(lookback_hours);

        let recent_active: Vec<Signal> = self
            .store
            .get_active(None, None)
            .into_iter()
            .filter(|signal| {
                clock::parse_iso(&signal.timestamp).is_some_and(|ts| ts >= window_start)
            })
            .collect();

        let mut created = Vec::new();

        let failures: Vec<&Signal> = recent_active
            .iter()
            .filter(|signal| signal.signal_type == "task_failure")
            .collect();
        if failures.len() >= 2
            && !has_pattern(&recent_active, "repeated_error", "patterns:task_failure")
        {
            let mut related = Vec::new();
            for signal in &failures {
                for task in &signal.related_tasks {
                    if !related.contains(task) {
                        related.push(task.clone());
                    }
                }
            }
            created.push(Signal::new(
                "repeated_error",
                SignalPriority::High,
                "patterns:task_failure",
                format!(
                    "Repeated task_failure detected in last {lookback_hours}h ({} events).",
                    failures.len()
                ),
                related,
            ));
        }

        let user_patterns = recent_active
            .iter()
            .filter(|signal| signal.signal_type == "user_pattern")
            .count();
        if user_patterns >= 3 && !has_pattern(&recent_active, "user_pattern", "patterns:user_pattern")
        {
            created.push(Signal::new(
                "user_pattern",
                SignalPriority::Medium,
                "patterns:user_pattern",
                format!("Repeated user pattern detected ({user_patterns} events)."),
                Vec::new(),
            ));
        }

        if let Some(signal) = self.detect_performance_degradation() {
            if !has_pattern(&recent_active, "performance_degradation", "patterns:metrics") {
                created.push(signal);
            }
        }

        for signal in &created {
            self.store.add(signal);
        }
        created
    }

    /// Success-rate drop: last 3 days against the preceding 7-day baseline,
    /// computed from task events in `metrics/events.jsonl`. A drop over 15%
    /// of the baseline is CRITICAL.
    fn detect_performance_degradation(&self) -> Option<Signal> {
        let events: Vec<MetricsEvent> = self.metrics_events.read_all();
        if events.is_empty() {
            return None;
        }

        let now = clock::now();
        let recent_start = now - Duration::days(3);
        let baseline_start = now - Duration::days(10);

        let mut recent = (0usize, 0usize);
        let mut baseline = (0usize, 0usize);
        for event in &events {
            let MetricsEvent::Task {
                timestamp, outcome, ..
            } = event
            else {
                continue;
            };
            let Some(ts) = clock::parse_iso(timestamp) else {
                continue;
            };
            let bucket = if ts >= recent_start {
                &mut recent
            } else if ts >= baseline_start {
                &mut baseline
            } else {
                continue;
            };
            bucket.0 += 1;
            if *outcome == TaskOutcome::Success {
                bucket.1 += 1;
            }
        }

        let baseline_rate = if baseline.0 > 0 {
            baseline.1 as f64 / baseline.0 as f64
        } else {
            0.0
        };
        if baseline_rate <= 0.0 {
            return None;
        }
        let recent_rate = if recent.0 > 0 {
            recent.1 as f64 / recent.0 as f64
        } else {
            0.0
        };

        let drop_ratio = (baseline_rate - recent_rate) / baseline_rate;
        if drop_ratio <= 0.15 {
            return None;
        }

        Some(Signal::new(
            "performance_degradation",
            SignalPriority::Critical,
            "patterns:metrics",
            format!(
                "3-day success rate degraded by {:.1}% vs previous 7-day baseline.",
                drop_ratio * 100.0
            ),
            Vec::new(),
        ))
    }
}

fn has_pattern(signals: &[Signal], signal_type: &str, source: &str) -> bool {
    signals
        .iter()
        .any(|signal| signal.signal_type == signal_type && signal.source == source)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use noema_store::{clock, JsonlLog, Workspace};

    use crate::reflection::{Reflection, ReflectionKind, RootCause, TaskOutcome};
    use crate::signal::{Signal, SignalPriority, SignalStore};
    use crate::trace::TaskContext;

    use super::SignalDetector;

    fn setup() -> (tempfile::TempDir, Arc<SignalStore>, SignalDetector) {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let store = Arc::new(SignalStore::new(&workspace));
        let detector = SignalDetector::new(store.clone(), &workspace);
        (dir, store, detector)
    }

    fn reflection(kind: ReflectionKind, outcome: TaskOutcome) -> Reflection {
        Reflection {
            task_id: "task_0001".to_string(),
            kind,
            outcome,
            lesson: "wrong timezone assumption".to_string(),
            root_cause: (kind == ReflectionKind::Error).then_some(RootCause::WrongAssumption),
            reusable_experience: None,
            timestamp: clock::now_iso(),
        }
    }

    fn ctx(corrections: u32, tokens: usize) -> TaskContext {
        TaskContext {
            task_id: "task_0001".to_string(),
            user_corrections: corrections,
            tokens_used: tokens,
            rules_used: Vec::new(),
        }
    }

    #[test]
    fn corrected_failure_emits_both_signals() {
        let (_dir, store, detector) = setup();
        let detected = detector.detect(
            &reflection(ReflectionKind::Error, TaskOutcome::Failure),
            &ctx(1, 500),
        );

        let types: Vec<&str> = detected.iter().map(|s| s.signal_type.as_str()).collect();
        assert!(types.contains(&"user_correction"));
        assert!(types.contains(&"task_failure"));

        let failure = detected
            .iter()
            .find(|s| s.signal_type == "task_failure")
            .unwrap();
        assert_eq!(failure.priority, SignalPriority::High);
        assert!(failure.description.contains("wrong timezone assumption"));

        assert_eq!(store.get_active(None, None).len(), 2, "signals persisted");
    }

    #[test]
    fn quiet_success_emits_nothing() {
        let (_dir, _store, detector) = setup();
        let detected = detector.detect(
            &reflection(ReflectionKind::None, TaskOutcome::Success),
            &ctx(0, 500),
        );
        assert!(detected.is_empty());
    }

    #[test]
    fn rule_validated_requires_rules_used() {
        let (_dir, _store, detector) = setup();
        let mut context = ctx(0, 500);
        context.rules_used = vec!["timezones".to_string()];
        let detected = detector.detect(
            &reflection(ReflectionKind::None, TaskOutcome::Success),
            &context,
        );
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].signal_type, "rule_validated");
    }

    #[test]
    fn heavy_token_usage_is_an_efficiency_signal() {
        let (_dir, _store, detector) = setup();
        let detected = detector.detect(
            &reflection(ReflectionKind::None, TaskOutcome::Success),
            &ctx(0, 20_000),
        );
        assert_eq!(detected[0].signal_type, "efficiency_opportunity");
        assert_eq!(detected[0].priority, SignalPriority::Low);
    }

    #[test]
    fn two_failures_promote_to_repeated_error_exactly_once() {
        let (_dir, store, detector) = setup();
        for task in ["task_0001", "task_0002"] {
            store.add(&Signal::new(
                "task_failure",
                SignalPriority::High,
                format!("reflection:{task}"),
                "failed",
                vec![task.to_string()],
            ));
        }

        let first = detector.detect_patterns(168);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].signal_type, "repeated_error");
        assert_eq!(first[0].related_tasks.len(), 2);

        let second = detector.detect_patterns(168);
        assert!(second.is_empty(), "same window must not re-emit");
    }

    #[test]
    fn performance_degradation_fires_on_success_rate_drop() {
        let (dir, _store, detector) = setup();
        let events = JsonlLog::new(dir.path().join("metrics/events.jsonl"));
        let now = clock::now();

        // Baseline window (4-10 days ago): all successes.
        for day in 4..9i64 {
            let ts = now - chrono::Duration::days(day);
            events
                .append(&serde_json::json!({
                    "event_type": "task",
                    "timestamp": clock::format_iso(ts),
                    "task_id": format!("task_b{day}"),
                    "outcome": "SUCCESS",
                    "tokens": 100,
                    "model": "heavy",
                    "duration_ms": 10,
                    "user_corrections": 0,
                    "error_type": null,
                }))
                .unwrap();
        }
        // Recent window: all failures.
        for i in 0..4 {
            let ts = now - chrono::Duration::hours(6 * i);
            events
                .append(&serde_json::json!({
                    "event_type": "task",
                    "timestamp": clock::format_iso(ts),
                    "task_id": format!("task_r{i}"),
                    "outcome": "FAILURE",
                    "tokens": 100,
                    "model": "heavy",
                    "duration_ms": 10,
                    "user_corrections": 0,
                    "error_type": "ERROR",
                }))
                .unwrap();
        }

        let created = detector.detect_patterns(168);
        assert!(created
            .iter()
            .any(|s| s.signal_type == "performance_degradation"
                && s.priority == SignalPriority::Critical));

        let again = detector.detect_patterns(168);
        assert!(
            !again.iter().any(|s| s.signal_type == "performance_degradation"),
            "degradation signal is idempotent per window"
        );
    }
}
