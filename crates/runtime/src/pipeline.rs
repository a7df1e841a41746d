//! The asynchronous post-task chain as a bounded work queue.
//!
//! One worker drains the queue: reflect, detect signals, observe, record
//! metrics. Stages are individually isolated; which stages exist at all is
//! a configuration decision, expressed as `Option`s rather than runtime
//! probing. Shutdown closes the queue and waits for the worker, so no
//! in-flight reflection is lost.

use tokio::sync::mpsc;
use tracing::{error, warn};

use noema_insight::{
    MetricsTracker, ObserverEngine, Reflection, ReflectionEngine, ReflectionKind, SignalDetector,
    TaskContext, TaskTrace,
};

const QUEUE_CAPACITY: usize = 64;

/// The stages the worker runs, in order. `None` disables a stage.
pub struct PipelineStages {
    pub reflection: Option<ReflectionEngine>,
    pub detector: Option<SignalDetector>,
    pub observer: Option<ObserverEngine>,
    pub metrics: Option<MetricsTracker>,
}

pub struct PostTaskPipeline {
    tx: mpsc::Sender<TaskTrace>,
    worker: tokio::task::JoinHandle<()>,
}

impl PostTaskPipeline {
    pub fn spawn(stages: PipelineStages) -> Self {
        let (tx, mut rx) = mpsc::channel::<TaskTrace>(QUEUE_CAPACITY);
        let worker = tokio::spawn(async move {
            while let Some(trace) = rx.recv().await {
                run_stages(&stages, trace).await;
            }
        });
        Self { tx, worker }
    }

    /// Enqueue a trace without blocking the reply path. A full queue drops
    /// the trace with a warning.
    pub fn dispatch(&self, trace: TaskTrace) {
        if let Err(err) = self.tx.try_send(trace) {
            if let mpsc::error::TrySendError::Full(trace) = err {
                warn!(task_id = %trace.task_id, "post-task queue full, dropping trace");
            }
        }
    }

    /// Close the queue and drain what is already enqueued.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            error!(%err, "post-task worker ended abnormally");
        }
    }
}

async fn run_stages(stages: &PipelineStages, trace: TaskTrace) {
    // Reflection first; later stages consume its output when present.
    let reflection: Option<Reflection> = match &stages.reflection {
        Some(engine) => Some(engine.lightweight_reflect(&trace).await),
        None => None,
    };

    if let (Some(detector), Some(reflection)) = (&stages.detector, reflection.as_ref()) {
        let ctx = TaskContext::from_trace(&trace);
        let signals = detector.detect(reflection, &ctx);
        if let Some(metrics) = &stages.metrics {
            for signal in &signals {
                metrics.record_signal(&signal.signal_type, signal.priority, &signal.source);
            }
        }
    }

    if let Some(observer) = &stages.observer {
        observer.lightweight_observe(&trace, reflection.as_ref()).await;
    }

    if let Some(metrics) = &stages.metrics {
        let outcome = reflection
            .as_ref()
            .map(|r| r.outcome)
            .unwrap_or(noema_insight::TaskOutcome::Success);
        let error_type = reflection.as_ref().and_then(|r| match r.kind {
            ReflectionKind::Error => Some("ERROR".to_string()),
            ReflectionKind::Preference => Some("PREFERENCE".to_string()),
            ReflectionKind::None => None,
        });
        let user_corrections = u32::from(trace.user_feedback.is_some());
        metrics.record_task(
            &trace.task_id,
            outcome,
            trace.tokens_used,
            &trace.model,
            trace.duration_ms,
            user_corrections,
            error_type,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use noema_insight::{
        MetricsEvent, MetricsTracker, ObserverEngine, ReflectionEngine, SignalDetector,
        SignalStore, TaskTrace,
    };
    use noema_llm::MockLlm;
    use noema_store::{clock, JsonlLog, Workspace};

    use super::{PipelineStages, PostTaskPipeline};

    fn trace(feedback: Option<&str>) -> TaskTrace {
        TaskTrace {
            task_id: "task_0001".to_string(),
            timestamp: clock::now_iso(),
            user_message: "hello".to_string(),
            system_response: "OK".to_string(),
            user_feedback: feedback.map(str::to_string),
            tools_used: vec![],
            tokens_used: 900,
            model: "heavy".to_string(),
            duration_ms: 25,
        }
    }

    fn full_stages(dir: &std::path::Path, light_response: &str) -> PipelineStages {
        let workspace = Workspace::new(dir);
        let llm: Arc<MockLlm> = Arc::new(MockLlm::new().with_response("light", light_response));
        let store = Arc::new(SignalStore::new(&workspace));
        PipelineStages {
            reflection: Some(ReflectionEngine::new(
                llm.clone(),
                "light",
                workspace.clone(),
            )),
            detector: Some(SignalDetector::new(store, &workspace)),
            observer: Some(ObserverEngine::new(
                llm.clone(),
                llm,
                "light",
                "heavy",
                workspace.clone(),
            )),
            metrics: Some(MetricsTracker::new(&workspace)),
        }
    }

    #[tokio::test]
    async fn a_dispatched_trace_reaches_every_stage() {
        let dir = tempdir().unwrap();
        let stages = full_stages(
            dir.path(),
            r#"{"type":"NONE","outcome":"SUCCESS","lesson":"fine"}"#,
        );
        let pipeline = PostTaskPipeline::spawn(stages);

        pipeline.dispatch(trace(None));
        pipeline.shutdown().await;

        let reflections: Vec<serde_json::Value> =
            JsonlLog::new(dir.path().join("memory/user/reflections.jsonl")).read_values();
        assert_eq!(reflections.len(), 1);

        let events: Vec<MetricsEvent> =
            JsonlLog::new(dir.path().join("metrics/events.jsonl")).read_all();
        assert!(events
            .iter()
            .any(|event| matches!(event, MetricsEvent::Task { .. })));

        let today = clock::today();
        let light: Vec<serde_json::Value> =
            JsonlLog::new(dir.path().join(format!("observations/light_logs/{today}.jsonl")))
                .read_values();
        assert_eq!(light.len(), 1);
    }

    #[tokio::test]
    async fn failure_reflection_produces_signals_and_signal_events() {
        let dir = tempdir().unwrap();
        let stages = full_stages(
            dir.path(),
            r#"{"type":"ERROR","outcome":"FAILURE","lesson":"wrong timezone assumption","root_cause":"wrong_assumption"}"#,
        );
        let pipeline = PostTaskPipeline::spawn(stages);

        pipeline.dispatch(trace(Some("that was wrong")));
        pipeline.shutdown().await;

        let signals: Vec<serde_json::Value> =
            JsonlLog::new(dir.path().join("signals/active.jsonl")).read_values();
        let types: Vec<&str> = signals
            .iter()
            .filter_map(|s| s.get("signal_type").and_then(|v| v.as_str()))
            .collect();
        assert!(types.contains(&"user_correction"));
        assert!(types.contains(&"task_failure"));

        let events: Vec<MetricsEvent> =
            JsonlLog::new(dir.path().join("metrics/events.jsonl")).read_all();
        let signal_events = events
            .iter()
            .filter(|event| matches!(event, MetricsEvent::Signal { .. }))
            .count();
        assert_eq!(signal_events, 2);

        let patterns =
            std::fs::read_to_string(dir.path().join("memory/user/error_patterns.md")).unwrap();
        assert!(patterns.contains("wrong timezone assumption"));
    }

    #[tokio::test]
    async fn disabled_stages_are_skipped_without_side_effects() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let pipeline = PostTaskPipeline::spawn(PipelineStages {
            reflection: None,
            detector: None,
            observer: None,
            metrics: Some(MetricsTracker::new(&workspace)),
        });

        pipeline.dispatch(trace(None));
        pipeline.shutdown().await;

        assert!(!dir.path().join("memory/user/reflections.jsonl").exists());
        let events: Vec<MetricsEvent> =
            JsonlLog::new(dir.path().join("metrics/events.jsonl")).read_all();
        assert_eq!(events.len(), 1, "metrics still records the task");
    }

    #[tokio::test]
    async fn shutdown_drains_already_enqueued_traces() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let pipeline = PostTaskPipeline::spawn(PipelineStages {
            reflection: None,
            detector: None,
            observer: None,
            metrics: Some(MetricsTracker::new(&workspace)),
        });

        for i in 0..5 {
            let mut t = trace(None);
            t.task_id = format!("task_{i:04}");
            pipeline.dispatch(t);
        }
        pipeline.shutdown().await;

        let events: Vec<MetricsEvent> =
            JsonlLog::new(dir.path().join("metrics/events.jsonl")).read_all();
        assert_eq!(events.len(), 5, "nothing enqueued is lost on shutdown");
    }
}
