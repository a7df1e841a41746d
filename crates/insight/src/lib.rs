//! The post-task chain: reflection, signal detection, observation, and
//! metrics. Every stage is best-effort and failure-isolated; nothing here
//! may delay or break the reply that already went out.

mod detector;
mod metrics;
mod observer;
mod reflection;
mod signal;
mod trace;

pub use detector::SignalDetector;
pub use metrics::{DailySummary, MetricsEvent, MetricsTracker, TaskCounts, TrendPoint};
pub use observer::{
    DeepReport, DeepTrigger, Finding, Health, LightObservation, ObserverEngine, ObserverScheduler,
};
pub use reflection::{Reflection, ReflectionEngine, ReflectionKind, RootCause, TaskOutcome};
pub use signal::{Signal, SignalPriority, SignalStatus, SignalStore};
pub use trace::{TaskContext, TaskTrace};
