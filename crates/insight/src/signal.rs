//! Signal records and their durable store: `active.jsonl` for open signals,
//! `archive.jsonl` for handled ones.
//!
//! Appends are the steady state. The one rewrite (`mark_handled`) is
//! serialised behind a mutex so concurrent handlers cannot interleave the
//! active-file replacement.

use std::sync::Mutex;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::error;

use noema_store::{clock, JsonlLog, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalPriority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Handled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub signal_type: String,
    pub priority: SignalPriority,
    pub source: String,
    pub description: String,
    #[serde(default)]
    pub related_tasks: Vec<String>,
    pub timestamp: String,
    pub status: SignalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<String>,
}

impl Signal {
    pub fn new(
        signal_type: impl Into<String>,
        priority: SignalPriority,
        source: impl Into<String>,
        description: impl Into<String>,
        related_tasks: Vec<String>,
    ) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            signal_id: format!("sig_{}", &hex[..8]),
            signal_type: signal_type.into(),
            priority,
            source: source.into(),
            description: description.into(),
            related_tasks,
            timestamp: clock::now_iso(),
            status: SignalStatus::Active,
            handler: None,
            handled_at: None,
        }
    }
}

pub struct SignalStore {
    active: JsonlLog,
    archive: JsonlLog,
    rewrite_lock: Mutex<()>,
}

impl SignalStore {
    pub fn new(workspace: &Workspace) -> Self {
        Self {
            active: JsonlLog::new(workspace.active_signals_log()),
            archive: JsonlLog::new(workspace.archive_signals_log()),
            rewrite_lock: Mutex::new(()),
        }
    }

    /// Append one signal to the active log. Failures are logged and
    /// swallowed; losing a signal must not fail the pipeline stage.
    pub fn add(&self, signal: &Signal) {
        if let Err(err) = self.active.append(signal) {
            error!(%err, signal_id = %signal.signal_id, "failed to append active signal");
        }
    }

    /// Active signals matching the filters, newest first.
    pub fn get_active(
        &self,
        priority: Option<SignalPriority>,
        signal_type: Option<&str>,
    ) -> Vec<Signal> {
        let mut signals: Vec<Signal> = self
            .active
            .read_all::<Signal>()
            .into_iter()
            .filter(|signal| signal.status == SignalStatus::Active)
            .filter(|signal| priority.map_or(true, |p| signal.priority == p))
            .filter(|signal| signal_type.map_or(true, |t| signal.signal_type == t))
            .collect();
        signals.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        signals
    }

    /// Move the given ids from active to archive, stamping handler and
    /// handled time. The rewrite of `active.jsonl` is atomic and serialised.
    pub fn mark_handled(&self, signal_ids: &[String], handler: &str) {
        if signal_ids.is_empty() {
            return;
        }
        let _guard = self.rewrite_lock.lock().expect("signal rewrite lock poisoned");

        let handled_at = clock::now_iso();
        let mut keep = Vec::new();
        let mut handled = Vec::new();
        for signal in self.active.read_all::<Signal>() {
            if signal_ids.contains(&signal.signal_id) {
                let mut archived = signal;
                archived.status = SignalStatus::Handled;
                archived.handler = Some(handler.to_string());
                archived.handled_at = Some(handled_at.clone());
                handled.push(archived);
            } else {
                keep.push(signal);
            }
        }

        if let Err(err) = self.active.rewrite(&keep) {
            error!(%err, "failed to rewrite active.jsonl; archive not touched");
            return;
        }
        for signal in &handled {
            if let Err(err) = self.archive.append(signal) {
                error!(%err, signal_id = %signal.signal_id, "failed to append archive.jsonl");
            }
        }
    }

    /// Count active signals inside the trailing window.
    pub fn count_recent(
        &self,
        signal_type: Option<&str>,
        priority: Option<SignalPriority>,
        hours: i64,
    ) -> usize {
        let window_start = clock::now() - Duration::hours(hours.max(0));
        self.get_active(priority, signal_type)
            .into_iter()
            .filter(|signal| {
                clock::parse_iso(&signal.timestamp).is_some_and(|ts| ts >= window_start)
            })
            .count()
    }
}
