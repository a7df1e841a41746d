//! Proposal notifications over the outbound queue, with quiet-hours
//! deferral.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use noema_architect::{Proposal, ProposalNotifier};
use noema_channels::{MessageBus, OutboundMessage, QuietHours};
use noema_insight::DailySummary;

pub struct BusNotifier {
    bus: Arc<MessageBus>,
    channel: String,
    user_id: String,
    quiet: QuietHours,
    pending: Mutex<Vec<OutboundMessage>>,
}

impl BusNotifier {
    pub fn new(
        bus: Arc<MessageBus>,
        channel: impl Into<String>,
        user_id: impl Into<String>,
        quiet: QuietHours,
    ) -> Self {
        Self {
            bus,
            channel: channel.into(),
            user_id: user_id.into(),
            quiet,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Publish now, or park the message until quiet hours end.
    pub fn deliver(&self, msg: OutboundMessage) {
        if self.quiet.is_dnd_now() {
            debug!("quiet hours: queueing notification");
            self.pending.lock().expect("pending lock poisoned").push(msg);
        } else {
            self.bus.publish_outbound(msg);
        }
    }

    /// Publish everything parked during quiet hours. Returns how many
    /// messages went out.
    pub fn flush_pending(&self) -> usize {
        let queued: Vec<OutboundMessage> = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain(..)
            .collect();
        let count = queued.len();
        for msg in queued {
            self.bus.publish_outbound(msg);
        }
        if count > 0 {
            info!(count, "flushed queued notifications");
        }
        count
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.deliver(OutboundMessage::new(
            self.channel.clone(),
            self.user_id.clone(),
            text,
        ));
    }
}

#[async_trait]
impl ProposalNotifier for BusNotifier {
    async fn proposal_pending(&self, proposal: &Proposal) {
        let msg = OutboundMessage::new(
            self.channel.clone(),
            self.user_id.clone(),
            format_proposal(proposal),
        )
        .with_reply_markup(approval_markup(&proposal.proposal_id));
        self.deliver(msg);
    }

    async fn proposal_update(&self, proposal: &Proposal, note: &str) {
        self.send_text(format!(
            "Proposal {}: {note}\nSolution: {}",
            proposal.proposal_id, proposal.solution
        ));
    }
}

/// Human-readable proposal notification.
pub fn format_proposal(proposal: &Proposal) -> String {
    let files = if proposal.files_affected.is_empty() {
        "none".to_string()
    } else {
        proposal
            .files_affected
            .iter()
            .map(|f| format!("  - {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Improvement proposal {}\n\nProblem: {}\nSolution: {}\nApproval level: {}\n\
         Blast radius: {}\nFiles:\n{files}\nExpected effect: {}\nVerification: {}",
        proposal.proposal_id,
        proposal.problem,
        proposal.solution,
        proposal.level.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
        proposal.blast_radius.as_str(),
        proposal.expected_effect,
        proposal.verification_method,
    )
}

fn approval_markup(proposal_id: &str) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [[
            {"text": "Approve", "callback_data": format!("approve:{proposal_id}")},
            {"text": "Reject", "callback_data": format!("reject:{proposal_id}")},
            {"text": "Discuss", "callback_data": format!("discuss:{proposal_id}")},
        ]]
    })
}

/// The daily briefing text sent by the briefing cron job.
pub fn format_daily_briefing(summary: &DailySummary) -> String {
    format!(
        "Daily briefing {}\n\nTasks: {} (success {}, partial {}, failure {})\n\
         Success rate: {:.1}%\nTokens used: {}\nSignals detected: {}\n\
         Proposals: {} (executed {}, rolled back {})",
        summary.date,
        summary.tasks.total,
        summary.tasks.success,
        summary.tasks.partial,
        summary.tasks.failure,
        summary.tasks.success_rate * 100.0,
        summary.tokens.get("total").copied().unwrap_or(0),
        summary.signals_detected,
        summary.architect_proposals,
        summary.modifications_executed,
        summary.modifications_rolled_back,
    )
}
