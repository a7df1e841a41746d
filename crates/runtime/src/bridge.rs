//! The bus bridge: inbound messages route to the approval handler or the
//! agent loop, replies go back through the originating channel in chunks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use noema_architect::{ArchitectEngine, ProposalStatus};
use noema_channels::{ChannelManager, InboundMessage, MessageBus};

use crate::agent_loop::AgentLoop;

const CONSUME_TIMEOUT: Duration = Duration::from_secs(1);
const CHUNK_LIMIT: usize = 4000;

pub struct BusBridge {
    bus: Arc<MessageBus>,
    manager: Arc<ChannelManager>,
    agent: Arc<Mutex<AgentLoop>>,
    architect: Arc<ArchitectEngine>,
}

impl BusBridge {
    pub fn new(
        bus: Arc<MessageBus>,
        manager: Arc<ChannelManager>,
        agent: Arc<Mutex<AgentLoop>>,
        architect: Arc<ArchitectEngine>,
    ) -> Self {
        Self {
            bus,
            manager,
            agent,
            architect,
        }
    }

    /// Consume inbound messages until shutdown. The short consume timeout
    /// keeps the loop responsive to the stop flag.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("bus bridge started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match tokio::time::timeout(CONSUME_TIMEOUT, self.bus.consume_inbound()).await {
                Ok(Some(msg)) => self.handle(msg).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        info!("bus bridge stopped");
    }

    /// Route outbound messages (notifier output) to their channels until
    /// shutdown.
    pub async fn run_outbound(&self, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match tokio::time::timeout(CONSUME_TIMEOUT, self.bus.consume_outbound()).await {
                Ok(Some(msg)) => {
                    if let Err(err) = self
                        .manager
                        .send_message(&msg.channel, &msg.user_id, &msg.text, msg.reply_markup)
                        .await
                    {
                        error!(channel = %msg.channel, %err, "outbound delivery failed");
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    async fn handle(&self, msg: InboundMessage) {
        if let Some(callback) = msg.callback_data().map(str::to_string) {
            self.handle_callback(&msg, &callback).await;
            return;
        }
        self.handle_text(msg).await;
    }

    /// Approval buttons carry `action:proposal_id`.
    async fn handle_callback(&self, msg: &InboundMessage, data: &str) {
        let Some((action, proposal_id)) = data.split_once(':') else {
            warn!(data, "malformed callback data");
            return;
        };

        let reply = match action {
            "approve" => match self.architect.load_proposal(proposal_id) {
                Some(proposal) => {
                    let outcome = self.architect.execute_proposal(proposal).await;
                    format!(
                        "Proposal {proposal_id} processed. Status: {}",
                        outcome.status.as_str()
                    )
                }
                None => format!("Proposal {proposal_id} not found."),
            },
            "reject" => {
                self.architect
                    .update_status(proposal_id, ProposalStatus::Rejected);
                format!("Proposal {proposal_id} rejected.")
            }
            "discuss" => format!(
                "Proposal {proposal_id} marked for discussion. Tell me your thoughts here."
            ),
            other => {
                warn!(action = other, "unknown callback action");
                return;
            }
        };

        if let Err(err) = self
            .manager
            .send_message(&msg.channel, &msg.user_id, &reply, None)
            .await
        {
            error!(%err, "failed to send callback reply");
        }
    }

    async fn handle_text(&self, msg: InboundMessage) {
        let trace = self
            .agent
            .lock()
            .await
            .process_message(&msg.text, None, None)
            .await;

        let response = if trace.system_response.trim().is_empty() {
            "Done, but there was no reply content.".to_string()
        } else {
            trace.system_response
        };

        for chunk in split_message(&response, CHUNK_LIMIT) {
            if let Err(err) = self
                .manager
                .send_message(&msg.channel, &msg.user_id, &chunk, None)
                .await
            {
                error!(channel = %msg.channel, %err, "failed to send reply chunk");
            }
        }
    }
}

/// Split a long reply into chunks of at most `max_len` characters,
/// preferring newline boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        if rest.chars().count() <= max_len {
            if !rest.is_empty() || chunks.is_empty() {
                chunks.push(rest.to_string());
            }
            break;
        }
        let byte_limit = rest
            .char_indices()
            .nth(max_len)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        let split_at = match rest[..byte_limit].rfind('\n') {
            Some(0) | None => byte_limit,
            Some(pos) => pos,
        };
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    chunks
}
