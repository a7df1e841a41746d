//! The adapter interface every chat transport implements.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::MessageBus;
use crate::types::ChannelError;

/// One chat transport (Telegram, Slack, a local terminal, ...).
///
/// Adapters translate transport events into [`InboundMessage`]s published on
/// the bus, and deliver outbound text when asked. Implementations must be
/// `Send + Sync` so the manager can drive them from separate tasks.
///
/// [`InboundMessage`]: crate::types::InboundMessage
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier, unique across registered adapters.
    fn name(&self) -> &str;

    /// Bind the bus. Rejected while the channel is running.
    fn attach_bus(&mut self, bus: Arc<MessageBus>) -> Result<(), ChannelError>;

    /// Connect and begin listening for transport events.
    async fn start(&mut self) -> Result<(), ChannelError>;

    /// Disconnect and release transport resources.
    async fn stop(&mut self) -> Result<(), ChannelError>;

    /// Deliver one message to a user on this transport.
    async fn send_message(
        &self,
        user_id: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), ChannelError>;

    fn is_running(&self) -> bool;
}
