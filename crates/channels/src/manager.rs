//! Registration and lifecycle for channel adapters.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::bus::MessageBus;
use crate::channel::Channel;
use crate::types::ChannelError;

type SharedChannel = Arc<Mutex<Box<dyn Channel>>>;

pub struct ChannelManager {
    bus: Arc<MessageBus>,
    channels: Vec<(String, SharedChannel)>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            channels: Vec::new(),
        }
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    /// Register a channel, binding it to the bus.
    pub fn register(&mut self, mut channel: Box<dyn Channel>) -> Result<(), ChannelError> {
        channel.attach_bus(self.bus.clone())?;
        let name = channel.name().to_string();
        debug!(channel = %name, "channel registered");
        self.channels.push((name, Arc::new(Mutex::new(channel))));
        Ok(())
    }

    /// Start every channel. A failing start is logged and does not prevent
    /// the others from starting.
    pub async fn start_all(&self) {
        for (name, channel) in &self.channels {
            info!(channel = %name, "starting channel");
            if let Err(err) = channel.lock().await.start().await {
                error!(channel = %name, %err, "failed to start channel");
            }
        }
    }

    /// Stop channels in reverse registration order, each failure isolated.
    pub async fn stop_all(&self) {
        for (name, channel) in self.channels.iter().rev() {
            info!(channel = %name, "stopping channel");
            if let Err(err) = channel.lock().await.stop().await {
                error!(channel = %name, %err, "error stopping channel");
            }
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|(n, _)| n == name)
    }

    /// Deliver a message through the named channel.
    pub async fn send_message(
        &self,
        channel_name: &str,
        user_id: &str,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        let Some((_, channel)) = self.channels.iter().find(|(name, _)| name == channel_name)
        else {
            return Err(ChannelError::NotConnected(channel_name.to_string()));
        };
        channel
            .lock()
            .await
            .send_message(user_id, text, reply_markup)
            .await
    }
}
