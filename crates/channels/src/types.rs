//! Messages crossing the bus, and the channel-boundary error type.

use serde::{Deserialize, Serialize};

/// Message received from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub user_id: String,
    pub text: String,
    /// Transport extras, e.g. `callback_data` for approval buttons.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            user_id: user_id.into(),
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn callback_data(&self) -> Option<&str> {
        self.metadata.get("callback_data").and_then(|v| v.as_str())
    }
}

/// Message to deliver through a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub user_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            user_id: user_id.into(),
            text: text.into(),
            reply_markup: None,
        }
    }

    pub fn with_reply_markup(mut self, reply_markup: serde_json::Value) -> Self {
        self.reply_markup = Some(reply_markup);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is running; cannot rebind its bus")]
    AlreadyRunning(String),
    #[error("channel {0} is not connected")]
    NotConnected(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}
