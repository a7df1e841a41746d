//! A stdin/stdout channel adapter, used when no external transport is
//! configured. Lines typed at the terminal become inbound messages; replies
//! print back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tracing::debug;

use noema_channels::{Channel, ChannelError, InboundMessage, MessageBus};

pub const TERMINAL_CHANNEL: &str = "terminal";
pub const TERMINAL_USER: &str = "operator";

pub struct TerminalChannel {
    bus: Option<Arc<MessageBus>>,
    running: bool,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl TerminalChannel {
    pub fn new() -> Self {
        Self {
            bus: None,
            running: false,
            reader: None,
        }
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn name(&self) -> &str {
        TERMINAL_CHANNEL
    }

    fn attach_bus(&mut self, bus: Arc<MessageBus>) -> Result<(), ChannelError> {
        if self.running {
            return Err(ChannelError::AlreadyRunning(TERMINAL_CHANNEL.to_string()));
        }
        self.bus = Some(bus);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ChannelError> {
        let Some(bus) = self.bus.clone() else {
            return Err(ChannelError::NotConnected(TERMINAL_CHANNEL.to_string()));
        };
        self.running = true;
        self.reader = Some(tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                bus.publish_inbound(InboundMessage::new(
                    TERMINAL_CHANNEL,
                    TERMINAL_USER,
                    text,
                ));
            }
            debug!("terminal reader finished");
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ChannelError> {
        self.running = false;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Ok(())
    }

    async fn send_message(
        &self,
        _user_id: &str,
        text: &str,
        _reply_markup: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        println!("noema> {text}");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
