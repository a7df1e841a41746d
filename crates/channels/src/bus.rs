//! Bounded bus between channels and the agent core.
//!
//! Publish never blocks: when a queue is full the message is dropped with a
//! warning (backpressure via loss). Consume awaits the next item.

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{InboundMessage, OutboundMessage};

const QUEUE_CAPACITY: usize = 1000;

pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            inbound_tx,
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    /// Publish a message from a channel toward the agent. Drops on full.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        debug!(channel = %msg.channel, user = %msg.user_id, "publish_inbound");
        if let Err(err) = self.inbound_tx.try_send(msg) {
            if let mpsc::error::TrySendError::Full(msg) = err {
                warn!(
                    capacity = QUEUE_CAPACITY,
                    user = %msg.user_id,
                    "inbound queue full, dropping message"
                );
            }
        }
    }

    /// Publish a reply from the agent toward a channel. Drops on full.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        debug!(channel = %msg.channel, user = %msg.user_id, "publish_outbound");
        if let Err(err) = self.outbound_tx.try_send(msg) {
            if let mpsc::error::TrySendError::Full(msg) = err {
                warn!(
                    capacity = QUEUE_CAPACITY,
                    user = %msg.user_id,
                    "outbound queue full, dropping message"
                );
            }
        }
    }

    /// Await the next inbound message. `None` only after every sender is
    /// gone.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Pending inbound messages.
    pub fn inbound_size(&self) -> usize {
        QUEUE_CAPACITY - self.inbound_tx.capacity()
    }

    /// Pending outbound messages.
    pub fn outbound_size(&self) -> usize {
        QUEUE_CAPACITY - self.outbound_tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::types::{InboundMessage, OutboundMessage};

    use super::MessageBus;

    #[tokio::test]
    async fn published_messages_arrive_in_order() {
        let bus = MessageBus::new();
        bus.publish_inbound(InboundMessage::new("test", "u1", "first"));
        bus.publish_inbound(InboundMessage::new("test", "u1", "second"));

        assert_eq!(bus.inbound_size(), 2);
        assert_eq!(bus.consume_inbound().await.unwrap().text, "first");
        assert_eq!(bus.consume_inbound().await.unwrap().text, "second");
        assert_eq!(bus.inbound_size(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = MessageBus::new();
        for i in 0..1100 {
            bus.publish_outbound(OutboundMessage::new("test", "u1", format!("m{i}")));
        }
        assert_eq!(bus.outbound_size(), 1000, "overflow was dropped");
        // The first message is still the oldest one.
        assert_eq!(bus.consume_outbound().await.unwrap().text, "m0");
    }

    #[tokio::test]
    async fn consume_blocks_until_an_item_arrives() {
        let bus = std::sync::Arc::new(MessageBus::new());
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.consume_inbound().await.unwrap().text })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish_inbound(InboundMessage::new("test", "u1", "late arrival"));

        let text = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "late arrival");
    }
}
