//! The channel substrate: a typed bus between external chat transports and
//! the core, an adapter trait, and the manager that owns adapter lifecycles.

mod bus;
mod channel;
mod manager;
mod quiet;
mod types;

pub use bus::MessageBus;
pub use channel::Channel;
pub use manager::ChannelManager;
pub use quiet::QuietHours;
pub use types::{ChannelError, InboundMessage, OutboundMessage};
