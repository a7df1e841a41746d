//! Orchestration: the agent loop that runs one turn, the post-task work
//! queue, the bus bridge, and bus-backed proposal notifications.

mod agent_loop;
mod bridge;
mod notify;
mod pipeline;

pub use agent_loop::AgentLoop;
pub use bridge::{split_message, BusBridge};
pub use notify::{format_daily_briefing, format_proposal, BusNotifier};
pub use pipeline::{PipelineStages, PostTaskPipeline};
