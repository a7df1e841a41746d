//! Uniform LLM access: one `complete` call over a registry of named
//! providers. Failures never escape this crate's public surface; callers get
//! an empty string and must treat it as such.

mod extract;
mod gateway;
mod mock;
mod registry;

pub use extract::{extract_json_array, extract_json_object};
pub use gateway::LlmGateway;
pub use mock::{MockCall, MockLlm};
pub use registry::{GatewayError, ProviderRegistry, ProviderSpec, ProviderType};

use async_trait::async_trait;

/// The single call every component makes against a model.
///
/// Implementations must not error or panic: on any failure they log and
/// return the empty string, which callers treat as "no answer, fall back".
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        model: &str,
        max_tokens: u32,
    ) -> String;
}
