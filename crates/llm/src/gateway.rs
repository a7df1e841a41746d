//! HTTP gateway over the provider registry.
//!
//! Provider clients are built lazily on first use and cached per provider
//! name; the API key is read from the environment at construction time.
//! Every failure path logs and resolves to an empty string.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use crate::registry::{GatewayError, ProviderRegistry, ProviderSpec, ProviderType};
use crate::LlmClient;

const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct ProviderClient {
    provider_type: ProviderType,
    model_id: String,
    api_key: String,
    base_url: String,
    extra_body: Option<serde_json::Value>,
}

pub struct LlmGateway {
    registry: ProviderRegistry,
    http: reqwest::Client,
    clients: Mutex<HashMap<String, Arc<ProviderClient>>>,
}

impl LlmGateway {
    pub fn new(registry: ProviderRegistry) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            http,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn client_for(&self, name: &str, spec: &ProviderSpec) -> Result<Arc<ProviderClient>, GatewayError> {
        let mut clients = self.clients.lock().expect("client cache poisoned");
        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }

        let api_key = std::env::var(&spec.api_key_env)
            .map_err(|_| GatewayError::MissingApiKey(spec.api_key_env.clone()))?;
        let base_url = spec
            .base_url
            .clone()
            .unwrap_or_else(|| match spec.provider_type {
                ProviderType::Anthropic => ANTHROPIC_DEFAULT_BASE.to_string(),
                ProviderType::Openai => OPENAI_DEFAULT_BASE.to_string(),
            })
            .trim_end_matches('/')
            .to_string();

        let client = Arc::new(ProviderClient {
            provider_type: spec.provider_type,
            model_id: spec.model_id.clone(),
            api_key,
            base_url,
            extra_body: spec.extra_body.clone(),
        });
        clients.insert(name.to_string(), client.clone());
        Ok(client)
    }

    async fn call_anthropic(
        &self,
        client: &ProviderClient,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
    ) -> Result<String, String> {
        let payload = json!({
            "model": client.model_id,
            "max_tokens": max_tokens,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_message}],
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", client.base_url))
            .header("x-api-key", &client.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|err| err.to_string())?;
        if !status.is_success() {
            return Err(format!("http {status}: {body}"));
        }

        body.get("content")
            .and_then(|content| content.get(0))
            .and_then(|block| block.get("text"))
            .and_then(|text| text.as_str())
            .map(str::to_string)
            .ok_or_else(|| format!("response missing text: {body}"))
    }

    async fn call_openai(
        &self,
        client: &ProviderClient,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
    ) -> Result<String, String> {
        let mut payload = json!({
            "model": client.model_id,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message},
            ],
        });
        if let (Some(body), Some(extra)) = (
            payload.as_object_mut(),
            client.extra_body.as_ref().and_then(|v| v.as_object()),
        ) {
            for (key, value) in extra {
                body.insert(key.clone(), value.clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", client.base_url))
            .bearer_auth(&client.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|err| err.to_string())?;
        if !status.is_success() {
            return Err(format!("http {status}: {body}"));
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(str::to_string)
            .ok_or_else(|| format!("response missing content: {body}"))
    }
}

#[async_trait]
impl LlmClient for LlmGateway {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        model: &str,
        max_tokens: u32,
    ) -> String {
        let (name, spec) = match self.registry.resolve(model) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!(%model, %err, "model resolution failed");
                return String::new();
            }
        };

        let client = match self.client_for(name, spec) {
            Ok(client) => client,
            Err(err) => {
                error!(provider = %name, %err, "provider client construction failed");
                return String::new();
            }
        };

        let result = match client.provider_type {
            ProviderType::Anthropic => {
                self.call_anthropic(&client, system_prompt, user_message, max_tokens)
                    .await
            }
            ProviderType::Openai => {
                self.call_openai(&client, system_prompt, user_message, max_tokens)
                    .await
            }
        };

        match result {
            Ok(text) => {
                debug!(provider = %name, chars = text.len(), "completion received");
                text
            }
            Err(err) => {
                error!(provider = %name, %err, "LLM call failed");
                String::new()
            }
        }
    }
}
