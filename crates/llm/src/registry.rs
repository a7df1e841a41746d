//! Provider registry: logical model names resolve through an alias map to a
//! provider spec describing how to reach the backing API.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown model or alias: {0}")]
    UnknownModel(String),
    #[error("api key environment variable {0} is not set")]
    MissingApiKey(String),
}

/// Wire protocol family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    Openai,
}

/// One entry of `llm.providers` in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub model_id: String,
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Extra request-body fields merged verbatim into the payload
    /// (OpenAI-compatible providers only).
    #[serde(default)]
    pub extra_body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderSpec>,
    aliases: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new(providers: HashMap<String, ProviderSpec>, aliases: HashMap<String, String>) -> Self {
        Self { providers, aliases }
    }

    /// Resolve a logical model name: alias first, then the provider table.
    /// Unknown names are a precise caller error at this boundary.
    pub fn resolve<'a>(&'a self, model: &'a str) -> Result<(&'a str, &'a ProviderSpec), GatewayError> {
        let name = self.aliases.get(model).map(String::as_str).unwrap_or(model);
        self.providers
            .get(name)
            .map(|spec| (name, spec))
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{GatewayError, ProviderRegistry, ProviderSpec, ProviderType};

    fn registry() -> ProviderRegistry {
        let mut providers = HashMap::new();
        providers.insert(
            "heavy".to_string(),
            ProviderSpec {
                provider_type: ProviderType::Anthropic,
                model_id: "claude-sonnet-4-20250514".to_string(),
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                base_url: None,
                extra_body: None,
            },
        );
        let mut aliases = HashMap::new();
        aliases.insert("fast".to_string(), "heavy".to_string());
        ProviderRegistry::new(providers, aliases)
    }

    #[test]
    fn resolves_direct_names_and_aliases() {
        let registry = registry();
        let (name, spec) = registry.resolve("heavy").unwrap();
        assert_eq!(name, "heavy");
        assert_eq!(spec.model_id, "claude-sonnet-4-20250514");

        let (name, _) = registry.resolve("fast").unwrap();
        assert_eq!(name, "heavy", "alias should land on the provider name");
    }

    #[test]
    fn unknown_model_is_a_precise_error() {
        let err = registry().resolve("nope").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownModel(name) if name == "nope"));
    }

    #[test]
    fn provider_spec_deserializes_from_config_shape() {
        let spec: ProviderSpec = serde_json::from_value(serde_json::json!({
            "type": "openai",
            "model_id": "qwen/qwen3-235b-a22b",
            "api_key_env": "OPENAI_API_KEY",
            "base_url": "https://integrate.api.nvidia.com/v1",
            "extra_body": {"chat_template_kwargs": {"thinking": false}},
        }))
        .unwrap();
        assert_eq!(spec.provider_type, ProviderType::Openai);
        assert!(spec.extra_body.is_some());
    }
}
