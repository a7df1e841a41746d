//! YAML configuration with dot-path access.
//!
//! A missing or invalid file falls back to the built-in default document
//! with a warning. Unknown keys always yield the caller-supplied default,
//! never an error.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::Value;
use tracing::warn;

/// Built-in defaults used when no configuration file is present. The file,
/// when provided, replaces this document wholesale; per-key fallbacks are
/// supplied by the typed getters.
const DEFAULT_CONFIG: &str = r#"
llm:
  providers:
    heavy:
      type: anthropic
      model_id: claude-sonnet-4-20250514
      api_key_env: ANTHROPIC_API_KEY
    light:
      type: openai
      model_id: qwen/qwen3-235b-a22b
      api_key_env: OPENAI_API_KEY
      base_url: https://integrate.api.nvidia.com/v1
      extra_body:
        chat_template_kwargs:
          thinking: false
  aliases:
    fast: light
agent_loop:
  model: heavy
  max_history_rounds: 20
observer:
  light_mode:
    enabled: true
    model: light
  deep_mode:
    schedule: "02:00"
    model: heavy
    emergency_threshold: 3
architect:
  schedule: "03:00"
  model: heavy
approval:
  levels:
    0: { action: auto_execute, notify: false, max_files: 1 }
    1: { action: execute_then_notify, notify: true, max_files: 3 }
    2: { action: propose_then_wait, notify: true, max_files: 5 }
    3: { action: discuss, notify: true, max_files: 999 }
rollback:
  auto_threshold: 0.20
  backup_retention_days: 30
communication:
  quiet_hours_start: "22:00"
  quiet_hours_end: "08:00"
cron:
  observer_cron: "0 2 * * *"
  architect_cron: "0 3 * * *"
  briefing_cron: "30 8 * * *"
  heartbeat_interval: 1800
"#;

#[derive(Debug, Clone)]
pub struct Config {
    data: Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: serde_yaml::from_str(DEFAULT_CONFIG).expect("built-in defaults parse"),
        }
    }
}

impl Config {
    /// Load from a YAML file; missing or malformed files fall back to the
    /// built-in defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<Value>(&raw) {
                Ok(value) if value.is_mapping() => Self { data: value },
                Ok(_) => {
                    warn!(path = %path.display(), "config is not a mapping, using defaults");
                    Self::default()
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Build directly from a YAML document (used by tests).
    pub fn from_yaml(raw: &str) -> Option<Self> {
        let value: Value = serde_yaml::from_str(raw).ok()?;
        value.is_mapping().then_some(Self { data: value })
    }

    /// Navigate a dot-separated path. Integer-looking segments also match
    /// integer map keys, so `approval.levels.0` works against `0:` in YAML.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut current = &self.data;
        for part in key.split('.') {
            let map = current.as_mapping()?;
            let by_str = map
                .iter()
                .find(|(k, _)| k.as_str() == Some(part))
                .map(|(_, v)| v);
            current = match by_str {
                Some(value) => value,
                None => {
                    let index: i64 = part.parse().ok()?;
                    map.iter()
                        .find(|(k, _)| k.as_i64() == Some(index))
                        .map(|(_, v)| v)?
                }
            };
        }
        Some(current)
    }

    /// Deserialize a subtree into a typed structure.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?.clone();
        serde_yaml::from_value(value).ok()
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    // Per-component model selection.

    pub fn agent_loop_model(&self) -> String {
        self.get_str("agent_loop.model", "heavy")
    }

    pub fn max_history_rounds(&self) -> usize {
        self.get_u64("agent_loop.max_history_rounds", 20) as usize
    }

    pub fn observer_light_model(&self) -> String {
        self.get_str("observer.light_mode.model", "light")
    }

    pub fn observer_deep_model(&self) -> String {
        self.get_str("observer.deep_mode.model", "heavy")
    }

    pub fn architect_model(&self) -> String {
        self.get_str("architect.model", "heavy")
    }

    // Scheduling.

    pub fn observer_schedule(&self) -> String {
        self.get_str("observer.deep_mode.schedule", "02:00")
    }

    pub fn emergency_threshold(&self) -> usize {
        self.get_u64("observer.deep_mode.emergency_threshold", 3) as usize
    }

    pub fn observer_cron(&self) -> String {
        self.get_str("cron.observer_cron", "0 2 * * *")
    }

    pub fn architect_cron(&self) -> String {
        self.get_str("cron.architect_cron", "0 3 * * *")
    }

    pub fn briefing_cron(&self) -> String {
        self.get_str("cron.briefing_cron", "30 8 * * *")
    }

    pub fn heartbeat_interval_s(&self) -> u64 {
        self.get_u64("cron.heartbeat_interval", 1800)
    }

    pub fn quiet_hours(&self) -> (String, String) {
        (
            self.get_str("communication.quiet_hours_start", "22:00"),
            self.get_str("communication.quiet_hours_end", "08:00"),
        )
    }

    // Rollback.

    pub fn rollback_auto_threshold(&self) -> f64 {
        self.get_f64("rollback.auto_threshold", 0.20)
    }

    pub fn backup_retention_days(&self) -> i64 {
        self.get_u64("rollback.backup_retention_days", 30) as i64
    }

    /// Per-level approval policy (`action`, `notify`, `max_files`), empty
    /// mapping when the level is not configured.
    pub fn approval_level(&self, level: u8) -> Option<&Value> {
        self.get(&format!("approval.levels.{level}"))
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let config = Config::load("/definitely/not/here.yaml");
        assert_eq!(config.agent_loop_model(), "heavy");
        assert_eq!(config.observer_schedule(), "02:00");
        assert_eq!(config.heartbeat_interval_s(), 1800);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "agent_loop:\n  model: custom\ncron:\n  observer_cron: \"15 4 * * *\"\n",
        )
        .unwrap();

        let config = Config::load(&path);
        assert_eq!(config.agent_loop_model(), "custom");
        assert_eq!(config.observer_cron(), "15 4 * * *");
    }

    #[test]
    fn dot_path_reaches_nested_keys() {
        let config = Config::default();
        assert_eq!(
            config.get_str("observer.deep_mode.model", "missing"),
            "heavy"
        );
    }

    #[test]
    fn unknown_keys_yield_the_default() {
        let config = Config::default();
        assert_eq!(config.get_str("no.such.path", "fallback"), "fallback");
        assert_eq!(config.get_u64("also.missing", 7), 7);
    }

    #[test]
    fn integer_keyed_approval_levels_are_reachable() {
        let config = Config::default();
        assert_eq!(config.get_u64("approval.levels.0.max_files", 0), 1);
        assert_eq!(
            config.get_str("approval.levels.3.action", "missing"),
            "discuss"
        );
        assert!(config.approval_level(2).is_some());
    }

    #[test]
    fn non_mapping_document_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "- just\n- a\n- list\n").unwrap();

        let config = Config::load(&path);
        assert_eq!(config.agent_loop_model(), "heavy");
    }
}
