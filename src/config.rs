use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::schema::SosTrigger;

/// Full gateway configuration, loaded from `operator.toml` with `OPERATOR_*`
/// environment overrides for the deployment-specific keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub radio: RadioConfig,
    pub llm: LlmConfig,
    /// Trigger token (without the bang) to responder node id. An empty value
    /// routes that trigger to every configured responder.
    pub responders: BTreeMap<String, String>,
    pub switchboard: SwitchboardConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Serial device path, or "console" for the stdin/stdout bench adapter.
    pub device: String,
    pub channel_index: u32,
    pub channel_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint base, e.g. an Ollama `/v1` URL.
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub chunk_width: usize,
    pub chunk_delay_secs: u64,
    pub send_spacing_secs: u64,
    pub cooldown_secs: i64,
    pub warn_throttle_secs: i64,
    pub triage_timeout_secs: i64,
    pub triage_max_transcript: usize,
    pub menu_timeout_secs: i64,
    pub restriction_mins: i64,
    pub stale_window_secs: i64,
    pub queue_limit: usize,
    pub watchdog_interval_secs: u64,
    pub audit_log_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            llm: LlmConfig::default(),
            responders: BTreeMap::new(),
            switchboard: SwitchboardConfig::default(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            device: "console".to_string(),
            channel_index: 0,
            channel_name: "LongFast".to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "gemma3:latest".to_string(),
            request_timeout_secs: 30,
            max_tokens: 200,
        }
    }
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            chunk_width: 180,
            chunk_delay_secs: 3,
            send_spacing_secs: 2,
            cooldown_secs: 10,
            warn_throttle_secs: 10,
            triage_timeout_secs: 600,
            triage_max_transcript: 12,
            menu_timeout_secs: 120,
            restriction_mins: 120,
            stale_window_secs: 10,
            queue_limit: 15,
            watchdog_interval_secs: 30,
            audit_log_path: "operator_audit.jsonl".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the built-in defaults so
    /// a bench run needs no setup.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(device) = std::env::var("OPERATOR_RADIO_DEVICE") {
            self.radio.device = device;
        }
        if let Ok(url) = std::env::var("OPERATOR_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("OPERATOR_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(path) = std::env::var("OPERATOR_AUDIT_LOG") {
            self.switchboard.audit_log_path = path;
        }
    }

    /// Distinct responder node ids, in deterministic (map) order.
    pub fn responder_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for id in self.responders.values() {
            if !id.is_empty() && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn is_responder(&self, node_id: &str) -> bool {
        self.responders.values().any(|id| id == node_id)
    }

    /// The single responder a trigger routes to, if one is mapped.
    pub fn responder_for(&self, trigger: SosTrigger) -> Option<String> {
        self.responders
            .get(trigger.responder_key())
            .filter(|id| !id.is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.switchboard.chunk_width, 180);
        assert_eq!(config.switchboard.cooldown_secs, 10);
        assert_eq!(config.switchboard.triage_timeout_secs, 600);
        assert_eq!(config.switchboard.triage_max_transcript, 12);
        assert_eq!(config.switchboard.menu_timeout_secs, 120);
        assert_eq!(config.switchboard.restriction_mins, 120);
        assert_eq!(config.switchboard.stale_window_secs, 10);
        assert_eq!(config.switchboard.queue_limit, 15);
        assert_eq!(config.llm.request_timeout_secs, 30);
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let config: Config = toml::from_str(
            r#"
            [radio]
            device = "/dev/ttyUSB0"
            channel_index = 2

            [responders]
            fire = "!f1r3"
            police = "!c0ff3"
            ems = ""

            [switchboard]
            queue_limit = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.radio.device, "/dev/ttyUSB0");
        assert_eq!(config.radio.channel_index, 2);
        assert_eq!(config.switchboard.queue_limit, 5);
        // untouched sections keep defaults
        assert_eq!(config.switchboard.chunk_width, 180);
        assert_eq!(config.llm.model, "gemma3:latest");
    }

    #[test]
    fn responder_routing_honors_empty_mapping() {
        let config: Config = toml::from_str(
            r#"
            [responders]
            fire = "!f1r3"
            police = "!c0ff3"
            ems = ""
            "#,
        )
        .unwrap();
        assert_eq!(
            config.responder_for(SosTrigger::Fire).as_deref(),
            Some("!f1r3")
        );
        // empty mapping means "all responders", not a specific node
        assert_eq!(config.responder_for(SosTrigger::Ems), None);
        assert_eq!(config.responder_for(SosTrigger::Sos), None);

        assert!(config.is_responder("!f1r3"));
        assert!(!config.is_responder("!nobody"));
        assert_eq!(config.responder_ids(), vec!["!f1r3", "!c0ff3"]);
    }
}
