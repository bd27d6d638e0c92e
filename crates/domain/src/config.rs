//! Runtime configuration loaded from `agent.yaml`.
//!
//! The file path comes from `PA_CONFIG_PATH` (default `agent.yaml`);
//! defaults apply when the file is absent. One agent profile named
//! `default` is mandatory — startup validation fails without it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONFIG_PATH_ENV: &str = "PA_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "agent.yaml";
pub const DEFAULT_AGENT_ID: &str = "default";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Environment variable holding the API key (e.g. `PA_OPENAI_API_KEY`).
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    pub provider: String,
    pub model_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: 4096,
            top_p: None,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub persona: Persona,
    pub model: ModelSelection,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_port() -> u16 {
    8420
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_db_path() -> String {
    "agent.db".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentProfile>,
    #[serde(default)]
    pub server: ServerConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Clone, Debug)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Load from the path in `PA_CONFIG_PATH`, falling back to `agent.yaml`.
    /// A missing file yields the default configuration.
    pub fn load_from_env() -> Result<(Config, String)> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = Self::load(Path::new(&path))?;
        Ok((config, path))
    }

    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("parsing {}: {e}", path.display())))
    }

    /// Structural checks. A missing `default` agent is an error; an agent
    /// referencing an unknown provider is a warning (the registry falls
    /// back at call time).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if !self.agents.contains_key(DEFAULT_AGENT_ID) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!("agents.{DEFAULT_AGENT_ID} is mandatory"),
            });
        }

        for (id, profile) in &self.agents {
            if !self.providers.contains_key(&profile.model.provider) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!(
                        "agents.{id} references unknown provider {}",
                        profile.model.provider
                    ),
                });
            }
        }

        issues
    }

    /// Resolve an agent profile. Unknown ids fall back to `default`; the
    /// caller logs a warning when `fell_back` is set. Fails only when even
    /// `default` is missing.
    pub fn agent_profile(&self, agent_id: &str) -> Result<(&AgentProfile, bool)> {
        if let Some(profile) = self.agents.get(agent_id) {
            return Ok((profile, false));
        }
        self.agents
            .get(DEFAULT_AGENT_ID)
            .map(|p| (p, true))
            .ok_or(Error::AgentProfileNotFound {
                agent_id: agent_id.to_string(),
            })
    }
}

impl Config {
    /// The parsed form of [`template_yaml`]; handy as a test fixture.
    pub fn template() -> Config {
        serde_yaml::from_str(template_yaml()).expect("template config parses")
    }
}

/// Template written by `agent init`.
pub fn template_yaml() -> &'static str {
    r#"# personal-agent configuration
providers:
  openai:
    apiKeyEnv: PA_OPENAI_API_KEY
    apiUrl: https://api.openai.com/v1

agents:
  default:
    persona:
      name: Assistant
      systemPrompt: You are a helpful personal assistant.
    model:
      provider: openai
      modelId: gpt-4o-mini
    generation:
      temperature: 0.2
      maxOutputTokens: 4096

server:
  port: 8420
  host: 127.0.0.1
  dbPath: agent.db
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_and_validates() {
        let config: Config = serde_yaml::from_str(template_yaml()).unwrap();
        assert!(config.agents.contains_key("default"));
        assert_eq!(config.server.port, 8420);
        assert!(config
            .validate()
            .iter()
            .all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn missing_default_agent_is_an_error() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn unknown_agent_falls_back_to_default() {
        let config: Config = serde_yaml::from_str(template_yaml()).unwrap();
        let (profile, fell_back) = config.agent_profile("agent:nobody").unwrap();
        assert!(fell_back);
        assert_eq!(profile.persona.name, "Assistant");

        let (_, fell_back) = config.agent_profile("default").unwrap();
        assert!(!fell_back);
    }

    #[test]
    fn empty_config_has_no_profiles() {
        let config = Config::default();
        let err = config.agent_profile("anyone").unwrap_err();
        assert_eq!(err.code(), "AgentProfileNotFound");
    }

    #[test]
    fn camel_case_keys() {
        let yaml = r#"
providers:
  local:
    apiKeyEnv: PA_LOCAL_API_KEY
server:
  port: 9000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.providers["local"].api_key_env, "PA_LOCAL_API_KEY");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.db_path, "agent.db");
    }
}
