//! Provider registry: adapters keyed by config name, with agent-profile
//! resolution and the `default` fallback.

use std::collections::HashMap;
use std::sync::Arc;

use pa_domain::config::{AgentProfile, Config};
use pa_domain::{Error, Result};

use crate::{LlmProvider, OpenAiCompatProvider};

/// A resolved (provider, model, profile) triple for one agent.
pub struct ResolvedModel {
    pub provider: Arc<dyn LlmProvider>,
    pub model_id: String,
    pub profile: AgentProfile,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("provider", &self.provider.provider_id())
            .field("model_id", &self.model_id)
            .field("profile", &self.profile)
            .finish()
    }
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    config: Config,
}

impl ProviderRegistry {
    /// Build adapters for every configured provider. Entries whose
    /// credential env var is unset are skipped with a warning — the
    /// gateway still serves non-model endpoints.
    pub fn from_config(config: &Config) -> Self {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for (name, provider_cfg) in &config.providers {
            match OpenAiCompatProvider::from_config(name, provider_cfg) {
                Ok(provider) => {
                    providers.insert(name.clone(), Arc::new(provider));
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider not initialized");
                }
            }
        }
        Self {
            providers,
            config: config.clone(),
        }
    }

    /// Registry with a single injected provider; used by tests and by the
    /// CLI chat loop against a scripted backend.
    pub fn with_provider(config: &Config, name: &str, provider: Arc<dyn LlmProvider>) -> Self {
        let mut providers = HashMap::new();
        providers.insert(name.to_string(), provider);
        Self {
            providers,
            config: config.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Resolve the provider and model for an agent. Unknown agent ids fall
    /// back to the `default` profile with a warning.
    pub fn resolve(&self, agent_id: &str) -> Result<ResolvedModel> {
        let (profile, fell_back) = self.config.agent_profile(agent_id)?;
        if fell_back {
            tracing::warn!(
                agent_id = %agent_id,
                "unknown agent profile; falling back to default"
            );
        }

        let provider = self
            .providers
            .get(&profile.model.provider)
            .cloned()
            .ok_or_else(|| Error::Provider {
                provider: profile.model.provider.clone(),
                message: "provider not initialized".into(),
            })?;

        Ok(ResolvedModel {
            provider,
            model_id: profile.model.model_id.clone(),
            profile: profile.clone(),
        })
    }
}
