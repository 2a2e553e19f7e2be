//! Configuration loading from capstan.toml.

use policy::Policy;
use runtime::RuntimeConfig;
use serde::Deserialize;
use std::path::Path;

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Agent loop settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Policy rules (allow/deny).
    #[serde(flatten)]
    pub policy: Policy,
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    /// Provider name (currently only "anthropic" supported).
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model to use.
    #[serde(default = "default_model")]
    pub model: String,

    /// Anthropic API key; `ANTHROPIC_API_KEY` takes precedence.
    pub api_key: Option<String>,

    /// Override the API endpoint.
    pub base_url: Option<String>,

    pub max_tokens: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            max_tokens: None,
        }
    }
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration.
    pub fn default_config() -> Self {
        Self {
            backend: BackendConfig::default(),
            runtime: RuntimeConfig::default(),
            policy: Policy::restrictive(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.provider != "anthropic" {
            return Err(ConfigError::UnsupportedProvider(self.backend.provider.clone()));
        }
        self.runtime
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The API key, preferring the environment over the file.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        self.api_key_from(std::env::var(API_KEY_ENV).ok())
    }

    fn api_key_from(&self, env: Option<String>) -> Result<String, ConfigError> {
        env.filter(|key| !key.trim().is_empty())
            .or_else(|| self.backend.api_key.clone())
            .ok_or(ConfigError::MissingApiKey)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unsupported provider '{0}' (only 'anthropic' is available)")]
    UnsupportedProvider(String),

    #[error("API key not configured: set ANTHROPIC_API_KEY or backend.api_key")]
    MissingApiKey,
}
