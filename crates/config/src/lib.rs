//! Configuration loading, validation, and management for Reagent.
//!
//! Loads configuration from `~/.reagent/config.toml` with environment
//! variable overrides. Validates all settings at startup. The agent engine
//! itself takes every setting as a constructor input; this crate is the
//! host-application convenience layer that feeds it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.reagent/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default provider group whose credentials serve model calls
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Agent loop settings
    #[serde(default, rename = "loop")]
    pub loop_settings: LoopConfig,

    /// Credential groups, one per provider, each feeding one key pool
    #[serde(default)]
    pub credentials: HashMap<String, CredentialGroup>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Settings for the agent loop engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum reasoning iterations per invocation
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Whole-loop timeout in seconds; absent = no timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Whether model calls stream by default
    #[serde(default)]
    pub stream: bool,
}

fn default_max_iterations() -> u32 {
    10
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_secs: None,
            stream: false,
        }
    }
}

/// One provider group's credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialGroup {
    /// API keys served round-robin by load
    pub keys: Vec<String>,
}

impl std::fmt::Debug for CredentialGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGroup")
            .field("keys", &format!("[{} redacted]", self.keys.len()))
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("loop_settings", &self.loop_settings)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.reagent/config.toml).
    ///
    /// Also checks environment variables:
    /// - `REAGENT_API_KEYS` — comma-separated keys for the default provider
    ///   group (highest priority; replaces the group's configured keys)
    /// - `REAGENT_PROVIDER` — overrides `default_provider`
    /// - `REAGENT_MODEL` — overrides `default_model`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(provider) = std::env::var("REAGENT_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("REAGENT_MODEL") {
            config.default_model = model;
        }

        if let Ok(raw) = std::env::var("REAGENT_API_KEYS") {
            let keys: Vec<String> = raw
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            if !keys.is_empty() {
                config
                    .credentials
                    .insert(config.default_provider.clone(), CredentialGroup { keys });
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".reagent")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.loop_settings.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "loop.max_iterations must be at least 1".into(),
            ));
        }

        for (group, creds) in &self.credentials {
            if creds.keys.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "credential group '{group}' has no keys"
                )));
            }
        }

        Ok(())
    }

    /// The configured keys for a provider group, if any.
    pub fn keys_for(&self, group: &str) -> Option<&[String]> {
        self.credentials.get(group).map(|c| c.keys.as_slice())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            loop_settings: LoopConfig::default(),
            credentials: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
