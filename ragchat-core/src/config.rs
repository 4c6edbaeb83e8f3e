//! Configuration for the generation pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment -> explicit overrides. Files are read
//! from the platform config dir (`config.toml`) and from
//! `.ragchat/config.toml` in the workspace.

use crate::budget::BudgetSettings;
use crate::error::ConfigError;
use crate::history::HistoryDefaults;
use crate::retry::RetryPolicy;
use crate::types::ProviderTokenLimits;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub history: HistoryDefaults,
    pub budget: BudgetSettings,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub backend: BackendSection,
}

/// Per-call timeouts in milliseconds. `0` disables a timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub document_query_ms: u64,
    pub history_fetch_ms: u64,
    pub model_call_ms: u64,
    pub persistence_write_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            document_query_ms: 10_000,
            history_fetch_ms: 5_000,
            model_call_ms: 300_000,
            persistence_write_ms: 5_000,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn document_query(&self) -> Option<Duration> {
        millis(self.document_query_ms)
    }

    pub fn history_fetch(&self) -> Option<Duration> {
        millis(self.history_fetch_ms)
    }

    pub fn model_call(&self) -> Option<Duration> {
        millis(self.model_call_ms)
    }

    pub fn persistence_write(&self) -> Option<Duration> {
        millis(self.persistence_write_ms)
    }
}

/// Token limits, with optional per-backend overrides keyed by backend id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub default: ProviderTokenLimits,
    pub providers: BTreeMap<String, ProviderTokenLimits>,
}

impl LimitsConfig {
    /// Limits for a backend, falling back to the default table.
    pub fn for_backend(&self, backend_id: &str) -> ProviderTokenLimits {
        self.providers
            .get(backend_id)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Document query cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 128,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// The model backend the CLI talks to by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub id: String,
    pub endpoint: String,
    pub model: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            id: "ollama".into(),
            endpoint: "http://localhost:11434".into(),
            model: "llama3.2:3b".into(),
        }
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.default.validate()?;
        for limits in self.limits.providers.values() {
            limits.validate()?;
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier <= 0.0 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "retry.multiplier must be positive, got {}",
                    self.retry.multiplier
                ),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                message: "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            });
        }
        if self.history.max_context_messages == 0 {
            return Err(ConfigError::Invalid {
                message: "history.max_context_messages must be at least 1".into(),
            });
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "cache.capacity must be at least 1 when the cache is enabled".into(),
            });
        }
        Ok(())
    }

    /// Render as TOML, in the layout the loader reads.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Path of the user-level config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "ragchat", "ragchat")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".ragchat").join("config.toml")
}

/// Load configuration from all layers.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`RAGCHAT_RETRY__MAX_ATTEMPTS`, ...)
/// 3. Workspace config (`.ragchat/config.toml`)
/// 4. User config
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PipelineConfig>,
) -> Result<PipelineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("RAGCHAT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
