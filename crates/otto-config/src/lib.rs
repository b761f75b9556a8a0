use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use otto_types::DedupPrecision;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-ness evaluations.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Same-minute duplicate-fire guard precision.
    #[serde(default)]
    pub dedup: DedupPrecision,
}

fn default_tick_seconds() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            dedup: DedupPrecision::default(),
        }
    }
}

/// Agent command configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command the dispatcher runs for each agent run.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments placed before the per-run arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Model passed to the command when an automation sets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

fn default_command() -> String {
    "agent".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            default_model: None,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database path (~/.otto/otto.db if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Top-level otto configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OttoConfig {
    /// Scheduler loop config.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Agent command config.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Storage config.
    #[serde(default)]
    pub store: StoreConfig,
}

impl OttoConfig {
    /// Resolve the database path, honoring the configured override.
    pub fn db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("otto.db")),
        }
    }
}

/// Resolve the otto config directory (~/.otto/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".otto"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.otto/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<OttoConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<OttoConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(OttoConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: OttoConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}
