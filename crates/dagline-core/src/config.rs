use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DaglineError, Result};
use crate::types::EngineType;

/// Top-level dagline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    /// Load config from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DaglineError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)
            .map_err(|e| DaglineError::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env()?;
        Ok(config)
    }

    /// Load from file if present, otherwise defaults; env overrides apply
    /// either way.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(c) => Ok(c),
            Err(DaglineError::ConfigNotFound(_)) => {
                let mut config = AppConfig::default();
                config.apply_env()?;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// `WORKFLOW_ENGINE_TYPE` overrides the configured default engine.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("WORKFLOW_ENGINE_TYPE") {
            self.engine.engine_type = v.parse()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default engine when a run request does not name one.
    #[serde(default)]
    pub engine_type: EngineType,
    /// Directory workflow template paths are resolved against.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
    /// Base delay between retry attempts, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_type: EngineType::default(),
            workflows_dir: default_workflows_dir(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Idle connections that ping within this interval are kept open.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ping_interval_secs: default_ping_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database for runs created with `persist: true`.
    #[serde(default = "default_persist_path")]
    pub persist_path: String,
    /// Directory terminal runs are archived into.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persist_path: default_persist_path(),
            archive_dir: default_archive_dir(),
        }
    }
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    256
}

fn default_persist_path() -> String {
    "dagline.db".to_string()
}

fn default_archive_dir() -> String {
    "archives".to_string()
}
