// Configuration types for the threading runtime

use super::error::ThreadingError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration, usually loaded from `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool settings
    pub pool: PoolConfig,

    /// Shared reference propagation settings
    pub sync: SyncConfig,

    /// Settings applied to every spawned worker thread
    pub worker: WorkerConfig,
}

/// Thread pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of execution contexts to spawn
    pub size: usize,

    /// How long `open` waits for a free context, in milliseconds
    pub open_timeout_ms: u64,

    /// Run the task on the caller's thread when no context frees up in time.
    /// This gives up isolation and must be opted into explicitly.
    pub degraded_fallback: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            open_timeout_ms: 30_000,
            degraded_fallback: false,
        }
    }
}

impl PoolConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Bounded retry policy for applying incoming ref-updates to a locked cell
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts before an update is dropped and reported as stale
    pub apply_retries: u32,

    /// Fixed backoff between attempts, in milliseconds
    pub apply_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            apply_retries: 50,
            apply_backoff_ms: 10,
        }
    }
}

impl SyncConfig {
    pub fn apply_backoff(&self) -> Duration {
        Duration::from_millis(self.apply_backoff_ms)
    }
}

/// Worker thread settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of worker thread names (`<prefix>-<index>`)
    pub thread_name_prefix: String,

    /// Stack size per worker thread in bytes; platform default when unset
    pub stack_size: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "isothread-worker".to_string(),
            stack_size: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ThreadingError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ThreadingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ThreadingError> {
        let raw = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loading runtime configuration");
        Self::from_toml_str(&raw)
    }

    /// Load from `path`, falling back to the default location and then to
    /// built-in defaults when no file exists there
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ThreadingError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Default config location (e.g. `~/.config/isothread/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "isothread")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ThreadingError> {
        if self.pool.size == 0 {
            return Err(ThreadingError::Config(
                "pool.size must be at least 1".to_string(),
            ));
        }
        if self.worker.thread_name_prefix.is_empty() {
            return Err(ThreadingError::Config(
                "worker.thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// JSON schema of the configuration file
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(RuntimeConfig)).unwrap_or_default()
    }
}
