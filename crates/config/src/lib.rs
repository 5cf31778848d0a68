//! Configuration loading, validation, and management for Esquire.
//!
//! Loads configuration from `~/.esquire/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Compaction never runs more often than this, whatever is configured.
pub const MIN_VACUUM_INTERVAL_HOURS: u64 = 1;

/// The root configuration structure.
///
/// Maps directly to `~/.esquire/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Conversation memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Law-text retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Turn orchestration configuration
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// When false, reads return nothing and writes are dropped; the caller
    /// supplies history instead.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite file shared by every worker process
    #[serde(default = "default_memory_path")]
    pub path: PathBuf,

    /// Turns replayed to the model per request
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,

    /// Per-conversation row cap
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Hours between compaction passes (floored at one hour)
    #[serde(default = "default_vacuum_interval_hours")]
    pub vacuum_interval_hours: u64,

    /// How long one statement waits on another writer's lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Attempts per write before reporting contention
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Base delay between write attempts, doubled on each retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_memory_path() -> PathBuf {
    AppConfig::config_dir().join("memory.sqlite3")
}
fn default_context_limit() -> usize {
    10
}
fn default_max_rows() -> usize {
    200
}
fn default_vacuum_interval_hours() -> u64 {
    24
}
fn default_busy_timeout_ms() -> u64 {
    2_000
}
fn default_write_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}

impl MemoryConfig {
    /// The compaction interval with the one-hour floor applied.
    pub fn vacuum_interval_hours_effective(&self) -> u64 {
        self.vacuum_interval_hours.max(MIN_VACUUM_INTERVAL_HOURS)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_memory_path(),
            context_limit: default_context_limit(),
            max_rows: default_max_rows(),
            vacuum_interval_hours: default_vacuum_interval_hours(),
            busy_timeout_ms: default_busy_timeout_ms(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Vector collection holding the law texts
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Hits requested per sub-query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Score window within which a newer version of the same instrument
    /// displaces an older one. Zero only resolves exact ties.
    #[serde(default)]
    pub version_tolerance: f64,
}

fn default_collection() -> String {
    "esmeralda".into()
}
fn default_top_k() -> usize {
    5
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            top_k: default_top_k(),
            version_tolerance: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,

    /// Model round-trips allowed per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_model() -> String {
    "gpt-5-mini".into()
}
fn default_max_iterations() -> u32 {
    8
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// Interpret an on/off environment flag. `""`, `0`, `false` and `False` are off.
pub fn parse_flag(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "False")
}

impl AppConfig {
    /// Load configuration from the default path (~/.esquire/config.toml).
    ///
    /// Environment variables override the file:
    /// - `ESQUIRE_MEMORY_ENABLED`
    /// - `ESQUIRE_MEMORY_PATH`
    /// - `ESQUIRE_MEMORY_LIMIT`
    /// - `ESQUIRE_MEMORY_MAX_ROWS`
    /// - `ESQUIRE_VACUUM_INTERVAL_HOURS`
    /// - `ESQUIRE_COLLECTION`
    /// - `ESQUIRE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_path())
    }

    /// Load `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
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

    /// Apply overrides from an environment lookup.
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "{key} must be a non-negative integer, got '{raw}'"
                ))
            })
        }

        if let Some(v) = lookup("ESQUIRE_MEMORY_ENABLED") {
            self.memory.enabled = parse_flag(&v);
        }
        if let Some(v) = lookup("ESQUIRE_MEMORY_PATH").filter(|v| !v.trim().is_empty()) {
            self.memory.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ESQUIRE_MEMORY_LIMIT") {
            self.memory.context_limit = number("ESQUIRE_MEMORY_LIMIT", v)?;
        }
        if let Some(v) = lookup("ESQUIRE_MEMORY_MAX_ROWS") {
            self.memory.max_rows = number("ESQUIRE_MEMORY_MAX_ROWS", v)?;
        }
        if let Some(v) = lookup("ESQUIRE_VACUUM_INTERVAL_HOURS") {
            self.memory.vacuum_interval_hours = number("ESQUIRE_VACUUM_INTERVAL_HOURS", v)?;
        }
        if let Some(v) = lookup("ESQUIRE_COLLECTION") {
            self.retrieval.collection = v;
        }
        if let Some(v) = lookup("ESQUIRE_MODEL") {
            self.agent.model = v;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".esquire")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.context_limit == 0 {
            return Err(ConfigError::ValidationError(
                "memory.context_limit must be at least 1".into(),
            ));
        }

        if self.memory.max_rows == 0 {
            return Err(ConfigError::ValidationError(
                "memory.max_rows must be at least 1".into(),
            ));
        }

        if self.memory.write_retries == 0 {
            return Err(ConfigError::ValidationError(
                "memory.write_retries must be at least 1".into(),
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be at least 1".into(),
            ));
        }

        let tolerance = self.retrieval.version_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ConfigError::ValidationError(
                "retrieval.version_tolerance must be a non-negative number".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
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
