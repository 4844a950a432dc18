use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::log::LogConfig;

/// Environment variable overriding the engine home directory.
pub const ENV_HOME: &str = "DOCKYARD_HOME";
/// Environment variable enabling durable metadata ("1"/"true").
pub const ENV_PERSIST: &str = "DOCKYARD_PERSIST";
/// Environment variable overriding the default stop timeout, in seconds.
pub const ENV_STOP_TIMEOUT: &str = "DOCKYARD_STOP_TIMEOUT";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for blobs, container filesystems, volumes and metadata
    pub home_dir: PathBuf,

    /// Persist tags, volumes and networks across restarts
    pub persist: bool,

    /// Pool that automatically assigned network subnets are carved from
    pub default_subnet: String,

    /// Network created on startup and joined by containers that name none
    pub default_network: String,

    /// Grace period between SIGTERM and SIGKILL, in seconds
    pub stop_timeout_secs: u64,

    /// Default container log driver settings
    pub log: LogConfig,

    /// Log level
    pub log_level: LogLevel,

    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,

    /// Output lines retained in memory per container
    pub log_buffer_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            persist: false,
            default_subnet: "10.88.0.0/16".to_string(),
            default_network: "bridge".to_string(),
            stop_timeout_secs: 10,
            log: LogConfig::default(),
            log_level: LogLevel::Info,
            event_capacity: 256,
            log_buffer_lines: 1000,
        }
    }
}

/// `~/.dockyard`, or `./.dockyard` when no home directory is known.
fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockyard")
}

impl EngineConfig {
    /// Config rooted at `home_dir` with everything else defaulted.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(EngineError::ConfigError(format!(
                    "unsupported config format: {}",
                    path.display()
                )))
            }
        };
        Ok(config)
    }

    /// Defaults overlaid with `DOCKYARD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from a variable lookup onto this config.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(home) = lookup(ENV_HOME).filter(|v| !v.is_empty()) {
            self.home_dir = PathBuf::from(home);
        }
        if let Some(persist) = lookup(ENV_PERSIST) {
            self.persist = matches!(persist.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(timeout) = lookup(ENV_STOP_TIMEOUT) {
            self.stop_timeout_secs = timeout.trim().parse().map_err(|_| {
                EngineError::ConfigError(format!(
                    "{} must be a number of seconds, got '{}'",
                    ENV_STOP_TIMEOUT, timeout
                ))
            })?;
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.home_dir.join("blobs")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.home_dir.join("containers")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.home_dir.join("volumes")
    }

    pub fn images_file(&self) -> PathBuf {
        self.home_dir.join("images.json")
    }

    pub fn volumes_file(&self) -> PathBuf {
        self.home_dir.join("volumes.json")
    }

    pub fn networks_file(&self) -> PathBuf {
        self.home_dir.join("networks.json")
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
