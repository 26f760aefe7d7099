//! Host settings management

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::health::RetryPolicy;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings of the engine host itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    // Engine
    /// Env file used for the initial engine start
    pub engine_env_file: Option<PathBuf>,
    /// Arguments passed to the engine binary
    pub engine_args: Vec<String>,
    /// How long a stopped engine may take to exit before it is killed (ms)
    pub stop_grace_period_ms: u64,

    // Health checks
    /// Delay between health checks (ms)
    pub health_check_interval_ms: u64,
    /// Timeout of a single health check request (ms)
    pub health_check_timeout_ms: u64,
    /// Give up after this many health checks (0 = never)
    pub health_check_max_attempts: u32,
    /// Give up after this many seconds (0 = never)
    pub health_check_deadline_secs: u64,

    // Control channel
    /// Events buffered for a lagging subscriber
    pub event_capacity: usize,

    // Advanced
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            // Engine
            engine_env_file: None,
            engine_args: vec!["start".to_string(), "--quickstart".to_string()],
            stop_grace_period_ms: 5_000,

            // Health checks
            health_check_interval_ms: 500,
            health_check_timeout_ms: 2_000,
            health_check_max_attempts: 0,
            health_check_deadline_secs: 0,

            // Control channel
            event_capacity: 256,

            // Advanced
            debug_logging: false,
        }
    }
}

impl HostSettings {
    /// Default location of the settings file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("EngineHost")
            .join("settings.json")
    }

    /// Load settings from `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut settings: Self = serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate();
        Ok(settings)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.health_check_interval_ms = self.health_check_interval_ms.max(10);
        self.health_check_timeout_ms = self.health_check_timeout_ms.max(100);
        self.event_capacity = self.event_capacity.clamp(1, 65_536);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.health_check_interval_ms),
            max_attempts: (self.health_check_max_attempts > 0)
                .then_some(self.health_check_max_attempts),
            deadline: (self.health_check_deadline_secs > 0)
                .then(|| Duration::from_secs(self.health_check_deadline_secs)),
        }
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}
