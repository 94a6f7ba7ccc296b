use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{ProcessOptions, DEFAULT_MAX_ATTEMPTS};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "sled")]
    Sled {
        data_dir: String,
        #[serde(default)]
        max_pending: Option<usize>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sled {
            data_dir: "./data".to_string(),
            max_pending: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryConfig {
    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions::new().with_max_attempts(self.max_attempts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// `host:port` probed to decide whether the backend is reachable.
    pub probe_target: Option<String>,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_target: None,
            probe_interval_ms: 3_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Config {
    /// Defaults, overlaid with `path` (JSON) when given, then with `TOURQ_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Apply overrides; `lookup` returns the value of an environment variable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TOURQ_DATA_DIR") {
            match &mut self.storage {
                StorageConfig::Sled { data_dir, .. } => *data_dir = dir,
            }
        }

        if let Some(raw) = lookup("TOURQ_MAX_PENDING") {
            let limit = parse_env("TOURQ_MAX_PENDING", &raw)?;
            match &mut self.storage {
                StorageConfig::Sled { max_pending, .. } => *max_pending = Some(limit),
            }
        }

        if let Some(raw) = lookup("TOURQ_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("TOURQ_MAX_ATTEMPTS", &raw)?;
        }

        if let Some(target) = lookup("TOURQ_PROBE_TARGET") {
            self.connectivity.probe_target = Some(target).filter(|t| !t.is_empty());
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}
