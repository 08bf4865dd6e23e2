//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast on malformed values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Path of a TOML file with coordinator settings and rate limits.
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config_file = optional_var("WORKGATE_CONFIG").map(PathBuf::from);
        Ok(Self {
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            config_file,
        })
    }

    /// Load the TOML file named by `WORKGATE_CONFIG`, or defaults when unset.
    pub fn load_file(&self) -> Result<WorkgateFile> {
        match self.config_file {
            Some(ref path) => WorkgateFile::load(path),
            None => Ok(WorkgateFile::default()),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Timing and capacity knobs for the coordinator and its workers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backoff after the first failed attempt. Doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Ceiling for the failure backoff.
    pub max_backoff_ms: u64,
    /// How often an unmet conditions gate is re-polled.
    pub gate_retry_interval_ms: u64,
    /// Floor for rate-limit waits.
    pub min_rate_limit_wait_ms: u64,
    /// Grace period requested when the app enters the background.
    pub grace_period_secs: u64,
    /// Requests buffered for work ids with no registered worker.
    pub unrouted_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 30_000,
            max_backoff_ms: 120_000,
            gate_retry_interval_ms: 1_000,
            min_rate_limit_wait_ms: 10,
            grace_period_secs: 180,
            unrouted_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn gate_retry_interval(&self) -> Duration {
        Duration::from_millis(self.gate_retry_interval_ms)
    }

    pub fn min_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.min_rate_limit_wait_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Backoff after the `attempt`-th (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let backoff = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(backoff.min(self.max_backoff_ms))
    }
}

/// A rate limit declared in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    pub key: String,
    pub rate: u32,
    pub interval_ms: u64,
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Top-level TOML layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkgateFile {
    pub coordinator: CoordinatorConfig,
    #[serde(rename = "rate_limit")]
    pub rate_limits: Vec<RateLimitConfig>,
}

impl WorkgateFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}
