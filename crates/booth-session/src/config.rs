//! Session configuration.
//!
//! Loaded once at startup (JSON) and read-only afterwards. Durations are
//! plain millisecond integers so the file stays hand-editable.

use booth_camera::{Property, EVENT_DEPTH};
use booth_reclaim::ReclaimConfig;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Delay schedule between a failed acquisition and the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 2_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed acquisitions tolerated before the controller gives up
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let shift = failures.saturating_sub(1).min(32);
                let delay = initial_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Configuration for a [`crate::SessionController`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    /// Live view poll period
    pub preview_period_ms: u64,
    /// Upper bound for any single device call
    pub device_timeout_ms: u64,
    /// Where captures are downloaded before re-encoding
    pub capture_dir: PathBuf,
    /// Property map applied when a session opens
    pub properties: Vec<Property>,
    pub event_channel_depth: usize,
    pub outbound_channel_depth: usize,
    /// Consecutive dispatch failures that force recovery; `None` keeps
    /// dispatch failures isolated
    pub dispatch_failure_threshold: Option<u32>,
    pub reclaim: ReclaimConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            preview_period_ms: 50,
            device_timeout_ms: 5_000,
            capture_dir: PathBuf::from("./images"),
            properties: Property::kiosk_defaults(),
            event_channel_depth: EVENT_DEPTH,
            outbound_channel_depth: 64,
            dispatch_failure_threshold: None,
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.preview_period_ms == 0 {
            return Err(ConfigError::Invalid("preview_period_ms must be positive".into()));
        }
        if self.device_timeout_ms == 0 {
            return Err(ConfigError::Invalid("device_timeout_ms must be positive".into()));
        }
        if let Some(0) = self.dispatch_failure_threshold {
            return Err(ConfigError::Invalid("dispatch_failure_threshold must be at least 1".into()));
        }
        Ok(())
    }

    pub fn preview_period(&self) -> Duration {
        Duration::from_millis(self.preview_period_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}
