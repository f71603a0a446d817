//! Settings and configuration module
//!
//! Aggregates the per-component configuration structs into a single
//! [`EngineConfig`] that can be deserialised from JSON. Every field has a
//! default, so partial documents are accepted.

use serde::Deserialize;
use thiserror::Error;

use crate::engine::MachineConfig;
use crate::modules::proxy::ProxyConfig;
use crate::modules::session::SessionConfig;
use crate::request::RequestConfig;
use crate::runner::RunnerConfig;

/// Highest accepted `request.max_retries`.
pub const MAX_RETRIES: u32 = 20;
/// Lowest accepted `request.requests_per_second` (one request an hour).
pub const MIN_REQUESTS_PER_SECOND: f64 = 1.0 / 3600.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub request: RequestConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub machine: MachineConfig,
    pub runner: RunnerConfig,
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request.backoff_base < 1.0 {
            return Err(ConfigError::Invalid(
                "request.backoff_base must be at least 1".into(),
            ));
        }
        if self.request.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "request.max_retries must be at most {MAX_RETRIES}"
            )));
        }
        if let Some(rps) = self.request.requests_per_second
            && !(rps.is_finite() && rps >= MIN_REQUESTS_PER_SECOND)
        {
            return Err(ConfigError::Invalid(format!(
                "request.requests_per_second must be at least {MIN_REQUESTS_PER_SECOND:.6}"
            )));
        }
        if self.request.timeout.is_zero() {
            return Err(ConfigError::Invalid("request.timeout must be non-zero".into()));
        }
        if self.proxy.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "proxy.failure_threshold must be at least 1".into(),
            ));
        }
        if self.machine.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "machine.poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Serde helpers for durations expressed as whole milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
