//! Resilient request layer.
//!
//! Each task gets its own [`RequestClient`] handle over a shared transport.
//! The handle applies credentials and class-specific headers, retries
//! transient failures with backoff, surfaces session expiry immediately and
//! hands challenge responses back untouched as [`RequestOutcome::Challenge`].

pub mod client;
pub mod detection;
pub mod headers;
pub mod reqwest_transport;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::modules::session::SessionError;

pub use client::{RequestClient, RequestOutcome, Response};
pub use detection::{ChallengeDetection, ChallengeKind, detect, is_challenge};
pub use headers::{AuthMaterial, HeaderConfig, HeaderProfile, RequestClass};
pub use reqwest_transport::ReqwestTransport;
pub use transport::{HttpTransport, TransportError, TransportRequest, TransportResponse};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("session expired (HTTP {status}), re-login required")]
    SessionExpired { status: u16 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("HTTP {status} after {attempts} attempts")]
    Status { status: u16, attempts: u32 },
    #[error("invalid response: {0}")]
    Validation(String),
    #[error("invalid header value for {0}")]
    InvalidHeader(String),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("session unavailable: {0}")]
    Session(#[from] SessionError),
}

impl RequestError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, RequestError::SessionExpired { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RequestError::Status { status: 429, .. })
    }

    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Transport(_) => true,
            RequestError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: f64,
    /// Length of one backoff "second"; scaled by `backoff_base^n`.
    #[serde(with = "crate::config::millis")]
    pub backoff_unit: Duration,
    #[serde(with = "crate::config::millis")]
    pub transport_retry_delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub auth_retry_delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub timeout: Duration,
    pub requests_per_second: Option<f64>,
    pub clearance_cookie: String,
    pub headers: HeaderConfig,
}

impl RequestConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `backoff_unit * backoff_base^exponent`, capped at [`MAX_BACKOFF`].
    pub fn backoff(&self, exponent: u32) -> Duration {
        let factor = self.backoff_base.powi(exponent.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.backoff_unit.as_secs_f64() * factor)
            .map_or(MAX_BACKOFF, |wait| wait.min(MAX_BACKOFF))
    }
}

/// Upper bound for a single retry wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            transport_retry_delay: Duration::from_secs(1),
            auth_retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            requests_per_second: None,
            clearance_cookie: "cf_clearance".into(),
            headers: HeaderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically() {
        let config = RequestConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn backoff_is_capped_for_large_exponents() {
        let config = RequestConfig {
            max_retries: u32::MAX,
            ..Default::default()
        };
        assert_eq!(config.backoff(9), MAX_BACKOFF);
        assert_eq!(config.backoff(5000), MAX_BACKOFF);
        assert_eq!(config.backoff(u32::MAX), MAX_BACKOFF);
        assert_eq!(config.max_attempts(), u32::MAX);
    }

    #[test]
    fn classifies_errors() {
        assert!(RequestError::Status { status: 429, attempts: 4 }.is_rate_limited());
        assert!(RequestError::Status { status: 503, attempts: 4 }.is_transient());
        assert!(!RequestError::SessionExpired { status: 401 }.is_transient());
        assert!(RequestError::Transport(TransportError::Timeout).is_transient());
    }
}
