//! Browser header profiles per request class.
//!
//! Each request handle owns one [`HeaderProfile`]; its user-agent cursor is
//! per-handle state, never shared between tasks.

use http::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, AUTHORIZATION, CACHE_CONTROL, CONNECTION,
    CONTENT_TYPE, COOKIE, ORIGIN, PRAGMA, REFERER, UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::sync::Mutex;

use super::RequestError;

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36",
];

const ACCEPT_JSON: &str = "application/json, text/plain, */*";
const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";

/// Declared purpose of a request; selects the header set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestClass {
    Page,
    #[default]
    Api,
    Checkout,
}

/// Credential material applied to one outgoing request.
#[derive(Debug, Clone, Default)]
pub struct AuthMaterial {
    pub cookie_header: String,
    pub bearer_token: Option<String>,
    pub csrf_token: Option<String>,
}

/// Static part of the header profile, shared through configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub user_agents: Vec<String>,
    pub accept_language: String,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            accept_language: "en-CA,en-GB;q=0.9,en-US;q=0.8,en;q=0.7".into(),
            origin: None,
            referer: None,
            extra: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct HeaderProfile {
    config: HeaderConfig,
    user_agent_index: Mutex<usize>,
}

impl HeaderProfile {
    pub fn new(config: HeaderConfig) -> Self {
        Self {
            config,
            user_agent_index: Mutex::new(0),
        }
    }

    pub fn user_agent(&self) -> Option<String> {
        let index = *self
            .user_agent_index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.config
            .user_agents
            .get(index % self.config.user_agents.len().max(1))
            .cloned()
    }

    /// Advances to the next configured user agent and returns it.
    pub fn rotate_user_agent(&self) -> Option<String> {
        if self.config.user_agents.is_empty() {
            return None;
        }
        let mut index = self
            .user_agent_index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *index = (*index + 1) % self.config.user_agents.len();
        self.config.user_agents.get(*index).cloned()
    }

    /// Full header set for `class` carrying `auth`.
    pub fn build(&self, class: RequestClass, auth: &AuthMaterial) -> Result<HeaderMap, RequestError> {
        let mut headers = HeaderMap::new();

        if let Some(agent) = self.user_agent() {
            headers.insert(USER_AGENT, value(&agent, "user-agent")?);
        }
        headers.insert(
            ACCEPT_LANGUAGE,
            value(&self.config.accept_language, "accept-language")?,
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Some(origin) = &self.config.origin {
            headers.insert(ORIGIN, value(origin, "origin")?);
        }
        if let Some(referer) = &self.config.referer {
            headers.insert(REFERER, value(referer, "referer")?);
        }

        match class {
            RequestClass::Api => {
                headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                insert_fetch_metadata(&mut headers, "empty", "cors");
            }
            RequestClass::Page => {
                headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
                insert_fetch_metadata(&mut headers, "document", "navigate");
                headers.insert(
                    HeaderName::from_static("sec-fetch-user"),
                    HeaderValue::from_static("?1"),
                );
                headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
            }
            RequestClass::Checkout => {
                headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                insert_fetch_metadata(&mut headers, "empty", "cors");
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
            }
        }

        for (name, raw) in &self.config.extra {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RequestError::InvalidHeader(name.clone()))?;
            headers.insert(header_name, value(raw, name)?);
        }

        if !auth.cookie_header.is_empty() {
            headers.insert(COOKIE, value(&auth.cookie_header, "cookie")?);
        }
        if let Some(token) = &auth.bearer_token {
            headers.insert(AUTHORIZATION, value(&format!("Bearer {token}"), "authorization")?);
        }
        if let Some(csrf) = &auth.csrf_token {
            let csrf = value(csrf, "x-csrf-token")?;
            headers.insert(HeaderName::from_static("x-csrf-token"), csrf.clone());
            headers.insert(HeaderName::from_static("x-xsrf-token"), csrf);
        }

        Ok(headers)
    }
}

impl Default for HeaderProfile {
    fn default() -> Self {
        Self::new(HeaderConfig::default())
    }
}

fn insert_fetch_metadata(headers: &mut HeaderMap, dest: &'static str, mode: &'static str) {
    headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static(dest));
    headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static(mode));
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
}

fn value(raw: &str, name: &str) -> Result<HeaderValue, RequestError> {
    HeaderValue::from_str(raw).map_err(|_| RequestError::InvalidHeader(name.to_string()))
}
