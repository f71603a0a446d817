//! Session and credential management.
//!
//! Holds the cookie header, bearer token and anti-bot tokens parsed from an
//! exported cookie list, and keeps them validated. The session itself sits
//! behind an async mutex that is never held across a network call; a second
//! gate serialises validation and warm-up so concurrent callers share one probe.

use chrono::{DateTime, Utc};
use http::Method;
use http::header::SET_COOKIE;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::request::headers::{AuthMaterial, HeaderProfile, RequestClass};
use crate::request::transport::{
    HttpTransport, TransportError, TransportRequest, TransportResponse,
};

static CSRF_META: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[name="csrf-token"]"#)
        .unwrap_or_else(|err| panic!("invalid csrf selector: {err:?}"))
});

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("no session loaded")]
    NotLoaded,
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
}

/// One entry of an exported browser cookie list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl RawCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub base_url: String,
    pub auth_cookie: String,
    pub bot_token_cookies: Vec<String>,
    /// Cookies expected from the bot-protection service. A trailing `*`
    /// matches by prefix.
    pub required_cookies: Vec<String>,
    #[serde(with = "crate::config::millis")]
    pub staleness: Duration,
    #[serde(with = "crate::config::millis")]
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.example.com/".into(),
            auth_cookie: "auth".into(),
            bot_token_cookies: vec!["reese84".into(), "datadome".into()],
            required_cookies: vec!["reese84".into(), "datadome".into()],
            staleness: Duration::from_secs(3600),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthCookie {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub cookie_header: String,
    pub csrf_token: Option<String>,
    pub bearer_token: Option<String>,
    pub bearer_expires_at: Option<DateTime<Utc>>,
    pub last_validated_at: DateTime<Utc>,
    /// Advisory only; consult [`Session::needs_refresh`] before trusting it.
    pub valid: bool,
    pub bot_tokens: HashMap<String, String>,
    pub missing_cookies: Vec<String>,
}

impl Session {
    /// Builds a session from an exported cookie list.
    ///
    /// A missing or unparsable auth cookie only degrades the session; an empty
    /// list is the one hard failure.
    pub fn from_cookies(cookies: &[RawCookie], config: &SessionConfig) -> Result<Self, SessionError> {
        let cookies: Vec<&RawCookie> = cookies.iter().filter(|c| !c.name.is_empty()).collect();
        if cookies.is_empty() {
            return Err(SessionError::MissingCredentials("cookie list is empty".into()));
        }

        let now = Utc::now();
        let cookie_header = cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");

        let (bearer_token, bearer_expires_at) = cookies
            .iter()
            .find(|c| c.name == config.auth_cookie)
            .map(|c| parse_auth_cookie(&c.value, now))
            .unwrap_or((None, None));

        let bot_tokens = config
            .bot_token_cookies
            .iter()
            .filter_map(|name| {
                cookies
                    .iter()
                    .find(|c| &c.name == name)
                    .map(|c| (name.clone(), c.value.clone()))
            })
            .collect();

        let missing_cookies = missing_required(&cookies, &config.required_cookies);

        Ok(Self {
            cookie_header,
            csrf_token: None,
            bearer_token,
            bearer_expires_at,
            last_validated_at: now,
            valid: true,
            bot_tokens,
            missing_cookies,
        })
    }

    pub fn needs_refresh(&self, staleness: Duration) -> bool {
        self.needs_refresh_at(Utc::now(), staleness)
    }

    pub fn needs_refresh_at(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        if let Some(expires_at) = self.bearer_expires_at
            && now > expires_at
        {
            return true;
        }
        let age = now.signed_duration_since(self.last_validated_at);
        age.to_std().map(|age| age > staleness).unwrap_or(false)
    }

    pub fn has_bot_protection(&self) -> bool {
        !self.bot_tokens.is_empty() && self.missing_cookies.is_empty()
    }

    pub fn auth_material(&self) -> AuthMaterial {
        AuthMaterial {
            cookie_header: self.cookie_header.clone(),
            bearer_token: self.bearer_token.clone(),
            csrf_token: self.csrf_token.clone(),
        }
    }
}

fn parse_auth_cookie(raw: &str, now: DateTime<Utc>) -> (Option<String>, Option<DateTime<Utc>>) {
    let decoded = match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(err) => {
            log::warn!("failed to decode auth cookie: {err}");
            return (None, None);
        }
    };
    match serde_json::from_str::<AuthCookie>(&decoded) {
        Ok(auth) => {
            let expires_at = auth.expires_in.filter(|secs| *secs > 0).and_then(|secs| {
                let at = chrono::Duration::try_seconds(secs)
                    .and_then(|ttl| now.checked_add_signed(ttl));
                if at.is_none() {
                    log::warn!("auth cookie expiry out of range: {secs}s");
                }
                at
            });
            (auth.access_token.filter(|t| !t.is_empty()), expires_at)
        }
        Err(err) => {
            log::warn!("failed to parse auth cookie: {err}");
            (None, None)
        }
    }
}

fn missing_required(cookies: &[&RawCookie], required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|pattern| {
            let present = match pattern.strip_suffix('*') {
                Some(prefix) => cookies.iter().any(|c| c.name.starts_with(prefix)),
                None => cookies.iter().any(|c| &c.name == *pattern),
            };
            !present
        })
        .cloned()
        .collect()
}

/// Shared credential store used by every task of a run.
pub struct SessionStore {
    config: SessionConfig,
    base_url: Url,
    transport: Arc<dyn HttpTransport>,
    headers: HeaderProfile,
    session: Mutex<Option<Session>>,
    refresh: Mutex<()>,
}

impl SessionStore {
    pub fn new(config: SessionConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, SessionError> {
        let base_url = Url::parse(&config.base_url)?;
        Ok(Self {
            config,
            base_url,
            transport,
            headers: HeaderProfile::default(),
            session: Mutex::new(None),
            refresh: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Parses `cookies` and installs the result as the current session.
    pub async fn load(&self, cookies: &[RawCookie]) -> Result<Session, SessionError> {
        let session = Session::from_cookies(cookies, &self.config)?;

        if !session.missing_cookies.is_empty() {
            log::warn!(
                "missing bot protection cookies: {}",
                session.missing_cookies.join(", ")
            );
        }
        if session.bearer_token.is_some() {
            log::info!("session loaded with auth token");
        } else {
            log::warn!("session has no auth token, re-login may be required");
        }

        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    /// Parses a JSON cookie export (`[{"name": .., "value": ..}, ..]`).
    pub async fn load_json(&self, text: &str) -> Result<Session, SessionError> {
        let cookies: Vec<RawCookie> = serde_json::from_str(text)
            .map_err(|err| SessionError::MissingCredentials(format!("unparsable cookie list: {err}")))?;
        self.load(&cookies).await
    }

    pub async fn snapshot(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn auth_material(&self) -> Result<AuthMaterial, SessionError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Session::auth_material)
            .ok_or(SessionError::NotLoaded)
    }

    /// True when no session is loaded, the bearer has expired, or the last
    /// validation is older than the staleness threshold.
    pub async fn needs_refresh(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.needs_refresh(self.config.staleness),
            None => true,
        }
    }

    /// Issues one lightweight request and records whether it was accepted.
    pub async fn validate(&self) -> bool {
        let _refresh = self.refresh.lock().await;
        self.validate_now().await
    }

    /// Validates after a request failed with an auth error at `since`.
    ///
    /// When another caller validated after `since`, its result is reused and
    /// no request is sent.
    pub async fn revalidate(&self, since: DateTime<Utc>) -> bool {
        let _refresh = self.refresh.lock().await;
        if let Some(session) = self.session.lock().await.as_ref()
            && session.last_validated_at > since
        {
            log::debug!("session validated since the failure, reusing result");
            return session.valid;
        }
        self.validate_now().await
    }

    async fn validate_now(&self) -> bool {
        let Some(session) = self.snapshot().await else {
            log::warn!("validation skipped: no session loaded");
            return false;
        };

        match self.probe(&session).await {
            Ok(response) => {
                let valid = response.status == 200;
                self.record(&session, |current| {
                    current.valid = valid;
                    current.last_validated_at = Utc::now();
                })
                .await;
                if valid {
                    log::info!("session validated");
                } else {
                    log::warn!("session invalid (HTTP {})", response.status);
                }
                valid
            }
            Err(err) => {
                log::error!("session validation failed: {err}");
                false
            }
        }
    }

    /// Initial request capturing a CSRF token; body, header and cookie are
    /// checked in that order.
    pub async fn warm(&self) -> bool {
        let _refresh = self.refresh.lock().await;
        let Some(session) = self.snapshot().await else {
            log::warn!("warm-up skipped: no session loaded");
            return false;
        };

        match self.probe(&session).await {
            Ok(response) => {
                let csrf = extract_csrf(&response);
                match &csrf {
                    Some((_, source)) => log::info!("captured csrf token from {source}"),
                    None => log::warn!("no csrf token found during warm-up"),
                }
                self.record(&session, |current| {
                    if let Some((token, _)) = csrf {
                        current.csrf_token = Some(token);
                    }
                    current.last_validated_at = Utc::now();
                    current.valid = true;
                })
                .await;
                log::info!("session warmed up");
                true
            }
            Err(err) => {
                log::error!("session warm-up failed: {err}");
                false
            }
        }
    }

    /// Validates only when the session needs a refresh.
    pub async fn ensure_valid(&self) -> bool {
        let cached = {
            let guard = self.session.lock().await;
            match guard.as_ref() {
                Some(session) if !session.needs_refresh(self.config.staleness) => Some(session.valid),
                Some(_) => None,
                None => return false,
            }
        };
        match cached {
            Some(valid) => valid,
            None => self.validate().await,
        }
    }

    /// Applies a probe result unless the session was reloaded meanwhile.
    async fn record(&self, probed: &Session, apply: impl FnOnce(&mut Session)) {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(current) if current.cookie_header == probed.cookie_header => apply(current),
            _ => log::debug!("session reloaded during probe, result dropped"),
        }
    }

    async fn probe(
        &self,
        session: &Session,
    ) -> Result<TransportResponse, TransportError> {
        let headers = self
            .headers
            .build(RequestClass::Page, &session.auth_material())
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let request = TransportRequest::new(Method::GET, self.base_url.clone(), self.config.timeout)
            .with_headers(headers);
        self.transport.execute(request).await
    }
}

fn extract_csrf(response: &TransportResponse) -> Option<(String, &'static str)> {
    let body = String::from_utf8_lossy(&response.body);
    if body.to_ascii_lowercase().contains("csrf")
        && let Some(token) = csrf_from_html(&body)
    {
        return Some((token, "body"));
    }

    if let Some(token) = response
        .headers
        .get("x-csrf-token")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return Some((token.to_string(), "header"));
    }

    response
        .headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, value)| name.trim().to_ascii_lowercase().contains("csrf") && !value.is_empty())
        .map(|(_, value)| (value.trim().to_string(), "cookie"))
}

fn csrf_from_html(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    document
        .select(&CSRF_META)
        .filter_map(|element| element.value().attr("content"))
        .find(|content| !content.is_empty())
        .map(str::to_string)
}
