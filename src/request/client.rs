//! Per-task request handle.

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use super::detection::{ChallengeDetection, detect};
use super::headers::{AuthMaterial, HeaderProfile, RequestClass};
use super::transport::{HttpTransport, TransportRequest, TransportResponse};
use super::{RequestConfig, RequestError};
use crate::modules::proxy::{ProxyPool, mask_address};
use crate::modules::session::SessionStore;
use crate::modules::timing::RateLimiter;

/// Response handed back to collaborators.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    attempts: u32,
}

impl Response {
    fn from_transport(response: TransportResponse, attempts: u32) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            url: response.url,
            attempts,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Number of attempts it took to obtain this response.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            RequestError::Validation(format!("malformed JSON (HTTP {}): {err}", self.status))
        })
    }
}

impl From<TransportResponse> for Response {
    fn from(response: TransportResponse) -> Self {
        Self::from_transport(response, 1)
    }
}

/// Result of a request that produced an HTTP response.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Completed(Response),
    Challenge {
        detection: ChallengeDetection,
        response: Response,
    },
}

impl RequestOutcome {
    pub fn response(&self) -> &Response {
        match self {
            RequestOutcome::Completed(response) => response,
            RequestOutcome::Challenge { response, .. } => response,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            RequestOutcome::Completed(response) => response,
            RequestOutcome::Challenge { response, .. } => response,
        }
    }

    pub fn is_challenge(&self) -> bool {
        matches!(self, RequestOutcome::Challenge { .. })
    }

    pub fn challenge(&self) -> Option<&ChallengeDetection> {
        match self {
            RequestOutcome::Challenge { detection, .. } => Some(detection),
            RequestOutcome::Completed(_) => None,
        }
    }
}

/// Request handle owned by one task.
///
/// Shares the transport, session store and proxy pool with every other task
/// of the run; the header profile and clearance cookie are its own.
pub struct RequestClient {
    task_id: String,
    transport: Arc<dyn HttpTransport>,
    session: Arc<SessionStore>,
    pool: Option<Arc<ProxyPool>>,
    proxy_group: Option<String>,
    proxy: Mutex<Option<String>>,
    config: RequestConfig,
    headers: HeaderProfile,
    clearance: Mutex<Option<String>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl RequestClient {
    pub fn new(
        task_id: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        session: Arc<SessionStore>,
        config: RequestConfig,
    ) -> Self {
        let headers = HeaderProfile::new(config.headers.clone());
        Self {
            task_id: task_id.into(),
            transport,
            session,
            pool: None,
            proxy_group: None,
            proxy: Mutex::new(None),
            config,
            headers,
            clearance: Mutex::new(None),
            rate_limiter: None,
        }
    }

    /// Routes requests through a sticky proxy from `group`.
    ///
    /// The lease is checked before every attempt, so a proxy that turns
    /// unhealthy is swapped for another one from the same group.
    pub fn with_proxy(mut self, pool: Arc<ProxyPool>, group: impl Into<String>) -> Self {
        let group = group.into();
        let address = pool.acquire_sticky(&self.task_id, &group);
        *self.proxy.get_mut().unwrap_or_else(|p| p.into_inner()) = address;
        self.pool = Some(pool);
        self.proxy_group = Some(group);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Proxy the last request went through, or will go through next.
    pub fn proxy(&self) -> Option<String> {
        self.proxy.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Resolves `path` against the session's base URL.
    pub fn url(&self, path: &str) -> Result<Url, RequestError> {
        Ok(self.session.base_url().join(path)?)
    }

    pub fn user_agent(&self) -> Option<String> {
        self.headers.user_agent()
    }

    pub fn rotate_user_agent(&self) -> Option<String> {
        let agent = self.headers.rotate_user_agent();
        log::debug!("[{}] rotated user agent", self.task_id);
        agent
    }

    /// Stores a clearance credential obtained from an interactive solve. It is
    /// sent as an extra cookie on every later request from this handle.
    pub fn set_clearance(&self, token: impl Into<String>) {
        *self.clearance.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.into());
    }

    pub fn clearance(&self) -> Option<String> {
        self.clearance.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn get(&self, url: Url, class: RequestClass) -> Result<RequestOutcome, RequestError> {
        self.request(Method::GET, url, class, None).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: Url,
        class: RequestClass,
        payload: &T,
    ) -> Result<RequestOutcome, RequestError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| RequestError::Validation(format!("unserialisable payload: {err}")))?;
        self.request(Method::POST, url, class, Some(Bytes::from(body)))
            .await
    }

    /// Sends one logical request, retrying transient failures.
    ///
    /// * 429: backs off `backoff_base^(attempt + 1)` units.
    /// * 5xx: backs off `backoff_base^attempt` units.
    /// * transport errors: waits `transport_retry_delay`.
    /// * 401/403: `SessionExpired` on the first attempt, retried afterwards.
    ///
    /// Challenge responses are returned without retry. Once attempts run out
    /// the last error is returned.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        class: RequestClass,
        body: Option<Bytes>,
    ) -> Result<RequestOutcome, RequestError> {
        let max_attempts = self.config.max_attempts();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let headers = self.headers.build(class, &self.auth_material().await?)?;
            let proxy = self.resolve_proxy();
            let request = TransportRequest::new(method.clone(), url.clone(), self.config.timeout)
                .with_headers(headers)
                .with_body(body.clone())
                .with_proxy(proxy.clone());

            log::debug!(
                "[{}] {} {} (attempt {}/{})",
                self.task_id,
                method,
                url.path(),
                attempt + 1,
                max_attempts
            );

            let response = match self.transport.execute(request).await {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("[{}] transport error: {err}", self.task_id);
                    self.report_proxy(proxy.as_deref(), false);
                    last_error = Some(RequestError::Transport(err));
                    self.pause(self.config.transport_retry_delay, attempt, max_attempts)
                        .await;
                    continue;
                }
            };

            let status = response.status;
            if status == 429 {
                let wait = self.config.backoff(attempt + 1);
                log::warn!(
                    "[{}] rate limited, backing off {:.1}s",
                    self.task_id,
                    wait.as_secs_f64()
                );
                last_error = Some(RequestError::Status {
                    status,
                    attempts: attempt + 1,
                });
                self.pause(wait, attempt, max_attempts).await;
                continue;
            }

            if let Some(detection) = detect(&response) {
                log::warn!(
                    "[{}] challenge detected on {}: {}",
                    self.task_id,
                    url.path(),
                    detection.indicator
                );
                return Ok(RequestOutcome::Challenge {
                    detection,
                    response: Response::from_transport(response, attempt + 1),
                });
            }

            if status == 401 || status == 403 {
                if attempt == 0 {
                    log::warn!("[{}] session expired (HTTP {status})", self.task_id);
                    return Err(RequestError::SessionExpired { status });
                }
                last_error = Some(RequestError::Status {
                    status,
                    attempts: attempt + 1,
                });
                self.pause(self.config.auth_retry_delay, attempt, max_attempts)
                    .await;
                continue;
            }

            if status >= 500 {
                let wait = self.config.backoff(attempt);
                log::warn!(
                    "[{}] server error {status}, retrying in {:.1}s",
                    self.task_id,
                    wait.as_secs_f64()
                );
                last_error = Some(RequestError::Status {
                    status,
                    attempts: attempt + 1,
                });
                self.pause(wait, attempt, max_attempts).await;
                continue;
            }

            self.report_proxy(proxy.as_deref(), true);
            return Ok(RequestOutcome::Completed(Response::from_transport(
                response,
                attempt + 1,
            )));
        }

        Err(last_error.unwrap_or(RequestError::Status {
            status: 0,
            attempts: max_attempts,
        }))
    }

    async fn auth_material(&self) -> Result<AuthMaterial, RequestError> {
        let mut material = self.session.auth_material().await?;
        if let Some(token) = self.clearance() {
            let cookie = format!("{}={}", self.config.clearance_cookie, token);
            if material.cookie_header.is_empty() {
                material.cookie_header = cookie;
            } else {
                material.cookie_header = format!("{}; {}", material.cookie_header, cookie);
            }
        }
        Ok(material)
    }

    /// Sleeps before the next attempt; skipped after the final one.
    async fn pause(&self, wait: Duration, attempt: u32, max_attempts: u32) {
        if attempt + 1 < max_attempts {
            tokio::time::sleep(wait).await;
        }
    }

    /// Re-checks the sticky lease and records the address in use.
    fn resolve_proxy(&self) -> Option<String> {
        let (Some(pool), Some(group)) = (&self.pool, &self.proxy_group) else {
            return None;
        };
        let next = pool.acquire_sticky(&self.task_id, group);
        let mut current = self.proxy.lock().unwrap_or_else(|p| p.into_inner());
        if *current != next {
            match &next {
                Some(address) => log::info!(
                    "[{}] switched to proxy {}",
                    self.task_id,
                    mask_address(address)
                ),
                None => log::warn!(
                    "[{}] no healthy proxy left in '{group}', going direct",
                    self.task_id
                ),
            }
            *current = next.clone();
        }
        next
    }

    fn report_proxy(&self, address: Option<&str>, ok: bool) {
        let (Some(pool), Some(address)) = (&self.pool, address) else {
            return;
        };
        if ok {
            pool.report_success(address);
        } else {
            log::debug!("[{}] proxy failure on {}", self.task_id, mask_address(address));
            pool.report_failure(address);
        }
    }
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("task_id", &self.task_id)
            .field("proxy", &self.proxy().as_deref().map(mask_address))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::{ProxyConfig, ProxyKind};
    use crate::modules::session::{RawCookie, SessionConfig};
    use crate::request::testing::ScriptedTransport;
    use http::HeaderValue;

    async fn client(transport: Arc<ScriptedTransport>) -> RequestClient {
        let store = SessionStore::new(SessionConfig::default(), transport.clone()).unwrap();
        store
            .load(&[RawCookie::new("sid", "abc"), RawCookie::new("reese84", "r")])
            .await
            .unwrap();
        RequestClient::new("t1", transport, Arc::new(store), RequestConfig::default())
    }

    fn api() -> Url {
        Url::parse("https://www.example.com/api/stock").unwrap()
    }

    fn gaps(transport: &ScriptedTransport) -> Vec<Duration> {
        transport
            .request_times()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_backs_off_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.push_status(429);
        }
        transport.push_response(200, HeaderMap::new(), r#"{"ok": true}"#);
        let client = client(transport.clone()).await;

        let outcome = client.get(api(), RequestClass::Api).await.unwrap();
        assert!(!outcome.is_challenge());
        assert_eq!(outcome.response().attempts(), 4);
        assert_eq!(transport.requests().len(), 4);
        assert_eq!(
            gaps(&transport),
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_surfaces_last_error() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..4 {
            transport.push_status(429);
        }
        let client = client(transport.clone()).await;
        let err = client.get(api(), RequestClass::Api).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_back_off_from_one_unit() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(502);
        transport.push_status(503);
        transport.push_status(200);
        let client = client(transport.clone()).await;
        client.get(api(), RequestClass::Api).await.unwrap();
        assert_eq!(
            gaps(&transport),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_unauthorized_is_session_expired() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(401);
        let client = client(transport.clone()).await;
        let err = client.get(api(), RequestClass::Api).await.unwrap_err();
        assert!(matches!(err, RequestError::SessionExpired { status: 401 }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_forbidden_is_retried_until_exhausted() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_timeout();
        for _ in 0..3 {
            transport.push_status(403);
        }
        let client = client(transport.clone()).await;
        let err = client.get(api(), RequestClass::Api).await.unwrap_err();
        assert!(matches!(err, RequestError::Status { status: 403, attempts: 4 }));
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_body_is_returned_as_challenge() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(200, HeaderMap::new(), r#"{"captcha": true, "url": "https://c"}"#);
        let client = client(transport.clone()).await;
        let outcome = client.get(api(), RequestClass::Api).await.unwrap();
        assert!(outcome.is_challenge());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_html_with_protection_header_is_challenge_not_expiry() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut headers = HeaderMap::new();
        headers.insert("x-datadome", HeaderValue::from_static("protected"));
        transport.push_response(403, headers, "<html>captcha-delivery</html>");
        let client = client(transport).await;
        let outcome = client.get(api(), RequestClass::Page).await.unwrap();
        assert_eq!(outcome.challenge().unwrap().status, 403);
    }

    #[tokio::test(start_paused = true)]
    async fn other_client_errors_are_returned_untouched() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(404, HeaderMap::new(), "not json");
        let client = client(transport.clone()).await;
        let response = client
            .get(api(), RequestClass::Api)
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), 404);
        assert!(matches!(
            response.json::<serde_json::Value>(),
            Err(RequestError::Validation(_))
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clearance_cookie_is_appended() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(transport.clone()).await;
        client.set_clearance("solved");
        client.get(api(), RequestClass::Api).await.unwrap();
        let sent = transport.requests().pop().unwrap();
        assert_eq!(sent.headers["cookie"], "sid=abc; reese84=r; cf_clearance=solved");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_count_against_proxy() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..4 {
            transport.push_timeout();
        }
        let pool = Arc::new(ProxyPool::new(ProxyConfig::default()));
        pool.create_group("res", ProxyKind::Residential);
        pool.load(["10.0.0.1:8080"], "res");

        let client = client(transport.clone())
            .await
            .with_proxy(pool.clone(), "res");
        let err = client.get(api(), RequestClass::Api).await.unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
        assert_eq!(
            transport.requests()[0].proxy.as_deref(),
            Some("10.0.0.1:8080")
        );
        assert!(!pool.proxy("10.0.0.1:8080").unwrap().healthy);
        // the only proxy is gone, the last attempt goes direct
        assert_eq!(transport.requests()[3].proxy, None);
        assert_eq!(client.proxy(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_sticky_proxy_is_replaced_on_next_request() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.push_timeout();
        }
        let pool = Arc::new(ProxyPool::new(ProxyConfig::default()));
        pool.load(["10.0.0.1:8080"], "res");

        let client = client(transport.clone())
            .await
            .with_proxy(pool.clone(), "res");
        assert_eq!(client.proxy().as_deref(), Some("10.0.0.1:8080"));

        pool.load(["10.0.0.2:8080"], "res");
        let outcome = client.get(api(), RequestClass::Api).await.unwrap();
        assert!(!outcome.is_challenge());

        let via: Vec<_> = transport
            .requests()
            .into_iter()
            .map(|request| request.proxy)
            .collect();
        assert_eq!(
            via,
            vec![
                Some("10.0.0.1:8080".to_string()),
                Some("10.0.0.1:8080".to_string()),
                Some("10.0.0.1:8080".to_string()),
                Some("10.0.0.2:8080".to_string()),
            ]
        );
        assert_eq!(client.proxy().as_deref(), Some("10.0.0.2:8080"));
        assert_eq!(pool.leased_by("t1").as_deref(), Some("10.0.0.2:8080"));
        assert_eq!(pool.stats()["res"].leased, 1);
    }

    #[tokio::test]
    async fn user_agent_rotation_is_per_handle() {
        let transport = Arc::new(ScriptedTransport::new());
        let a = client(transport.clone()).await;
        let b = client(transport).await;
        let before = b.user_agent();
        a.rotate_user_agent();
        assert_ne!(a.user_agent(), before);
        assert_eq!(b.user_agent(), before);
    }

    #[tokio::test]
    async fn missing_session_is_an_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SessionStore::new(SessionConfig::default(), transport.clone()).unwrap();
        let client = RequestClient::new("t1", transport, Arc::new(store), RequestConfig::default());
        assert!(matches!(
            client.get(api(), RequestClass::Api).await,
            Err(RequestError::Session(_))
        ));
    }
}
