//! Outcome notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::json;
use url::Url;

use crate::request::transport::{HttpTransport, TransportRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    StockFound,
    OrderPlaced,
    CaptchaNeeded,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Warning,
    Error,
    Info,
}

impl Level {
    pub fn color(self) -> u32 {
        match self {
            Level::Success => 0x00FF00,
            Level::Warning => 0xFFAA00,
            Level::Error => 0xFF0000,
            Level::Info => 0x0099FF,
        }
    }
}

impl NotificationKind {
    pub fn level(self) -> Level {
        match self {
            NotificationKind::StockFound | NotificationKind::OrderPlaced => Level::Success,
            NotificationKind::CaptchaNeeded => Level::Warning,
            NotificationKind::Error => Level::Error,
        }
    }

    /// Markdown body for `payload`.
    pub fn render(self, payload: &str) -> String {
        match self {
            NotificationKind::StockFound => format!("**STOCK**\n`{payload}`"),
            NotificationKind::OrderPlaced => format!("**ORDER**\nConfirmation: `{payload}`"),
            NotificationKind::CaptchaNeeded => format!("**CAPTCHA**\n{payload}"),
            NotificationKind::Error => format!("**ERROR**\n{payload}"),
        }
    }
}

/// Fire-and-forget outcome sink. Failures are reported as `false`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, payload: &str) -> bool;
}

/// Logs notifications instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, payload: &str) -> bool {
        log::info!("notify {kind:?}: {payload}");
        true
    }
}

/// Posts Discord-style embeds to a webhook.
pub struct WebhookNotifier {
    webhook: Url,
    title: String,
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(webhook: Url, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            webhook,
            title: "Porter".into(),
            transport,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(&self, kind: NotificationKind, payload: &str) -> serde_json::Value {
        json!({
            "embeds": [{
                "title": self.title,
                "description": kind.render(payload),
                "color": kind.level().color(),
            }]
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, kind: NotificationKind, payload: &str) -> bool {
        let body = match serde_json::to_vec(&self.payload(kind, payload)) {
            Ok(body) => body,
            Err(err) => {
                log::error!("webhook payload failed: {err}");
                return false;
            }
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let request = TransportRequest::new(Method::POST, self.webhook.clone(), self.timeout)
            .with_headers(headers)
            .with_body(Some(Bytes::from(body)));

        match self.transport.execute(request).await {
            Ok(response) if (200..300).contains(&response.status) => true,
            Ok(response) => {
                log::warn!("webhook rejected notification (HTTP {})", response.status);
                false
            }
            Err(err) => {
                log::error!("webhook failed: {err}");
                false
            }
        }
    }
}
