//! Storefront collaborators.
//!
//! Endpoint discovery and site-specific JSON parsing live behind these
//! traits. The engine only sees a stock flag, a cart outcome and a checkout
//! outcome; CAPTCHA demands come back as explicit variants.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::engine::Profile;
use crate::request::{RequestClient, RequestError, RequestOutcome, Response};

#[derive(Debug, Error)]
pub enum CommerceError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl CommerceError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, CommerceError::Request(err) if err.is_session_expired())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockStatus {
    pub in_stock: bool,
    pub status_text: String,
}

impl StockStatus {
    pub fn in_stock(text: impl Into<String>) -> Self {
        Self {
            in_stock: true,
            status_text: text.into(),
        }
    }

    pub fn out_of_stock(text: impl Into<String>) -> Self {
        Self {
            in_stock: false,
            status_text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOutcome {
    Added,
    CaptchaRequired { url: Option<Url> },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    Confirmed(String),
    CaptchaRequired { step: String, url: Option<Url> },
    Failed { step: String, reason: String },
}

#[async_trait]
pub trait StockChecker: Send + Sync {
    async fn check(&self, client: &RequestClient, product_id: &str) -> Result<StockStatus, CommerceError>;
}

#[async_trait]
pub trait CartClient: Send + Sync {
    async fn add(
        &self,
        client: &RequestClient,
        product_id: &str,
        variant: &str,
    ) -> Result<CartOutcome, CommerceError>;
}

#[async_trait]
pub trait CheckoutClient: Send + Sync {
    /// Runs the checkout flow. With `skip_init` the session initialisation
    /// step is skipped, used when resuming after a CAPTCHA.
    async fn run(
        &self,
        client: &RequestClient,
        profile: &Profile,
        skip_init: bool,
    ) -> Result<CheckoutOutcome, CommerceError>;
}

/// Where the user should go to clear a challenge: a `url`/`captcha_url`/
/// `redirect` field of a JSON body, else the URL that produced it.
pub fn captcha_url(response: &Response) -> Option<Url> {
    let from_body = response.json::<Value>().ok().and_then(|body| {
        ["url", "captcha_url", "redirect"]
            .iter()
            .filter_map(|key| body.get(*key).and_then(Value::as_str))
            .find_map(|raw| response.url().join(raw).ok())
    });
    from_body.or_else(|| Some(response.url().clone()))
}

/// Shorthand for collaborators: a challenge becomes `CaptchaRequired`,
/// anything else is handed to `on_response`.
pub fn cart_outcome<F>(outcome: RequestOutcome, on_response: F) -> Result<CartOutcome, CommerceError>
where
    F: FnOnce(Response) -> Result<CartOutcome, CommerceError>,
{
    match outcome {
        RequestOutcome::Challenge { response, .. } => Ok(CartOutcome::CaptchaRequired {
            url: captcha_url(&response),
        }),
        RequestOutcome::Completed(response) => on_response(response),
    }
}

/// Checks a JSON body for an `error` flag and returns its `message`.
pub fn json_error(body: &Value) -> Option<String> {
    let flagged = match body.get("error") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    };
    flagged.then(|| {
        body.get("message")
            .and_then(Value::as_str)
            .or_else(|| body.get("error").and_then(Value::as_str))
            .unwrap_or("Unknown error")
            .to_string()
    })
}
