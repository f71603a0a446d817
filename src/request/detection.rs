//! CAPTCHA / anti-bot challenge detection.
//!
//! A response is flagged when any one of three independent signals fires:
//! an HTTP 429, a JSON body carrying a truthy `captcha`/`challenge` field, or
//! an HTML body mentioning a challenge while a bot-protection header is set.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::transport::TransportResponse;

/// Response headers set by common bot-protection services.
pub const BOT_PROTECTION_HEADERS: &[&str] = &["cf-ray", "x-datadome", "x-iinfo", "x-kpsdk-ct"];

const JSON_MARKERS: &[&str] = &["captcha", "challenge"];

static HTML_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"challenge|captcha")
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid challenge marker regex: {err}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    RateLimited,
    JsonMarker,
    HtmlChallenge,
}

/// Detection output attached to a flagged response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDetection {
    pub kind: ChallengeKind,
    pub status: u16,
    pub indicator: String,
}

/// Runs every detector against the response, returning the first hit.
pub fn detect(response: &TransportResponse) -> Option<ChallengeDetection> {
    if response.status == 429 {
        return Some(ChallengeDetection {
            kind: ChallengeKind::RateLimited,
            status: response.status,
            indicator: "status 429".into(),
        });
    }

    if let Some(marker) = json_marker(&response.body) {
        return Some(ChallengeDetection {
            kind: ChallengeKind::JsonMarker,
            status: response.status,
            indicator: format!("json field '{marker}'"),
        });
    }

    if let Some(header) = bot_protection_header(response) {
        let body = String::from_utf8_lossy(&response.body);
        if HTML_MARKER_RE.is_match(&body) {
            return Some(ChallengeDetection {
                kind: ChallengeKind::HtmlChallenge,
                status: response.status,
                indicator: format!("html marker with header '{header}'"),
            });
        }
    }

    None
}

pub fn is_challenge(response: &TransportResponse) -> bool {
    detect(response).is_some()
}

fn json_marker(body: &[u8]) -> Option<&'static str> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    JSON_MARKERS
        .iter()
        .copied()
        .find(|marker| object.get(*marker).is_some_and(is_truthy))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn bot_protection_header(response: &TransportResponse) -> Option<&'static str> {
    BOT_PROTECTION_HEADERS
        .iter()
        .copied()
        .find(|name| response.headers.contains_key(*name))
}
