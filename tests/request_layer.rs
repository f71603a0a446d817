mod common;

use std::time::Duration;

use common::*;
use porter_rs::request::ChallengeKind;
use porter_rs::{RequestClass, RequestError, RequestOutcome, TransportError};
use serde::Deserialize;
use url::Url;

fn endpoint() -> Url {
    Url::parse("https://www.example.com/api/products/SKU-1").unwrap()
}

#[derive(Debug, Deserialize)]
struct Availability {
    #[serde(rename = "inStock")]
    in_stock: bool,
}

#[tokio::test(start_paused = true)]
async fn rate_limited_three_times_then_succeeds() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push(429, "");
    }
    transport.push(200, r#"{"inStock": true}"#);
    let client = request_client(transport.clone()).await;

    let outcome = client.get(endpoint(), RequestClass::Api).await.unwrap();

    let RequestOutcome::Completed(response) = outcome else {
        panic!("expected a completed response");
    };
    assert!(response.json::<Availability>().unwrap().in_stock);
    assert_eq!(transport.request_count(), 4);
    let gaps = transport.gaps();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.windows(2).all(|pair| pair[0] < pair[1]), "{gaps:?}");
}

#[tokio::test(start_paused = true)]
async fn unauthorized_first_attempt_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.push(403, "<html>Forbidden</html>");
    let client = request_client(transport.clone()).await;

    let err = client.get(endpoint(), RequestClass::Api).await.unwrap_err();
    assert!(err.is_session_expired());
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_after_a_retry_is_transient() {
    let transport = ScriptedTransport::new();
    transport.push(503, "");
    transport.push(401, "");
    transport.push(200, "{}");
    let client = request_client(transport.clone()).await;

    let outcome = client.get(endpoint(), RequestClass::Api).await.unwrap();
    assert_eq!(outcome.response().attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn transport_errors_exhaust_into_last_error() {
    let transport = ScriptedTransport::new();
    transport.push_error(TransportError::Connect("refused".into()));
    transport.push_error(TransportError::Connect("refused".into()));
    transport.push_error(TransportError::Connect("refused".into()));
    transport.push_error(TransportError::Timeout);
    let client = request_client(transport.clone()).await;

    let err = client.get(endpoint(), RequestClass::Api).await.unwrap_err();
    assert!(matches!(err, RequestError::Transport(TransportError::Timeout)));
    assert_eq!(transport.gaps(), vec![Duration::from_secs(1); 3]);
}

#[tokio::test(start_paused = true)]
async fn captcha_json_is_surfaced_as_challenge() {
    let transport = ScriptedTransport::new();
    transport.push(200, r#"{"captcha": {"provider": "datadome"}}"#);
    let client = request_client(transport.clone()).await;

    let outcome = client.get(endpoint(), RequestClass::Api).await.unwrap();
    assert_eq!(outcome.challenge().map(|c| c.kind), Some(ChallengeKind::JsonMarker));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn credentials_ride_on_every_request() {
    let transport = ScriptedTransport::new();
    let client = request_client(transport.clone()).await;

    client
        .post_json(endpoint(), RequestClass::Checkout, &serde_json::json!({"quantity": 1}))
        .await
        .unwrap();

    let sent = transport.requests().pop().unwrap();
    assert_eq!(sent.headers["authorization"], "Bearer jwt-abc");
    assert!(sent.headers["cookie"].to_str().unwrap().contains("reese84=r84"));
    assert_eq!(sent.headers["cache-control"], "no-cache");
    assert_eq!(sent.body.as_deref(), Some(&br#"{"quantity":1}"#[..]));
    assert_eq!(sent.timeout, Duration::from_secs(30));
}
