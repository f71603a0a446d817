//! Reqwest-based implementation of the [`HttpTransport`] trait.
//!
//! Keeps one pooled `reqwest::Client` per proxy endpoint so that every task
//! handle routed through the same proxy reuses the same connections.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;

use super::transport::{HttpTransport, TransportError, TransportRequest, TransportResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 20;

/// Reqwest-backed transport shared by every task of a run.
pub struct ReqwestTransport {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<Client, TransportError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .cookie_store(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransportError::Other(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    /// Number of distinct pooled clients (one per proxy, plus direct).
    pub async fn pooled_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client(request.proxy.as_deref()).await?;

        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(request.timeout);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(map_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
