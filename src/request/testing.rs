//! Scripted transport used by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use http::HeaderMap;
use tokio::time::Instant;

use super::transport::{HttpTransport, TransportError, TransportRequest, TransportResponse};

type Scripted = Result<(u16, HeaderMap, String), TransportError>;

/// Replays queued responses in order; answers `200` once the script runs dry.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<(Instant, TransportRequest)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_status(&self, status: u16) {
        self.push_response(status, HeaderMap::new(), "");
    }

    pub(crate) fn push_response(&self, status: u16, headers: HeaderMap, body: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok((status, headers, body.to_string())));
    }

    pub(crate) fn push_timeout(&self) {
        self.script.lock().unwrap().push_back(Err(TransportError::Timeout));
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn request_times(&self) -> Vec<Instant> {
        self.seen.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = request.url.clone();
        self.seen.lock().unwrap().push((Instant::now(), request));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok((status, headers, body))) => Ok(TransportResponse::new(status, url)
                .with_headers(headers)
                .with_body(body)),
            Some(Err(err)) => Err(err),
            None => Ok(TransportResponse::new(200, url)),
        }
    }
}
