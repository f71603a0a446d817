//! Interactive CAPTCHA resolution.
//!
//! The engine does not solve challenges itself. It asks an
//! [`InteractiveSolver`] for a clearance credential and bounds the wait with
//! [`InteractiveSolver::solve_within`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use url::Url;

/// Hands a challenge to a human (or a browser) and returns the clearance
/// credential, or `None` when the attempt failed.
#[async_trait]
pub trait InteractiveSolver: Send + Sync {
    async fn solve(&self, url: Option<&Url>) -> Option<String>;

    /// [`solve`](Self::solve), giving up after `timeout`. Solvers that queue
    /// callers start the clock when the caller's turn comes.
    async fn solve_within(&self, url: Option<&Url>, timeout: Duration) -> Option<String> {
        match tokio::time::timeout(timeout, self.solve(url)).await {
            Ok(token) => token,
            Err(_) => {
                log::error!("CAPTCHA not solved within {}s", timeout.as_secs());
                None
            }
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Asks the operator to clear the challenge in a browser and paste the
/// clearance cookie value on a line of input.
///
/// One prompt is shown at a time. Time spent waiting behind another task's
/// prompt does not count against the timeout.
pub struct PromptSolver {
    input: Mutex<BufReader<BoxedReader>>,
    timeout: Duration,
}

impl PromptSolver {
    /// Reads from stdin.
    pub fn new(timeout: Duration) -> Self {
        Self::with_reader(tokio::io::stdin(), timeout)
    }

    pub fn with_reader<R>(reader: R, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            input: Mutex::new(BufReader::new(Box::new(reader) as BoxedReader)),
            timeout,
        }
    }
}

#[async_trait]
impl InteractiveSolver for PromptSolver {
    async fn solve(&self, url: Option<&Url>) -> Option<String> {
        self.solve_within(url, self.timeout).await
    }

    async fn solve_within(&self, url: Option<&Url>, timeout: Duration) -> Option<String> {
        let mut input = self.input.lock().await;
        match url {
            Some(url) => log::warn!("CAPTCHA required, solve it at {url} and paste the clearance token"),
            None => log::warn!("CAPTCHA required, paste the clearance token"),
        }

        let mut line = String::new();
        match tokio::time::timeout(timeout, input.read_line(&mut line)).await {
            Ok(Ok(0)) => {
                log::error!("CAPTCHA input closed");
                None
            }
            Ok(Ok(_)) => {
                let token = line.trim();
                if token.is_empty() {
                    log::warn!("empty CAPTCHA token");
                    None
                } else {
                    log::info!("CAPTCHA solved");
                    Some(token.to_string())
                }
            }
            Ok(Err(err)) => {
                log::error!("failed to read CAPTCHA token: {err}");
                None
            }
            Err(_) => {
                log::error!("CAPTCHA not solved within {}s", timeout.as_secs());
                None
            }
        }
    }
}
