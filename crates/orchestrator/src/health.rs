//! HTTP health checking of the reverse proxy.

use std::time::Duration;
use tracing::trace;

/// Per-request timeout for health probes
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks a health endpoint that answers 200 with a fixed body when ready
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: String,
    expected_body: Option<String>,
}

impl HttpHealthCheck {
    pub fn new(client: reqwest::Client, url: impl Into<String>, expected_body: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            expected_body,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One probe; any transport error counts as unhealthy
    pub async fn check(&self) -> bool {
        let response = match self
            .client
            .get(&self.url)
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                trace!(url = %self.url, error = %e, "Health request failed");
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            trace!(url = %self.url, status = %response.status(), "Health endpoint not ready");
            return false;
        }

        let Some(ref expected) = self.expected_body else {
            return true;
        };
        match response.text().await {
            Ok(body) => {
                let ok = body.trim() == expected.trim();
                if !ok {
                    trace!(url = %self.url, body = %body.trim(), "Unexpected health body");
                }
                ok
            }
            Err(_) => false,
        }
    }
}
