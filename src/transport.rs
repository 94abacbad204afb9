//! HTTP transport backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use crate::config::{HttpConfig, DEFAULT_USER_AGENT};
use crate::error::TransportError;
use crate::sync::{Transport, TransportResponse};

/// Shared HTTP client. Non-2xx responses are returned, not treated as errors.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        Self::build(
            Duration::from_secs(config.timeout_seconds),
            config.user_agent(),
        )
    }

    /// Client with the default user agent and the given timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        Self::build(timeout, DEFAULT_USER_AGENT)
    }

    fn build(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(name = "sync.transport.get", skip(self), fields(status, duration_ms))]
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let start = std::time::Instant::now();

        let response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify)?;

        let span = tracing::Span::current();
        span.record("status", status.as_u16());
        span.record("duration_ms", start.elapsed().as_millis() as u64);

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}
