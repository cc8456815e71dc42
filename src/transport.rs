//! Network access used by the loader.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// The request produced no HTTP response at all (DNS, connect, TLS, reset, timeout).
#[derive(Debug, Error)]
#[error("Transport failure for {url}: {message}")]
pub struct TransportError {
    pub url: String,
    pub message: String,
    pub timed_out: bool,
}

impl TransportError {
    pub fn new(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        Self {
            url: url.to_string(),
            timed_out: error.is_timeout(),
            message: error.to_string(),
        }
    }
}

/// Raw response handed back by a [`Transport`]. Status checking is the
/// caller's job.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`. Returns `Err` only when no response was received.
    async fn fetch(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))?;

        trace!(url, status, bytes = body.len(), "fetched");
        Ok(TransportResponse { status, body })
    }
}
