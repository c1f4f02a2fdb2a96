//! HTTP transport seam for package downloads.
//!
//! The downloader only needs "GET this URL starting at byte N" and a stream
//! of body chunks, so the transport is a one-method trait. [`ReqwestTransport`]
//! is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::UpdateError;

/// Response head plus streaming body.
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Body length announced by the server, if any
    pub content_length: Option<u64>,
    /// Body chunks
    pub body: BoxStream<'static, Result<Bytes, UpdateError>>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Opens ranged GET requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Request `url`, asking for bytes from `range_start` onwards when it is
    /// non-zero. Non-2xx statuses are returned as responses, not errors.
    async fn open(&self, url: &str, range_start: u64) -> Result<TransportResponse, UpdateError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with the configured timeouts, user agent and proxy.
    pub fn new(config: &NetworkConfig) -> Result<Self, UpdateError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .read_timeout(Duration::from_secs(config.read_timeout_seconds))
            .user_agent(&config.user_agent);

        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| UpdateError::ConfigError(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn open(&self, url: &str, range_start: u64) -> Result<TransportResponse, UpdateError> {
        let mut request = self.client.get(url);
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={}-", range_start));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        debug!(url, status, ?content_length, range_start, "Transport response");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpdateError::Network(e.to_string())))
            .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}
