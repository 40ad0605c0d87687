//! Upstream HTTP clients.
//!
//! An [`Adapter`] sends one canonical request to one upstream and returns
//! either a canonical response or the raw streaming body. [`AdapterFactory`]
//! builds the right adapter for an [`UpstreamConfig`].

pub mod anthropic;
pub mod factory;
pub mod gemini;
pub mod kiro;
pub mod openai;
pub mod pooled;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::time::Duration;

use crate::core::error::{AppError, Result};
use crate::protocol::{CanonicalRequest, CanonicalResponse};

pub use factory::AdapterFactory;

/// Streaming upstream body. Dropping it closes the upstream connection.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short label used in logs (`openai`, `kiro`, ...).
    fn name(&self) -> &str;

    async fn call(&self, request: &CanonicalRequest) -> Result<CanonicalResponse>;

    /// Open a streaming call. The returned bytes are relayed to the client as is.
    async fn call_stream(&self, request: &CanonicalRequest) -> Result<ByteStream>;
}

/// Deadline for adapters built without an explicit one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared upstream client. `verify_ssl = false` accepts self-signed certificates.
///
/// Only connecting is bounded here. Adapters put a total deadline on buffered
/// calls and an idle deadline on streamed bodies, so a long but live SSE
/// response is never cut off.
pub fn build_http_client(connect_timeout_secs: u64, verify_ssl: bool) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .danger_accept_invalid_certs(!verify_ssl)
        .pool_max_idle_per_host(20)
        .build()?;
    Ok(client)
}

/// Pass 2xx responses through; turn anything else into
/// `API returned status N: body`.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("failed to read body: {}", e));
    tracing::error!(status = %status, body = %body, "Upstream returned error status");
    Err(AppError::ApiCallFailed(format!(
        "API returned status {}: {}",
        status.as_u16(),
        body
    )))
}

/// Apply the total deadline to buffered requests only.
pub(crate) fn deadline(
    builder: reqwest::RequestBuilder,
    stream: bool,
    timeout: Duration,
) -> reqwest::RequestBuilder {
    if stream {
        builder
    } else {
        builder.timeout(timeout)
    }
}

/// Wrap a response body as a [`ByteStream`] that fails once the upstream
/// stays silent for `idle`.
pub(crate) fn body_stream(response: reqwest::Response, idle: Duration) -> ByteStream {
    idle_timeout(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(AppError::from)),
        idle,
    )
}

pub(crate) fn idle_timeout<S>(upstream: S, idle: Duration) -> ByteStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let mut upstream = Box::pin(upstream);
    async_stream::stream! {
        loop {
            match tokio::time::timeout(idle, upstream.next()).await {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(_) => {
                    yield Err(AppError::ApiCallFailed(format!(
                        "upstream stream idle for {}ms",
                        idle.as_millis()
                    )));
                    break;
                }
            }
        }
    }
    .boxed()
}

/// Decode a JSON response body, naming the upstream on failure.
pub(crate) async fn read_json(response: reqwest::Response, upstream: &str) -> Result<serde_json::Value> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        AppError::ApiCallFailed(format!("invalid JSON from {}: {}", upstream, e))
    })
}
