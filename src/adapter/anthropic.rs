//! Anthropic Messages API upstream.

use async_trait::async_trait;
use std::time::Duration;

use super::{body_stream, deadline, ensure_success, read_json, Adapter, ByteStream, DEFAULT_TIMEOUT};
use crate::core::error::Result;
use crate::protocol::anthropic::{from_wire_response, to_wire_request};
use crate::protocol::{CanonicalRequest, CanonicalResponse};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, request: &CanonicalRequest, stream: bool) -> Result<reqwest::Response> {
        let body = to_wire_request(request, stream);
        let builder = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body);
        let response = deadline(builder, stream, self.timeout).send().await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn call(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let response = self.send(request, false).await?;
        let raw = read_json(response, "anthropic").await?;
        let mut parsed = from_wire_response(&raw)?;
        if parsed.model.is_empty() {
            parsed.model = request.model.clone();
        }
        Ok(parsed)
    }

    async fn call_stream(&self, request: &CanonicalRequest) -> Result<ByteStream> {
        let response = self.send(request, true).await?;
        Ok(body_stream(response, self.timeout))
    }
}
