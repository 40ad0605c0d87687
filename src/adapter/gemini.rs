//! Gemini `generateContent` upstream. The key travels in the query string.

use async_trait::async_trait;
use std::time::Duration;

use super::{body_stream, deadline, ensure_success, read_json, Adapter, ByteStream, DEFAULT_TIMEOUT};
use crate::core::error::Result;
use crate::protocol::gemini::{from_wire_response, to_wire_request};
use crate::protocol::{CanonicalRequest, CanonicalResponse};

pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/v1/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, model, self.api_key
            )
        } else {
            format!(
                "{}/v1/models/{}:generateContent?key={}",
                self.base_url, model, self.api_key
            )
        }
    }

    async fn send(&self, request: &CanonicalRequest, stream: bool) -> Result<reqwest::Response> {
        let body = to_wire_request(request);
        let builder = self
            .client
            .post(self.url(&request.model, stream))
            .header("Content-Type", "application/json")
            .json(&body);
        let response = deadline(builder, stream, self.timeout).send().await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn call(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let response = self.send(request, false).await?;
        let raw = read_json(response, "gemini").await?;
        from_wire_response(&raw, &request.model)
    }

    async fn call_stream(&self, request: &CanonicalRequest) -> Result<ByteStream> {
        let response = self.send(request, true).await?;
        Ok(body_stream(response, self.timeout))
    }
}
