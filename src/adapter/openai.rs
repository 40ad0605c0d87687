//! OpenAI-compatible upstream. Also serves `custom` configs.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{body_stream, deadline, ensure_success, read_json, Adapter, ByteStream, DEFAULT_TIMEOUT};
use crate::core::error::{AppError, Result};
use crate::protocol::{CanonicalRequest, CanonicalResponse, Usage};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: chat_completions_url(base_url),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: &CanonicalRequest, stream: bool) -> Result<reqwest::Response> {
        let mut body = serde_json::to_value(request)?;
        body["stream"] = Value::Bool(stream);

        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body);
        let response = deadline(builder, stream, self.timeout).send().await?;
        ensure_success(response).await
    }
}

/// `{base}/v1/chat/completions`, tolerating a base that already ends in `/v1`.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{}/v1/chat/completions", base)
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    async fn call(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let response = self.send(request, false).await?;
        let raw = read_json(response, "openai").await?;
        let mut parsed: CanonicalResponse = serde_json::from_value(raw)
            .map_err(|e| AppError::ApiCallFailed(format!("unexpected openai response: {}", e)))?;
        parsed.usage = Usage::new(parsed.usage.prompt_tokens, parsed.usage.completion_tokens);
        Ok(parsed)
    }

    async fn call_stream(&self, request: &CanonicalRequest) -> Result<ByteStream> {
        let response = self.send(request, true).await?;
        Ok(body_stream(response, self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Role};
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_url_strips_trailing_v1() {
        assert_eq!(
            chat_completions_url("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:8080"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_call_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &format!("{}/v1", server.uri()), "sk-test");
        let request = CanonicalRequest::new("gpt-4", vec![Message::new(Role::User, "hello")]);

        let response = adapter.call(&request).await.unwrap();
        assert_eq!(response.choices[0].message.content, "hi");
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[tokio::test]
    async fn test_deadline_bounds_buffered_calls_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: [DONE]\n\n", "text/event-stream")
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &server.uri(), "sk-test")
            .with_timeout(std::time::Duration::from_millis(100));
        let request = CanonicalRequest::new("gpt-4", vec![Message::new(Role::User, "hi")]);

        assert!(adapter.call(&request).await.is_err());

        let mut stream = adapter.call_stream(&request).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &server.uri(), "sk");
        let request = CanonicalRequest::new("gpt-4", vec![Message::new(Role::User, "hello")]);

        let err = adapter.call(&request).await.unwrap_err();
        assert_eq!(err.to_string(), "API call failed: API returned status 429: slow down");
    }

    #[tokio::test]
    async fn test_stream_relays_body() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &server.uri(), "sk");
        let request = CanonicalRequest::new("gpt-4", vec![Message::new(Role::User, "hello")]);

        let mut stream = adapter.call_stream(&request).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(String::from_utf8(collected).unwrap(), sse);
    }
}
