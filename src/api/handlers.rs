//! Proxy handlers for the three client protocols.
//!
//! All three share one path: decode with the protocol's codec, run the
//! orchestrator, then encode the answer (or the error) in the same protocol.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::auth::extract_api_key;
use super::streaming::sse_response;
use super::AppState;
use crate::core::error::{AppError, Result};
use crate::core::logging::generate_request_id;
use crate::protocol::{Protocol, ProtocolCodec};
use crate::services::RequestMeta;
use crate::with_request_context;

#[derive(Debug, Default, Deserialize)]
pub struct GeminiQuery {
    pub key: Option<String>,
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = extract_api_key(Protocol::OpenAi, &headers, None);
    proxy(state, Protocol::OpenAi, "/v1/chat/completions".to_string(), key, body).await
}

/// `POST /v1/messages`
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = extract_api_key(Protocol::Anthropic, &headers, None);
    proxy(state, Protocol::Anthropic, "/v1/messages".to_string(), key, body).await
}

/// `POST /v1/models/{model}:generateContent` and `:streamGenerateContent`
pub async fn gemini_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    Query(query): Query<GeminiQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = extract_api_key(Protocol::Gemini, &headers, query.key.as_deref());
    let path = format!("/v1/models/{}", action.trim_start_matches('/'));
    proxy(state, Protocol::Gemini, path, key, body).await
}

async fn proxy(
    state: Arc<AppState>,
    protocol: Protocol,
    path: String,
    key: Option<String>,
    body: Bytes,
) -> Response {
    let request_id = generate_request_id();

    with_request_context!(request_id, protocol.as_str().to_string(), async move {
        let codec = match state.codecs.get_or_error(protocol) {
            Ok(codec) => codec.clone(),
            Err(e) => return e.into_response(),
        };

        match handle(&state, codec.as_ref(), &path, key.as_deref(), &body).await {
            Ok(response) => response,
            Err(e) => error_response(codec.as_ref(), e),
        }
    })
}

#[tracing::instrument(skip_all, fields(protocol = %codec.protocol(), path = %path))]
async fn handle(
    state: &AppState,
    codec: &dyn ProtocolCodec,
    path: &str,
    key: Option<&str>,
    body: &[u8],
) -> Result<Response> {
    let request = codec.decode(body, path)?;
    let meta = RequestMeta::post(codec.protocol(), path);

    tracing::debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Processing request"
    );

    if request.stream {
        let stream = state.orchestrator.stream(key, request, &meta).await?;
        Ok(sse_response(stream))
    } else {
        let response = state.orchestrator.complete(key, request, &meta).await?;
        Ok(Json(codec.encode(&response)?).into_response())
    }
}

/// Render `err` in the client's protocol envelope.
fn error_response(codec: &dyn ProtocolCodec, err: AppError) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), "Request failed: {}", err);
    } else {
        tracing::debug!(status = status.as_u16(), "Request rejected: {}", err);
    }
    let body = codec.encode_error(status.as_u16(), err.kind(), &err.public_message());
    (status, Json(body)).into_response()
}
