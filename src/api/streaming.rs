//! Server-Sent Events relay.
//!
//! Upstream bytes are forwarded unmodified, split into pieces of at most
//! [`MAX_CHUNK_BYTES`]. The first upstream error is logged and ends the
//! body cleanly, since the status line is already on the wire.

use axum::body::Body;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

use crate::adapter::ByteStream;
use crate::core::error::AppError;

pub const MAX_CHUNK_BYTES: usize = 4096;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Split `bytes` into consecutive slices no longer than [`MAX_CHUNK_BYTES`].
pub fn split_chunks(mut bytes: Bytes) -> Vec<Bytes> {
    let mut pieces = Vec::with_capacity(bytes.len() / MAX_CHUNK_BYTES + 1);
    while bytes.len() > MAX_CHUNK_BYTES {
        pieces.push(bytes.split_to(MAX_CHUNK_BYTES));
    }
    if !bytes.is_empty() {
        pieces.push(bytes);
    }
    pieces
}

/// Re-chunk an upstream stream. Ends without an error item after the first
/// upstream failure.
pub fn relay(mut upstream: ByteStream) -> impl Stream<Item = Result<Bytes, AppError>> {
    async_stream::stream! {
        let mut relayed = 0usize;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => {
                    relayed += bytes.len();
                    for piece in split_chunks(bytes) {
                        yield Ok::<_, AppError>(piece);
                    }
                }
                Err(e) => {
                    tracing::warn!(relayed_bytes = relayed, "Upstream stream failed: {}", e);
                    break;
                }
            }
        }
        tracing::debug!(relayed_bytes = relayed, "Stream finished");
    }
}

/// Wrap a relayed stream in an SSE response.
pub fn sse_response(upstream: ByteStream) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Body::from_stream(relay(upstream)),
    )
        .into_response()
}
