//! Shared authentication module.
//!
//! Each client protocol carries the caller's key in a different place:
//!
//! | Protocol  | Primary            | Fallback                |
//! |-----------|--------------------|-------------------------|
//! | OpenAI    | `Authorization`    | none                    |
//! | Anthropic | `x-api-key`        | `Authorization: Bearer` |
//! | Gemini    | `?key=`            | `Authorization: Bearer` |

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::protocol::Protocol;

/// Hash an API key using SHA-256. Keys are stored hashed.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the caller's key for `protocol`. `query_key` is the `key` query
/// parameter, only consulted for Gemini.
pub fn extract_api_key(
    protocol: Protocol,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> Option<String> {
    let key = match protocol {
        Protocol::OpenAi => extract_bearer(headers),
        Protocol::Anthropic => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or_else(|| extract_bearer(headers)),
        Protocol::Gemini => query_key.or_else(|| extract_bearer(headers)),
    };
    key.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_hash_key() {
        let key = "sk-test-key-123";
        let hash = hash_key(key);
        // Hash should be 64 hex characters (256 bits)
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_key(key));
        assert_ne!(hash, hash_key("different-key"));
    }

    #[test]
    fn test_openai_uses_bearer_only() {
        let h = headers(&[("authorization", "Bearer sk-1"), ("x-api-key", "sk-2")]);
        assert_eq!(extract_api_key(Protocol::OpenAi, &h, None).as_deref(), Some("sk-1"));

        let h = headers(&[("x-api-key", "sk-2")]);
        assert_eq!(extract_api_key(Protocol::OpenAi, &h, None), None);
    }

    #[test]
    fn test_anthropic_prefers_x_api_key() {
        let h = headers(&[("authorization", "Bearer sk-1"), ("x-api-key", "sk-2")]);
        assert_eq!(extract_api_key(Protocol::Anthropic, &h, None).as_deref(), Some("sk-2"));

        let h = headers(&[("authorization", "Bearer sk-1")]);
        assert_eq!(extract_api_key(Protocol::Anthropic, &h, None).as_deref(), Some("sk-1"));
    }

    #[test]
    fn test_gemini_prefers_query_key() {
        let h = headers(&[("authorization", "Bearer sk-1")]);
        assert_eq!(
            extract_api_key(Protocol::Gemini, &h, Some("sk-q")).as_deref(),
            Some("sk-q")
        );
        assert_eq!(extract_api_key(Protocol::Gemini, &h, None).as_deref(), Some("sk-1"));
    }

    #[test]
    fn test_blank_and_malformed_keys_are_absent() {
        let h = headers(&[("authorization", "Basic abc")]);
        assert_eq!(extract_api_key(Protocol::OpenAi, &h, None), None);

        let h = headers(&[("x-api-key", "  ")]);
        assert_eq!(extract_api_key(Protocol::Anthropic, &h, None), None);
    }
}
