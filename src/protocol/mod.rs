//! Wire-format codecs.
//!
//! Each client protocol gets one stateless [`ProtocolCodec`] that decodes its
//! request body into a [`CanonicalRequest`] and encodes a
//! [`CanonicalResponse`] (or an error) back into its own JSON shape.
//!
//! ```text
//! client body --decode--> CanonicalRequest --> adapter --> CanonicalResponse --encode--> client body
//! ```

pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod openai;

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::error::{AppError, Result};
use crate::core::error_types::ErrorKind;

pub use canonical::{
    CanonicalRequest, CanonicalResponse, Choice, FunctionCall, Message, Role, Tool, ToolCall,
    ToolFunction, Usage,
};

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
            Protocol::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Codec trait
// ============================================================================

pub trait ProtocolCodec: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Decode a raw client body. `path` is the request path; only codecs that
    /// carry the model in the URL look at it.
    fn decode(&self, body: &[u8], path: &str) -> Result<CanonicalRequest>;

    fn encode(&self, response: &CanonicalResponse) -> Result<Value>;

    /// Error body in this protocol's envelope.
    fn encode_error(&self, status: u16, kind: ErrorKind, message: &str) -> Value;
}

/// Parse a body as JSON, reporting syntax errors as malformed requests.
pub(crate) fn parse_body(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| AppError::MalformedRequest {
        field: None,
        message: format!("invalid JSON body: {}", e),
    })
}

/// Checks shared by every decoder.
pub(crate) fn validate(request: &CanonicalRequest) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(AppError::malformed("model", "model is required"));
    }
    if request.messages.is_empty() {
        return Err(AppError::malformed(
            "messages",
            "at least one message is required",
        ));
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Codecs keyed by protocol.
pub struct CodecRegistry {
    codecs: HashMap<Protocol, Arc<dyn ProtocolCodec>>,
}

impl CodecRegistry {
    /// Registry with the OpenAI, Anthropic and Gemini codecs.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(openai::OpenAiCodec));
        registry.register(Arc::new(anthropic::AnthropicCodec));
        registry.register(Arc::new(gemini::GeminiCodec));
        registry
    }

    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn register(&mut self, codec: Arc<dyn ProtocolCodec>) {
        self.codecs.insert(codec.protocol(), codec);
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn ProtocolCodec>> {
        self.codecs.get(&protocol)
    }

    pub fn get_or_error(&self, protocol: Protocol) -> Result<&Arc<dyn ProtocolCodec>> {
        self.get(protocol)
            .ok_or_else(|| AppError::Internal(format!("no codec registered for {}", protocol)))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_all_protocols() {
        let registry = CodecRegistry::new();
        for protocol in [Protocol::OpenAi, Protocol::Anthropic, Protocol::Gemini] {
            assert_eq!(registry.get_or_error(protocol).unwrap().protocol(), protocol);
        }
    }

    #[test]
    fn test_empty_registry_errors() {
        let registry = CodecRegistry::empty();
        assert!(registry.get(Protocol::OpenAi).is_none());
        assert!(registry.get_or_error(Protocol::Gemini).is_err());
    }

    #[test]
    fn test_parse_body_reports_malformed() {
        let err = parse_body(b"{not json").unwrap_err();
        assert!(matches!(err, AppError::MalformedRequest { field: None, .. }));
    }

    #[test]
    fn test_validate_requires_messages() {
        let request = CanonicalRequest::new("gpt-4", vec![]);
        match validate(&request) {
            Err(AppError::MalformedRequest { field, .. }) => {
                assert_eq!(field.as_deref(), Some("messages"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
