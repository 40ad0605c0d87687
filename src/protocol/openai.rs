//! OpenAI chat-completions codec. The wire shape is the canonical shape.

use serde_json::{json, Value};

use super::{parse_body, validate, CanonicalRequest, CanonicalResponse, Protocol, ProtocolCodec};
use crate::core::error::{AppError, Result};
use crate::core::error_types::{openai_error_code, ErrorKind};

pub struct OpenAiCodec;

impl ProtocolCodec for OpenAiCodec {
    fn protocol(&self) -> Protocol {
        Protocol::OpenAi
    }

    fn decode(&self, body: &[u8], _path: &str) -> Result<CanonicalRequest> {
        let raw = parse_body(body)?;
        if raw.get("messages").map(Value::is_array) != Some(true) {
            return Err(AppError::malformed("messages", "messages must be an array"));
        }
        let request: CanonicalRequest = serde_json::from_value(raw)
            .map_err(|e| AppError::malformed("messages", e.to_string()))?;
        validate(&request)?;
        Ok(request)
    }

    fn encode(&self, response: &CanonicalResponse) -> Result<Value> {
        Ok(serde_json::to_value(response)?)
    }

    fn encode_error(&self, status: u16, kind: ErrorKind, message: &str) -> Value {
        json!({
            "error": {
                "code": openai_error_code(status),
                "message": message,
                "details": kind.as_str(),
            }
        })
    }
}
