//! Anthropic Messages API codec.
//!
//! Besides the client-side codec this module owns the upstream direction
//! (canonical request to `/v1/messages` body, and the upstream reply back to
//! canonical) so that all Anthropic wire knowledge lives in one place.

use serde_json::{json, Map, Value};

use super::canonical::{clamp_u32, join_text_parts};
use super::{
    parse_body, validate, CanonicalRequest, CanonicalResponse, Choice, Message, Protocol,
    ProtocolCodec, Role, Tool, ToolCall, Usage,
};
use crate::core::error::{AppError, Result};
use crate::core::error_types::ErrorKind;

/// `max_tokens` sent upstream when the client gave none; the API requires it.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicCodec;

impl ProtocolCodec for AnthropicCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn decode(&self, body: &[u8], _path: &str) -> Result<CanonicalRequest> {
        let raw = parse_body(body)?;

        let model = raw
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let wire_messages = raw
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::malformed("messages", "messages must be an array"))?;

        let mut messages = Vec::with_capacity(wire_messages.len() + 1);

        match raw.get("system") {
            Some(Value::String(s)) if !s.is_empty() => {
                messages.push(Message::new(Role::System, s.clone()));
            }
            Some(Value::Array(blocks)) => {
                let text = join_text_parts(blocks);
                if !text.is_empty() {
                    messages.push(Message::new(Role::System, text));
                }
            }
            _ => {}
        }

        for (i, msg) in wire_messages.iter().enumerate() {
            let role: Role = msg
                .get("role")
                .cloned()
                .and_then(|r| serde_json::from_value(r).ok())
                .ok_or_else(|| {
                    AppError::malformed(format!("messages[{}].role", i), "unknown role")
                })?;

            let content = match msg.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => join_text_parts(parts),
                None | Some(Value::Null) => String::new(),
                Some(_) => {
                    return Err(AppError::malformed(
                        format!("messages[{}].content", i),
                        "content must be a string or an array of blocks",
                    ))
                }
            };

            messages.push(Message::new(role, content));
        }

        let tools = raw
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .map(|t| {
                        Tool::new(
                            t.get("name").and_then(Value::as_str).unwrap_or_default(),
                            t.get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default(),
                            t.get("input_schema")
                                .cloned()
                                .unwrap_or_else(|| json!({})),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let request = CanonicalRequest {
            model,
            messages,
            temperature: raw.get("temperature").and_then(Value::as_f64),
            top_p: raw.get("top_p").and_then(Value::as_f64),
            max_tokens: raw
                .get("max_tokens")
                .and_then(Value::as_u64)
                .map(clamp_u32),
            stream: raw.get("stream").and_then(Value::as_bool).unwrap_or(false),
            tools,
        };

        validate(&request)?;
        Ok(request)
    }

    fn encode(&self, response: &CanonicalResponse) -> Result<Value> {
        let mut content = Vec::new();
        let mut stop_reason = "end_turn";

        if let Some(choice) = response.first_choice() {
            if !choice.message.content.is_empty() {
                content.push(json!({"type": "text", "text": choice.message.content}));
            }
            for call in choice.message.tool_calls() {
                let input: Value = serde_json::from_str(&call.function.arguments)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({}));
                content.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
            stop_reason = stop_reason_for(choice.finish_reason.as_deref());
        }

        Ok(json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": stop_reason,
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": response.usage.prompt_tokens,
                "output_tokens": response.usage.completion_tokens,
            }
        }))
    }

    fn encode_error(&self, _status: u16, kind: ErrorKind, message: &str) -> Value {
        json!({
            "error": {
                "type": kind.as_str(),
                "message": message,
            }
        })
    }
}

fn stop_reason_for(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    }
}

fn finish_reason_for(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    }
}

/// Canonical request to an upstream `/v1/messages` body.
///
/// System messages are lifted into the top-level `system` field and
/// `max_tokens` falls back to [`DEFAULT_MAX_TOKENS`].
pub fn to_wire_request(request: &CanonicalRequest, stream: bool) -> Value {
    let mut system_parts = Vec::new();
    let mut messages = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::Tool => messages.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                }]
            })),
            Role::Assistant if !msg.tool_calls().is_empty() => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for call in msg.tool_calls() {
                    let input: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::User | Role::Assistant => messages.push(json!({
                "role": msg.role.as_str(),
                "content": msg.content,
            })),
        }
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));
    body.insert(
        "max_tokens".into(),
        json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if !system_parts.is_empty() {
        body.insert("system".into(), json!(system_parts.join("\n")));
    }
    if let Some(t) = request.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        body.insert("top_p".into(), json!(p));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }
    if stream {
        body.insert("stream".into(), Value::Bool(true));
    }
    Value::Object(body)
}

/// Upstream `/v1/messages` reply to a canonical response.
pub fn from_wire_response(raw: &Value) -> Result<CanonicalResponse> {
    let blocks = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::ApiCallFailed("response has no content array".to_string()))?;

    let text = join_text_parts(blocks);
    let tool_calls: Vec<ToolCall> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .map(|b| {
            ToolCall::new(
                b.get("id").and_then(Value::as_str).unwrap_or_default(),
                b.get("name").and_then(Value::as_str).unwrap_or_default(),
                b.get("input")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string()),
            )
        })
        .collect();

    let usage = raw.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .map_or(0, clamp_u32);
    let output_tokens = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .map_or(0, clamp_u32);

    let mut message = Message::new(Role::Assistant, text);
    if !tool_calls.is_empty() {
        message.tool_calls = Some(tool_calls);
    }

    Ok(CanonicalResponse {
        id: raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: raw
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some(
                finish_reason_for(raw.get("stop_reason").and_then(Value::as_str)).to_string(),
            ),
        }],
        usage: Usage::new(input_tokens, output_tokens),
    })
}
