//! Gemini `generateContent` codec.
//!
//! The model travels in the URL (`/v1/models/{model}:generateContent`), not
//! in the body. This module also owns the upstream direction used by the
//! Gemini adapter.

use serde_json::{json, Map, Value};

use super::canonical::clamp_u32;
use super::{
    parse_body, validate, CanonicalRequest, CanonicalResponse, Choice, Message, Protocol,
    ProtocolCodec, Role, Tool, ToolCall, Usage,
};
use crate::core::error::{AppError, Result};
use crate::core::error_types::ErrorKind;

const GENERATE_SUFFIX: &str = ":generateContent";
const STREAM_SUFFIX: &str = ":streamGenerateContent";

pub struct GeminiCodec;

/// Extract `(model, is_stream)` from a Gemini path or action segment.
///
/// Accepts `/v1/models/gemini-pro:generateContent`, `gemini-pro:generateContent`
/// and `/gemini-pro:streamGenerateContent`.
pub fn model_from_path(path: &str) -> (String, bool) {
    let tail = match path.rfind("models/") {
        Some(idx) => &path[idx + "models/".len()..],
        None => path.trim_start_matches('/'),
    };

    if let Some(model) = tail.strip_suffix(STREAM_SUFFIX) {
        return (model.to_string(), true);
    }
    if let Some(model) = tail.strip_suffix(GENERATE_SUFFIX) {
        return (model.to_string(), false);
    }
    let model = tail.split(':').next().unwrap_or_default();
    (model.to_string(), false)
}

fn parts_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ProtocolCodec for GeminiCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Gemini
    }

    fn decode(&self, body: &[u8], path: &str) -> Result<CanonicalRequest> {
        let (model, stream) = model_from_path(path);
        if model.is_empty() {
            return Err(AppError::malformed("model", "model missing from request path"));
        }

        let raw = parse_body(body)?;
        let contents = raw
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::malformed("contents", "contents must be an array"))?;

        let mut messages = Vec::with_capacity(contents.len() + 1);

        if let Some(parts) = raw
            .get("systemInstruction")
            .and_then(|s| s.get("parts"))
            .and_then(Value::as_array)
        {
            let text = parts_text(parts);
            if !text.is_empty() {
                messages.push(Message::new(Role::System, text));
            }
        }

        for content in contents {
            let role = match content.get("role").and_then(Value::as_str) {
                Some("model") => Role::Assistant,
                _ => Role::User,
            };
            let parts = content
                .get("parts")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let mut message = Message::new(role, parts_text(parts));

            let calls: Vec<ToolCall> = parts
                .iter()
                .filter_map(|p| p.get("functionCall"))
                .map(|call| {
                    let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    ToolCall::new(format!("call_{}", name), name, args.to_string())
                })
                .collect();
            if !calls.is_empty() {
                message.tool_calls = Some(calls);
            }

            messages.push(message);
        }

        let generation = raw.get("generationConfig");
        let tools = raw
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("functionDeclarations").and_then(Value::as_array))
                    .flatten()
                    .map(|decl| {
                        Tool::new(
                            decl.get("name").and_then(Value::as_str).unwrap_or_default(),
                            decl.get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default(),
                            decl.get("parameters").cloned().unwrap_or_else(|| json!({})),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let request = CanonicalRequest {
            model,
            messages,
            temperature: generation
                .and_then(|g| g.get("temperature"))
                .and_then(Value::as_f64),
            top_p: generation.and_then(|g| g.get("topP")).and_then(Value::as_f64),
            max_tokens: generation
                .and_then(|g| g.get("maxOutputTokens"))
                .and_then(Value::as_u64)
                .map(clamp_u32),
            stream,
            tools,
        };

        validate(&request)?;
        Ok(request)
    }

    fn encode(&self, response: &CanonicalResponse) -> Result<Value> {
        let candidates: Vec<Value> = response
            .first_choice()
            .map(|choice| {
                let finish = match choice.finish_reason.as_deref() {
                    Some("length") => "MAX_TOKENS",
                    _ => "STOP",
                };
                vec![json!({
                    "content": {
                        "parts": [{"text": choice.message.content}],
                        "role": "model",
                    },
                    "finishReason": finish,
                    "index": 0,
                })]
            })
            .unwrap_or_default();

        Ok(json!({
            "candidates": candidates,
            "usageMetadata": {
                "promptTokenCount": response.usage.prompt_tokens,
                "candidatesTokenCount": response.usage.completion_tokens,
                "totalTokenCount": response.usage.total_tokens,
            }
        }))
    }

    fn encode_error(&self, status: u16, _kind: ErrorKind, message: &str) -> Value {
        json!({
            "error": {
                "code": status,
                "message": message,
            }
        })
    }
}

/// Canonical request to an upstream `generateContent` body.
///
/// System messages are dropped, `assistant` becomes `model`, tool calls and
/// tool results become `functionCall`/`functionResponse` parts.
pub fn to_wire_request(request: &CanonicalRequest) -> Value {
    let mut contents = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        let role = match msg.role {
            Role::System => continue,
            Role::Assistant => "model",
            Role::User | Role::Tool => "user",
        };

        let mut parts = Vec::new();
        if msg.role == Role::Tool {
            let response: Value = serde_json::from_str(&msg.content)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({"result": msg.content}));
            parts.push(json!({
                "functionResponse": {
                    "name": msg.name.clone().unwrap_or_default(),
                    "response": response,
                }
            }));
        } else if !msg.content.is_empty() {
            parts.push(json!({"text": msg.content}));
        }

        for call in msg.tool_calls() {
            let args: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            parts.push(json!({
                "functionCall": {"name": call.function.name, "args": args}
            }));
        }

        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        generation.insert("topP".into(), json!(p));
    }
    if let Some(m) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(m));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".into(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }

    Value::Object(body)
}

fn finish_reason_from_wire(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") => "content_filter",
        _ => "stop",
    }
}

/// Upstream `generateContent` reply to a canonical response.
pub fn from_wire_response(raw: &Value, model: &str) -> Result<CanonicalResponse> {
    let candidates = raw
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::ApiCallFailed("response has no candidates".to_string()))?;

    let choices = candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let parts = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();

            let calls: Vec<ToolCall> = parts
                .iter()
                .filter_map(|p| p.get("functionCall"))
                .enumerate()
                .map(|(n, call)| {
                    ToolCall::new(
                        format!("call_{}_{}", i, n),
                        call.get("name").and_then(Value::as_str).unwrap_or_default(),
                        call.get("args")
                            .map(Value::to_string)
                            .unwrap_or_else(|| "{}".to_string()),
                    )
                })
                .collect();

            let mut message = Message::new(Role::Assistant, text);
            if !calls.is_empty() {
                message.tool_calls = Some(calls);
            }

            Choice {
                index: candidate
                    .get("index")
                    .and_then(Value::as_u64)
                    .map_or(i as u32, clamp_u32),
                message,
                finish_reason: Some(
                    finish_reason_from_wire(candidate.get("finishReason").and_then(Value::as_str))
                        .to_string(),
                ),
            }
        })
        .collect();

    let usage = raw.get("usageMetadata");
    let count = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(Value::as_u64)
            .map_or(0, clamp_u32)
    };

    Ok(CanonicalResponse {
        id: format!("gemini-{}", chrono::Utc::now().timestamp()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices,
        usage: Usage::new(count("promptTokenCount"), count("candidatesTokenCount")),
    })
}
