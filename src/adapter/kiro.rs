//! Kiro (CodeWhisperer) upstream.
//!
//! Requests are rewritten into a `conversationState` with a strictly
//! alternating user/assistant history. Responses come back as an AWS
//! event-stream: binary frames whose JSON payloads carry text fragments and
//! tool-use fragments. The buffered path folds them into one canonical
//! response; the streaming path re-emits them as OpenAI-style SSE chunks.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! | total_len u32 | headers_len u32 | prelude_crc u32 | headers | payload | msg_crc u32 |
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{body_stream, deadline, ensure_success, Adapter, ByteStream, DEFAULT_TIMEOUT};
use crate::core::error::{AppError, Result};
use crate::protocol::{
    CanonicalRequest, CanonicalResponse, Choice, Message, Role, ToolCall, Usage,
};

pub const DEFAULT_REGION: &str = "us-east-1";

const ORIGIN: &str = "AI_EDITOR";
const TOOL_NAME_LIMIT: usize = 64;
const TOOL_DESCRIPTION_LIMIT: usize = 10237;
const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;

/// `https://q.{region}.amazonaws.com`
pub fn default_api_base(region: &str) -> String {
    format!("https://q.{}.amazonaws.com", region)
}

pub struct KiroAdapter {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
    profile_arn: Option<String>,
    machine_id: String,
    timeout: Duration,
}

impl KiroAdapter {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        access_token: impl Into<String>,
        profile_arn: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/generateAssistantResponse",
                api_base.trim_end_matches('/')
            ),
            access_token: access_token.into(),
            profile_arn,
            machine_id: uuid::Uuid::new_v4().simple().to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, request: &CanonicalRequest, stream: bool) -> Result<reqwest::Response> {
        let body = build_request(request, self.profile_arn.clone());
        let accept = if stream {
            "application/vnd.amazon.eventstream"
        } else {
            "application/json"
        };
        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=1")
            .header("x-amzn-kiro-agent-mode", "vibe")
            .header(
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.0 KiroIDE-0.8.140-{}", self.machine_id),
            )
            .header(
                "user-agent",
                "aws-sdk-js/1.0.0 ua/2.1 os/linux lang/js md/nodejs#18.0.0 api/codewhispererruntime#1.0.0 m/E",
            )
            .json(&body);
        let response = deadline(builder, stream, self.timeout).send().await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl Adapter for KiroAdapter {
    fn name(&self) -> &str {
        "kiro"
    }

    async fn call(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let response = self.send(request, false).await?;
        let raw = response.bytes().await?;

        let mut decoder = EventStreamDecoder::default();
        let mut assembler = ResponseAssembler::default();
        for payload in decoder.push(&raw)? {
            assembler.feed(&payload);
        }
        Ok(assembler.finish(&request.model))
    }

    async fn call_stream(&self, request: &CanonicalRequest) -> Result<ByteStream> {
        let response = self.send(request, true).await?;
        Ok(transcode_to_sse(
            body_stream(response, self.timeout),
            request.model.clone(),
        ))
    }
}

// ============================================================================
// Request shape
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroRequest {
    conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_config: Option<InferenceConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationState {
    conversation_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    history: Vec<KiroMessage>,
    current_message: KiroMessage,
    chat_trigger_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
enum KiroMessage {
    #[serde(rename = "userInputMessage")]
    User(UserInputMessage),
    #[serde(rename = "assistantResponseMessage")]
    Assistant(AssistantMessage),
}

impl KiroMessage {
    fn user(content: impl Into<String>, model_id: &str) -> Self {
        KiroMessage::User(user_input(content, model_id))
    }

    fn assistant(content: impl Into<String>) -> Self {
        KiroMessage::Assistant(AssistantMessage {
            content: content.into(),
            tool_uses: Vec::new(),
        })
    }

    fn is_user(&self) -> bool {
        matches!(self, KiroMessage::User(_))
    }

    fn has_tool_results(&self) -> bool {
        match self {
            KiroMessage::User(u) => u
                .user_input_message_context
                .as_ref()
                .map(|c| !c.tool_results.is_empty())
                .unwrap_or(false),
            KiroMessage::Assistant(_) => false,
        }
    }
}

fn user_input(content: impl Into<String>, model_id: &str) -> UserInputMessage {
    UserInputMessage {
        content: content.into(),
        model_id: model_id.to_string(),
        origin: ORIGIN,
        user_input_message_context: None,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserInputMessage {
    content: String,
    model_id: String,
    origin: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_input_message_context: Option<MessageContext>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<KiroTool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_results: Vec<ToolResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssistantMessage {
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_uses: Vec<ToolUse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct KiroTool {
    tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSpecification {
    name: String,
    description: String,
    input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize)]
struct InputSchema {
    json: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolUse {
    name: String,
    tool_use_id: String,
    input: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResult {
    tool_use_id: String,
    status: &'static str,
    content: Vec<ToolResultContent>,
}

#[derive(Debug, Clone, Serialize)]
struct ToolResultContent {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

/// Rewrite a canonical request as a Kiro conversation.
///
/// System text is merged into the first user turn. Consecutive tool results
/// are batched into one user turn. The history is then repaired so it starts
/// and ends with a user turn, alternates strictly and answers every tool use.
pub fn build_request(request: &CanonicalRequest, profile_arn: Option<String>) -> KiroRequest {
    let model_id = request.model.as_str();

    let system_prompt = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let mut system_merged = system_prompt.is_empty();

    let turns: Vec<&Message> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    let mut messages = Vec::with_capacity(turns.len());
    let mut pending_results = Vec::new();

    for (i, msg) in turns.iter().enumerate() {
        match msg.role {
            Role::User => {
                let mut content = msg.content.clone();
                if !system_merged {
                    content = format!("{}\n\n{}", system_prompt, content);
                    system_merged = true;
                }
                if content.is_empty() {
                    content = "Continue".to_string();
                }
                messages.push(KiroMessage::user(content, model_id));
            }
            Role::Assistant => {
                let tool_uses: Vec<ToolUse> = msg
                    .tool_calls()
                    .iter()
                    .filter(|c| c.kind == "function")
                    .map(|c| ToolUse {
                        name: c.function.name.clone(),
                        tool_use_id: c.id.clone(),
                        input: serde_json::from_str(&c.function.arguments)
                            .unwrap_or_else(|_| json!({})),
                    })
                    .collect();
                let content = match (msg.content.is_empty(), tool_uses.is_empty()) {
                    (false, _) => msg.content.clone(),
                    (true, false) => "Using tools.".to_string(),
                    (true, true) => "I understand.".to_string(),
                };
                messages.push(KiroMessage::Assistant(AssistantMessage { content, tool_uses }));
            }
            Role::Tool => {
                if let Some(id) = msg.tool_call_id.as_ref().filter(|id| !id.is_empty()) {
                    pending_results.push(ToolResult {
                        tool_use_id: id.clone(),
                        status: "success",
                        content: vec![ToolResultContent {
                            text: msg.content.clone(),
                        }],
                    });
                }
                let next_is_tool = turns.get(i + 1).map(|m| m.role == Role::Tool) == Some(true);
                if !next_is_tool && !pending_results.is_empty() {
                    messages.push(KiroMessage::User(UserInputMessage {
                        content: "Tool results provided.".to_string(),
                        model_id: model_id.to_string(),
                        origin: ORIGIN,
                        user_input_message_context: Some(MessageContext {
                            tools: Vec::new(),
                            tool_results: std::mem::take(&mut pending_results),
                        }),
                    }));
                }
            }
            Role::System => {}
        }
    }

    let mut sanitized = sanitize_conversation(messages, model_id);

    // sanitize_conversation always ends on a user turn
    let mut current = match sanitized.pop() {
        Some(KiroMessage::User(user)) => user,
        Some(other) => {
            sanitized.push(other);
            user_input("Continue.", model_id)
        }
        None => user_input("Continue.", model_id),
    };

    if !system_merged {
        current.content = format!("{}\n\n{}", system_prompt, current.content);
    }

    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                let mut description = tool.function.description.clone();
                if description.is_empty() {
                    description = format!("Tool: {}", tool.function.name);
                }
                if description.chars().count() > TOOL_DESCRIPTION_LIMIT {
                    description = description.chars().take(TOOL_DESCRIPTION_LIMIT).collect();
                    description.push_str("...");
                }
                KiroTool {
                    tool_specification: ToolSpecification {
                        name: shorten_tool_name(&tool.function.name),
                        description,
                        input_schema: InputSchema {
                            json: tool.function.parameters.clone(),
                        },
                    },
                }
            })
            .collect();
        current
            .user_input_message_context
            .get_or_insert_with(MessageContext::default)
            .tools = tools;
    }

    let inference_config = if request.max_tokens.is_some()
        || request.temperature.is_some()
        || request.top_p.is_some()
    {
        Some(InferenceConfig {
            max_tokens: request.max_tokens.filter(|m| *m > 0),
            temperature: request.temperature.filter(|t| *t > 0.0),
            top_p: request.top_p.filter(|p| *p > 0.0),
        })
    } else {
        None
    };

    KiroRequest {
        conversation_state: ConversationState {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            history: sanitized,
            current_message: KiroMessage::User(current),
            chat_trigger_type: "MANUAL",
        },
        profile_arn: profile_arn.filter(|arn| !arn.is_empty()),
        inference_config,
    }
}

fn sanitize_conversation(messages: Vec<KiroMessage>, model_id: &str) -> Vec<KiroMessage> {
    if messages.is_empty() {
        return vec![KiroMessage::user("Hello", model_id)];
    }

    let mut messages = messages;
    if !messages[0].is_user() {
        messages.insert(0, KiroMessage::user("Hello", model_id));
    }

    let messages = remove_empty_user_messages(messages);
    let messages = answer_dangling_tool_uses(messages, model_id);
    let mut messages = enforce_alternation(messages, model_id);

    if messages.last().map(KiroMessage::is_user) != Some(true) {
        messages.push(KiroMessage::user("Continue", model_id));
    }
    messages
}

/// Drop blank user turns after the first one, unless they carry tool results.
fn remove_empty_user_messages(messages: Vec<KiroMessage>) -> Vec<KiroMessage> {
    let first_user = messages.iter().position(KiroMessage::is_user);
    messages
        .into_iter()
        .enumerate()
        .filter(|(i, msg)| match msg {
            KiroMessage::Assistant(_) => true,
            KiroMessage::User(user) => {
                Some(*i) == first_user
                    || !user.content.trim().is_empty()
                    || msg.has_tool_results()
            }
        })
        .map(|(_, msg)| msg)
        .collect()
}

/// Every assistant tool use must be followed by a user turn with results.
fn answer_dangling_tool_uses(messages: Vec<KiroMessage>, model_id: &str) -> Vec<KiroMessage> {
    let mut result = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(msg) = iter.next() {
        let dangling: Vec<String> = match &msg {
            KiroMessage::Assistant(a) if !a.tool_uses.is_empty() => {
                let answered = iter.peek().map(KiroMessage::has_tool_results) == Some(true);
                if answered {
                    Vec::new()
                } else {
                    a.tool_uses.iter().map(|t| t.tool_use_id.clone()).collect()
                }
            }
            _ => Vec::new(),
        };
        result.push(msg);

        if !dangling.is_empty() {
            result.push(KiroMessage::User(UserInputMessage {
                content: String::new(),
                model_id: model_id.to_string(),
                origin: ORIGIN,
                user_input_message_context: Some(MessageContext {
                    tools: Vec::new(),
                    tool_results: dangling
                        .into_iter()
                        .map(|id| ToolResult {
                            tool_use_id: id,
                            status: "error",
                            content: vec![ToolResultContent {
                                text: "Tool execution failed".to_string(),
                            }],
                        })
                        .collect(),
                }),
            }));
        }
    }
    result
}

fn enforce_alternation(messages: Vec<KiroMessage>, model_id: &str) -> Vec<KiroMessage> {
    let mut result: Vec<KiroMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(prev) = result.last() {
            match (prev.is_user(), msg.is_user()) {
                (true, true) => result.push(KiroMessage::assistant("understood")),
                (false, false) => result.push(KiroMessage::user("Continue", model_id)),
                _ => {}
            }
        }
        result.push(msg);
    }
    result
}

/// Tool names are capped at 64 bytes. `mcp__server__tool` collapses to
/// `mcp__tool` when that fits.
pub fn shorten_tool_name(name: &str) -> String {
    if name.len() <= TOOL_NAME_LIMIT {
        return name.to_string();
    }
    if let Some(rest) = name.strip_prefix("mcp__") {
        if let Some(idx) = rest.rfind("__") {
            let shortened = format!("mcp__{}", &rest[idx + 2..]);
            if shortened.len() <= TOOL_NAME_LIMIT {
                return shortened;
            }
        }
    }
    let mut end = TOOL_NAME_LIMIT;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

// ============================================================================
// Event-stream decoding
// ============================================================================

/// Incremental frame decoder. Partial frames stay buffered until the rest
/// arrives.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    /// Append bytes and return the JSON payloads of every complete frame.
    /// Frames whose payload is not JSON are skipped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Value>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        let mut offset = 0;
        while self.buffer.len() - offset >= PRELUDE_LEN {
            let frame = &self.buffer[offset..];
            let total_len = read_u32(&frame[0..4]) as usize;
            let headers_len = read_u32(&frame[4..8]) as usize;

            if total_len < PRELUDE_LEN + MESSAGE_CRC_LEN + headers_len {
                self.buffer.clear();
                return Err(AppError::ApiCallFailed(format!(
                    "malformed event-stream frame (length {})",
                    total_len
                )));
            }
            if frame.len() < total_len {
                break;
            }

            let payload = &frame[PRELUDE_LEN + headers_len..total_len - MESSAGE_CRC_LEN];
            if !payload.is_empty() {
                match serde_json::from_slice::<Value>(payload) {
                    Ok(value) => payloads.push(value),
                    Err(e) => tracing::debug!("Skipping non-JSON event-stream payload: {}", e),
                }
            }
            offset += total_len;
        }

        self.buffer.drain(..offset);
        Ok(payloads)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// One decoded Kiro event.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroEvent {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: ToolInput,
        stop: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    None,
    /// A piece of a JSON string, to be concatenated
    Fragment(String),
    /// The whole input object
    Complete(String),
}

pub fn parse_event(payload: &Value) -> Option<KiroEvent> {
    let event = payload
        .get("assistantResponseEvent")
        .or_else(|| payload.get("toolUseEvent"))
        .filter(|e| e.is_object())
        .unwrap_or(payload);

    if let Some(content) = event.get("content").and_then(Value::as_str) {
        let followup = event.get("followupPrompt").map(|f| !f.is_null()) == Some(true);
        if followup {
            return None;
        }
        return Some(KiroEvent::Text(content.to_string()));
    }

    let name = event.get("name").and_then(Value::as_str)?;
    let id = event.get("toolUseId").and_then(Value::as_str)?;
    let input = match event.get("input") {
        Some(Value::String(s)) => ToolInput::Fragment(s.clone()),
        Some(obj @ Value::Object(_)) => ToolInput::Complete(obj.to_string()),
        _ => ToolInput::None,
    };
    Some(KiroEvent::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
        stop: event.get("stop").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Accumulates tool-use fragments by id until their `stop` event.
#[derive(Debug, Default)]
struct ToolUseTracker {
    pending: HashMap<String, (String, String)>,
    order: Vec<String>,
}

impl ToolUseTracker {
    fn feed(&mut self, id: &str, name: &str, input: &ToolInput, stop: bool) -> Option<ToolCall> {
        if !self.pending.contains_key(id) {
            self.order.push(id.to_string());
        }
        let entry = self
            .pending
            .entry(id.to_string())
            .or_insert_with(|| (name.to_string(), String::new()));
        match input {
            ToolInput::Fragment(fragment) => entry.1.push_str(fragment),
            ToolInput::Complete(whole) => entry.1 = whole.clone(),
            ToolInput::None => {}
        }

        if !stop {
            return None;
        }
        self.order.retain(|pending| pending != id);
        self.pending
            .remove(id)
            .map(|(name, args)| ToolCall::new(id, name, finalize_arguments(&args)))
    }

    /// Flush tool uses that never saw `stop`. Unparseable input becomes `{}`.
    fn drain_incomplete(&mut self) -> Vec<ToolCall> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| {
                self.pending.remove(&id).map(|(name, args)| {
                    let args = serde_json::from_str::<Value>(&args)
                        .ok()
                        .filter(Value::is_object)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    ToolCall::new(id, name, args)
                })
            })
            .collect()
    }
}

/// Normalize accumulated tool input. Truncated input is replaced by an error
/// object carrying the first 500 characters.
fn finalize_arguments(args: &str) -> String {
    if args.is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<Value>(args) {
        Ok(value) if value.is_object() => value.to_string(),
        _ => json!({
            "_error": "Tool input truncated by upstream (output token limit exceeded)",
            "_partialInput": args.chars().take(500).collect::<String>(),
        })
        .to_string(),
    }
}

/// Folds events into a single canonical response.
#[derive(Debug, Default)]
struct ResponseAssembler {
    content: String,
    tools: ToolUseTracker,
    calls: Vec<ToolCall>,
}

impl ResponseAssembler {
    fn feed(&mut self, payload: &Value) {
        match parse_event(payload) {
            Some(KiroEvent::Text(text)) => self.content.push_str(&text),
            Some(KiroEvent::ToolUse {
                id,
                name,
                input,
                stop,
            }) => {
                if let Some(call) = self.tools.feed(&id, &name, &input, stop) {
                    self.calls.push(call);
                }
            }
            None => {}
        }
    }

    fn finish(mut self, model: &str) -> CanonicalResponse {
        let mut calls = std::mem::take(&mut self.calls);
        calls.extend(self.tools.drain_incomplete());

        let (bracket_calls, content) = extract_bracket_tool_calls(&self.content);
        calls.extend(bracket_calls);
        let calls = dedupe_tool_calls(calls);

        // No token counts come back; estimate from the text at 4 chars/token.
        let completion = u32::try_from(content.len() / 4).unwrap_or(u32::MAX);
        let prompt = completion / 2;

        let mut message = Message::new(Role::Assistant, content);
        if !calls.is_empty() {
            message.tool_calls = Some(calls);
        }

        CanonicalResponse {
            id: format!("kiro-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage::new(prompt, completion),
        }
    }
}

/// Find `[Called name with args: {...}]` markers in text, returning the calls
/// and the text with the markers removed.
pub fn extract_bracket_tool_calls(content: &str) -> (Vec<ToolCall>, String) {
    const MARKER: &str = "[Called";
    const ARGS: &str = " with args:";

    let mut calls = Vec::new();
    let mut cleaned = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find(MARKER) {
        let after = &rest[start..];
        let Some((name_part, args_part)) = after.split_once(ARGS) else {
            break;
        };
        let args_part = args_part.trim_start();
        let Some(args_len) = balanced_object_len(args_part) else {
            break;
        };
        let args = &args_part[..args_len];
        let tail = args_part[args_len..].trim_start();
        let Some(tail) = tail.strip_prefix(']') else {
            cleaned.push_str(&rest[..start + MARKER.len()]);
            rest = &rest[start + MARKER.len()..];
            continue;
        };

        match serde_json::from_str::<Value>(args) {
            Ok(parsed) if parsed.is_object() => {
                let name = name_part.trim_start_matches(MARKER).trim();
                calls.push(ToolCall::new(
                    format!("call_{}", calls.len()),
                    name,
                    parsed.to_string(),
                ));
                cleaned.push_str(&rest[..start]);
            }
            _ => cleaned.push_str(&rest[..rest.len() - tail.len()]),
        }
        rest = tail;
    }
    cleaned.push_str(rest);

    if calls.is_empty() {
        return (calls, content.to_string());
    }
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    (calls, collapsed)
}

/// Byte length of the leading `{...}` object, honouring nesting and strings.
fn balanced_object_len(s: &str) -> Option<usize> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn dedupe_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|c| seen.insert(format!("{}-{}", c.function.name, c.function.arguments)))
        .collect()
}

// ============================================================================
// SSE re-encoding
// ============================================================================

/// Builds OpenAI `chat.completion.chunk` frames.
struct SseEncoder {
    model: String,
    next_id: u64,
}

impl SseEncoder {
    fn new(model: String) -> Self {
        Self { model, next_id: 0 }
    }

    fn chunk(&mut self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        self.next_id += 1;
        let mut choice = json!({"index": 0, "delta": delta});
        if let Some(reason) = finish_reason {
            choice["finish_reason"] = json!(reason);
        }
        let frame = json!({
            "id": format!("chatcmpl-{}", self.next_id),
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [choice],
        });
        Bytes::from(format!("data: {}\n\n", frame))
    }

    fn content(&mut self, text: &str) -> Bytes {
        self.chunk(json!({"content": text}), None)
    }

    fn tool_call(&mut self, call: &ToolCall) -> Bytes {
        self.chunk(json!({"tool_calls": [call]}), None)
    }

    fn finish(&mut self) -> Bytes {
        let last = self.chunk(json!({}), Some("stop"));
        let mut out = last.to_vec();
        out.extend_from_slice(b"data: [DONE]\n\n");
        Bytes::from(out)
    }
}

/// Turn an upstream event-stream body into OpenAI SSE.
pub fn transcode_to_sse(upstream: ByteStream, model: String) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut upstream = upstream;
        let mut decoder = EventStreamDecoder::default();
        let mut tools = ToolUseTracker::default();
        let mut encoder = SseEncoder::new(model);

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            for payload in decoder.push(&chunk)? {
                match parse_event(&payload) {
                    Some(KiroEvent::Text(text)) => yield encoder.content(&text),
                    Some(KiroEvent::ToolUse { id, name, input, stop }) => {
                        if let Some(call) = tools.feed(&id, &name, &input, stop) {
                            yield encoder.tool_call(&call);
                        }
                    }
                    None => {}
                }
            }
        }

        yield encoder.finish();
    };
    stream.boxed()
}
