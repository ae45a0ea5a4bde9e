//! Anthropic Messages codec.
//!
//! The decoder flattens content blocks into the internal message shape; the
//! encoder produces the event-typed SSE taxonomy (`message_start` →
//! `content_block_*` → `message_delta` → `message_stop`).

use serde::Deserialize;

use osaurus_core::{
    ChatRequest, CoreError, Dialect, FinishReason, GenParams, Message, Role, ToolCall, ToolChoice,
    ToolSpec, UsageInfo,
};

// ── Decode ──

#[derive(Debug, Deserialize)]
pub struct AnthropicRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<SystemField>,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
    pub tool_choice: Option<serde_json::Value>,
    pub metadata: Option<AnthropicMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMetadata {
    pub user_id: Option<String>,
}

/// `system` is a string or a list of text blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SystemField {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

fn system_text(system: SystemField) -> String {
    match system {
        SystemField::Text(text) => text,
        SystemField::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect(),
    }
}

/// Flatten one Anthropic message into internal messages. `tool_result`
/// blocks become their own `role: tool` messages.
fn flatten_message(message: AnthropicMessage) -> Result<Vec<Message>, CoreError> {
    let role = match message.role.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(CoreError::InvalidRequest(format!(
                "unknown role: {other}"
            )));
        }
    };

    let blocks = match message.content {
        AnthropicContent::Text(text) => return Ok(vec![Message::new(role, text)]),
        AnthropicContent::Blocks(blocks) => blocks,
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut out = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments_json: input.to_string(),
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                let rendered = match content {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                out.push(Message {
                    role: Role::Tool,
                    content: rendered,
                    tool_call_id: Some(tool_use_id),
                    tool_calls: Vec::new(),
                });
            }
            ContentBlock::Unsupported => {}
        }
    }

    if !text.is_empty() || !tool_calls.is_empty() || out.is_empty() {
        out.insert(
            0,
            Message {
                role,
                content: text,
                tool_call_id: None,
                tool_calls,
            },
        );
    }
    Ok(out)
}

fn parse_tool_choice(choice: Option<serde_json::Value>) -> ToolChoice {
    match choice {
        None => ToolChoice::Auto,
        Some(value) => match value["type"].as_str() {
            Some("none") => ToolChoice::None,
            Some("tool") => value["name"]
                .as_str()
                .map(|n| ToolChoice::Named(n.to_string()))
                .unwrap_or(ToolChoice::Auto),
            _ => ToolChoice::Auto,
        },
    }
}

pub fn decode(request: AnthropicRequest) -> Result<ChatRequest, CoreError> {
    let mut messages = Vec::new();
    if let Some(system) = request.system {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(Message::new(Role::System, text));
        }
    }
    for message in request.messages {
        messages.extend(flatten_message(message)?);
    }

    let tools = request
        .tools
        .into_iter()
        .map(|t| {
            ToolSpec::builtin(
                t.name,
                t.description.unwrap_or_default(),
                t.input_schema,
            )
        })
        .collect();

    Ok(ChatRequest {
        model_id: request.model.unwrap_or_else(|| "default".into()),
        messages,
        params: GenParams {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            frequency_penalty: None,
            presence_penalty: None,
            stop: request.stop_sequences,
            stream: request.stream,
            n: 1,
            session_id: request.metadata.and_then(|m| m.user_id),
        },
        tools,
        tool_choice: parse_tool_choice(request.tool_choice),
        dialect: Dialect::Anthropic,
    })
}

// ── Encode ──

/// One SSE frame: `event: <name>\ndata: <json>\n\n`.
pub struct AnthropicEvent {
    pub name: &'static str,
    pub data: serde_json::Value,
}

pub struct MessageIdentity {
    pub id: String,
    pub model: String,
}

impl MessageIdentity {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
        }
    }

    pub fn message_start(&self) -> AnthropicEvent {
        AnthropicEvent {
            name: "message_start",
            data: serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                },
            }),
        }
    }

    pub fn text_block_start(&self, index: usize) -> AnthropicEvent {
        AnthropicEvent {
            name: "content_block_start",
            data: serde_json::json!({
                "type": "content_block_start",
                "index": index,
                "content_block": { "type": "text", "text": "" },
            }),
        }
    }

    pub fn text_delta(&self, index: usize, text: &str) -> AnthropicEvent {
        AnthropicEvent {
            name: "content_block_delta",
            data: serde_json::json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "text_delta", "text": text },
            }),
        }
    }

    pub fn tool_block_start(&self, index: usize, call_id: &str, name: &str) -> AnthropicEvent {
        AnthropicEvent {
            name: "content_block_start",
            data: serde_json::json!({
                "type": "content_block_start",
                "index": index,
                "content_block": { "type": "tool_use", "id": call_id, "name": name, "input": {} },
            }),
        }
    }

    pub fn input_json_delta(&self, index: usize, partial_json: &str) -> AnthropicEvent {
        AnthropicEvent {
            name: "content_block_delta",
            data: serde_json::json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "input_json_delta", "partial_json": partial_json },
            }),
        }
    }

    pub fn block_stop(&self, index: usize) -> AnthropicEvent {
        AnthropicEvent {
            name: "content_block_stop",
            data: serde_json::json!({ "type": "content_block_stop", "index": index }),
        }
    }

    pub fn message_delta(
        &self,
        reason: FinishReason,
        usage: Option<UsageInfo>,
    ) -> AnthropicEvent {
        AnthropicEvent {
            name: "message_delta",
            data: serde_json::json!({
                "type": "message_delta",
                "delta": { "stop_reason": reason.anthropic_str(), "stop_sequence": null },
                "usage": { "output_tokens": usage.map(|u| u.completion_tokens).unwrap_or(0) },
            }),
        }
    }

    pub fn message_stop(&self) -> AnthropicEvent {
        AnthropicEvent {
            name: "message_stop",
            data: serde_json::json!({ "type": "message_stop" }),
        }
    }

    /// Aggregated non-streaming response body.
    pub fn message(
        &self,
        content: &str,
        tool_calls: &[ToolCall],
        reason: FinishReason,
        usage: Option<UsageInfo>,
    ) -> serde_json::Value {
        let mut blocks: Vec<serde_json::Value> = Vec::new();
        if !content.is_empty() || tool_calls.is_empty() {
            blocks.push(serde_json::json!({ "type": "text", "text": content }));
        }
        for call in tool_calls {
            let input: serde_json::Value =
                serde_json::from_str(&call.arguments_json).unwrap_or(serde_json::json!({}));
            blocks.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": input,
            }));
        }
        serde_json::json!({
            "id": self.id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": blocks,
            "stop_reason": reason.anthropic_str(),
            "stop_sequence": null,
            "usage": {
                "input_tokens": usage.map(|u| u.prompt_tokens).unwrap_or(0),
                "output_tokens": usage.map(|u| u.completion_tokens).unwrap_or(0),
            },
        })
    }
}
