//! Ollama codec: NDJSON streaming, `/tags` and `/show` shapes.

use serde::Deserialize;

use osaurus_core::{
    ChatRequest, CoreError, Dialect, FinishReason, GenParams, Message, Role, ToolChoice, ToolSpec,
    UsageInfo,
};

// ── Decode ──

#[derive(Debug, Deserialize)]
pub struct OllamaChatRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<OllamaMessage>,
    /// Ollama streams unless told otherwise.
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: OllamaOptions,
    #[serde(default)]
    pub tools: Vec<OllamaTool>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OllamaOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// Ollama's name for max_tokens.
    pub num_predict: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// Ollama reuses the OpenAI function-tool shape.
#[derive(Debug, Deserialize)]
pub struct OllamaTool {
    pub function: OllamaFunctionDef,
}

#[derive(Debug, Deserialize)]
pub struct OllamaFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

pub fn decode(request: OllamaChatRequest) -> Result<ChatRequest, CoreError> {
    let mut messages = Vec::with_capacity(request.messages.len());
    for message in request.messages {
        let role = match message.role.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => {
                return Err(CoreError::InvalidRequest(format!(
                    "unknown role: {other}"
                )));
            }
        };
        messages.push(Message::new(role, message.content));
    }

    let tools = request
        .tools
        .into_iter()
        .map(|t| {
            ToolSpec::builtin(
                t.function.name,
                t.function.description.unwrap_or_default(),
                t.function.parameters,
            )
        })
        .collect();

    Ok(ChatRequest {
        model_id: request.model.unwrap_or_else(|| "default".into()),
        messages,
        params: GenParams {
            temperature: request.options.temperature,
            max_tokens: request.options.num_predict,
            top_p: request.options.top_p,
            frequency_penalty: None,
            presence_penalty: None,
            stop: request.options.stop,
            stream: request.stream.unwrap_or(true),
            n: 1,
            session_id: None,
        },
        tools,
        tool_choice: ToolChoice::Auto,
        dialect: Dialect::Ollama,
    })
}

// ── Encode ──

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// One in-progress NDJSON line.
pub fn content_line(model: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "created_at": timestamp(),
        "message": { "role": "assistant", "content": text },
        "done": false,
    })
}

/// The terminal NDJSON line. Fires even when the stream ends on a tool
/// call, since tool deltas are not part of this dialect.
pub fn final_line(model: &str, reason: FinishReason, usage: Option<UsageInfo>) -> serde_json::Value {
    let mut line = serde_json::json!({
        "model": model,
        "created_at": timestamp(),
        "message": { "role": "assistant", "content": "" },
        "done": true,
        "done_reason": match reason {
            FinishReason::Length => "length",
            _ => "stop",
        },
    });
    if let Some(usage) = usage {
        line["prompt_eval_count"] = usage.prompt_tokens.into();
        line["eval_count"] = usage.completion_tokens.into();
    }
    line
}

/// Aggregated non-streaming body.
pub fn chat_response(
    model: &str,
    content: &str,
    reason: FinishReason,
    usage: Option<UsageInfo>,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "created_at": timestamp(),
        "message": { "role": "assistant", "content": content },
        "done": true,
        "done_reason": match reason {
            FinishReason::Length => "length",
            _ => "stop",
        },
    });
    if let Some(usage) = usage {
        body["prompt_eval_count"] = usage.prompt_tokens.into();
        body["eval_count"] = usage.completion_tokens.into();
    }
    body
}

/// `GET /tags` body.
pub fn tags_response(ids: &[String]) -> serde_json::Value {
    serde_json::json!({
        "models": ids.iter().map(|id| serde_json::json!({
            "name": id,
            "model": id,
            "modified_at": timestamp(),
            "size": 0,
            "digest": "",
            "details": { "family": "osaurus", "format": "dylib" },
        })).collect::<Vec<_>>(),
    })
}

/// `POST /show` body for one model.
pub fn show_response(id: &str) -> serde_json::Value {
    serde_json::json!({
        "modelfile": "",
        "parameters": "",
        "template": "",
        "details": {
            "family": "osaurus",
            "parameter_size": "",
            "quantization_level": "",
        },
        "model_info": { "general.name": id },
    })
}
