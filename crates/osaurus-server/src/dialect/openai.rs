//! OpenAI chat-completions codec.

use serde::Deserialize;

use osaurus_core::{
    ChatRequest, CoreError, Dialect, FinishReason, GenParams, Message, Role, ToolCall, ToolChoice,
    ToolSpec, UsageInfo,
};

// ── Decode ──

#[derive(Debug, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: Option<String>,
    pub messages: Vec<OpenAiMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub stop: Option<StopField>,
    #[serde(default)]
    pub stream: bool,
    pub n: Option<u32>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<OpenAiTool>,
    pub tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAiContent>,
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAiToolCall>,
}

/// `content` is either a plain string or an ordered list of parts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
    pub input_text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiTool {
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// Flatten a content field to plain text: lists concatenate their text
/// parts in order and drop everything else.
fn flatten_content(content: Option<OpenAiContent>) -> String {
    match content {
        None => String::new(),
        Some(OpenAiContent::Text(text)) => text,
        Some(OpenAiContent::Parts(parts)) => parts
            .into_iter()
            .filter_map(|p| match p.kind.as_str() {
                "text" | "input_text" => p.text.or(p.input_text),
                _ => None,
            })
            .collect(),
    }
}

fn parse_role(role: &str) -> Result<Role, CoreError> {
    match role {
        "system" | "developer" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(CoreError::InvalidRequest(format!("unknown role: {other}"))),
    }
}

fn parse_tool_choice(choice: Option<serde_json::Value>) -> ToolChoice {
    match choice {
        None => ToolChoice::Auto,
        Some(serde_json::Value::String(s)) if s == "none" => ToolChoice::None,
        Some(serde_json::Value::String(_)) => ToolChoice::Auto,
        Some(value) => value["function"]["name"]
            .as_str()
            .map(|name| ToolChoice::Named(name.to_string()))
            .unwrap_or(ToolChoice::Auto),
    }
}

pub fn decode(request: OpenAiChatRequest) -> Result<ChatRequest, CoreError> {
    let mut messages = Vec::with_capacity(request.messages.len());
    for message in request.messages {
        let role = parse_role(&message.role)?;
        messages.push(Message {
            role,
            content: flatten_content(message.content),
            tool_call_id: message.tool_call_id,
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments_json: tc.function.arguments,
                })
                .collect(),
        });
    }

    let stop = match request.stop {
        None => Vec::new(),
        Some(StopField::One(s)) => vec![s],
        Some(StopField::Many(many)) => many,
    };

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
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop,
            stream: request.stream,
            n: request.n.unwrap_or(1).max(1),
            session_id: request.session_id,
        },
        tools,
        tool_choice: parse_tool_choice(request.tool_choice),
        dialect: Dialect::OpenAi,
    })
}

// ── Encode ──

/// Identity shared by all chunks of one streamed completion.
pub struct CompletionIdentity {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl CompletionIdentity {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn chunk(&self, delta: serde_json::Value, finish_reason: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    /// First chunk: role and empty content.
    pub fn role_chunk(&self) -> serde_json::Value {
        self.chunk(
            serde_json::json!({ "role": "assistant", "content": "" }),
            None,
        )
    }

    pub fn content_chunk(&self, text: &str) -> serde_json::Value {
        self.chunk(serde_json::json!({ "content": text }), None)
    }

    pub fn tool_call_chunk(
        &self,
        index: usize,
        call_id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> serde_json::Value {
        let mut call = serde_json::json!({ "index": index, "type": "function", "function": {} });
        if let Some(id) = call_id {
            call["id"] = id.into();
        }
        if let Some(name) = name {
            call["function"]["name"] = name.into();
        }
        if let Some(arguments) = arguments {
            call["function"]["arguments"] = arguments.into();
        }
        self.chunk(serde_json::json!({ "tool_calls": [call] }), None)
    }

    /// Final chunk; usage rides here when the backend reported it.
    pub fn finish_chunk(
        &self,
        reason: FinishReason,
        usage: Option<UsageInfo>,
    ) -> serde_json::Value {
        let mut chunk = self.chunk(serde_json::json!({}), Some(reason.as_str()));
        if let Some(usage) = usage {
            chunk["usage"] = usage_json(&usage);
        }
        chunk
    }

    /// Aggregated non-streaming response.
    pub fn completion(
        &self,
        content: &str,
        tool_calls: &[ToolCall],
        reason: FinishReason,
        usage: Option<UsageInfo>,
    ) -> serde_json::Value {
        let mut message = serde_json::json!({ "role": "assistant", "content": content });
        if !tool_calls.is_empty() {
            message["tool_calls"] = tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments_json },
                    })
                })
                .collect();
        }
        let mut response = serde_json::json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": reason.as_str(),
            }],
        });
        if let Some(usage) = usage {
            response["usage"] = usage_json(&usage);
        }
        response
    }
}

fn usage_json(usage: &UsageInfo) -> serde_json::Value {
    serde_json::json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.prompt_tokens + usage.completion_tokens,
    })
}

/// `GET /models` body.
pub fn models_response(ids: &[String]) -> serde_json::Value {
    serde_json::json!({
        "object": "list",
        "data": ids.iter().map(|id| serde_json::json!({
            "id": id,
            "object": "model",
            "owned_by": "osaurus",
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(body: &str) -> ChatRequest {
        decode(serde_json::from_str(body).unwrap()).unwrap()
    }

    #[test]
    fn decodes_string_content() {
        let req = minimal(r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#);
        assert_eq!(req.model_id, "m");
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[0].content, "hi");
        assert!(!req.params.stream);
        assert_eq!(req.dialect, Dialect::OpenAi);
    }

    #[test]
    fn concatenates_text_parts_and_drops_the_rest() {
        let req = minimal(
            r#"{"messages":[{"role":"user","content":[
                {"type":"text","text":"a"},
                {"type":"image_url","text":"IGNORED"},
                {"type":"input_text","input_text":"b"}
            ]}]}"#,
        );
        assert_eq!(req.messages[0].content, "ab");
        assert_eq!(req.model_id, "default");
    }

    #[test]
    fn stop_accepts_string_or_list() {
        let req = minimal(r#"{"messages":[],"stop":"END"}"#);
        assert_eq!(req.params.stop, vec!["END"]);
        let req = minimal(r#"{"messages":[],"stop":["a","b"]}"#);
        assert_eq!(req.params.stop, vec!["a", "b"]);
    }

    #[test]
    fn tool_choice_variants() {
        let req = minimal(r#"{"messages":[],"tool_choice":"auto"}"#);
        assert_eq!(req.tool_choice, ToolChoice::Auto);
        let req = minimal(r#"{"messages":[],"tool_choice":"none"}"#);
        assert_eq!(req.tool_choice, ToolChoice::None);
        let req = minimal(
            r#"{"messages":[],"tool_choice":{"type":"function","function":{"name":"f"}}}"#,
        );
        assert_eq!(req.tool_choice, ToolChoice::Named("f".into()));
    }

    #[test]
    fn n_is_clamped_to_one_choice() {
        let req = minimal(r#"{"messages":[],"n":4}"#);
        assert_eq!(req.params.n, 4); // carried, but only choice 0 is ever emitted
    }

    #[test]
    fn unknown_role_is_invalid_request() {
        let parsed: OpenAiChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"wizard","content":"x"}]}"#).unwrap();
        assert!(matches!(decode(parsed), Err(CoreError::InvalidRequest(_))));
    }

    #[test]
    fn tool_declarations_become_specs() {
        let req = minimal(
            r#"{"messages":[],"tools":[{"type":"function","function":{
                "name":"get_weather","description":"d",
                "parameters":{"type":"object","properties":{"city":{"type":"string"}}}
            }}]}"#,
        );
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.tools[0].name, "get_weather");
        assert_eq!(req.tools[0].parameters["type"], "object");
    }

    #[test]
    fn role_chunk_carries_empty_content() {
        let identity = CompletionIdentity::new("m");
        let chunk = identity.role_chunk();
        assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "");
        assert!(chunk["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn finish_chunk_attaches_usage() {
        let identity = CompletionIdentity::new("m");
        let chunk = identity.finish_chunk(
            FinishReason::Stop,
            Some(UsageInfo {
                prompt_tokens: 2,
                completion_tokens: 3,
            }),
        );
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunk["usage"]["total_tokens"], 5);
    }

    #[test]
    fn completion_includes_tool_calls() {
        let identity = CompletionIdentity::new("m");
        let call = ToolCall {
            id: "call_1".into(),
            name: "f".into(),
            arguments_json: "{}".into(),
        };
        let body = identity.completion("", &[call], FinishReason::ToolCalls, None);
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "f"
        );
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    }
}
