use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolSpec};

/// Which wire protocol a request arrived on.
///
/// Carried through the whole request lifecycle so the response writer always
/// matches the decoder that produced the internal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Ollama,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::OpenAi => write!(f, "openai"),
            Dialect::Anthropic => write!(f, "anthropic"),
            Dialect::Ollama => write!(f, "ollama"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One turn of a conversation, already flattened to plain text.
///
/// Structured content parts are concatenated by the dialect codecs before
/// this type is constructed; non-text parts are dropped there.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on `role = tool` messages answering a prior tool call.
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool calls.
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Sampling and streaming parameters, dialect-neutral.
#[derive(Debug, Clone, PartialEq)]
pub struct GenParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    /// Stop sequences, in request order.
    pub stop: Vec<String>,
    pub stream: bool,
    /// Number of choices requested. Only 1 is honored.
    pub n: u32,
    /// Accepted for client compatibility; does not influence generation.
    pub session_id: Option<String>,
}

impl Default for GenParams {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: Vec::new(),
            stream: false,
            n: 1,
            session_id: None,
        }
    }
}

/// How the model is allowed to use tools on this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Named(String),
}

impl Default for ToolChoice {
    fn default() -> Self {
        ToolChoice::Auto
    }
}

/// The dialect-neutral chat request every codec decodes into.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Requested model. May be the sentinel `"foundation"` or `"default"`.
    pub model_id: String,
    pub messages: Vec<Message>,
    pub params: GenParams,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub dialect: Dialect,
}

impl ChatRequest {
    /// Tools the pipeline should watch for, honoring `tool_choice`.
    ///
    /// `None` disables detection entirely; `Named` narrows the watch set to
    /// the one named tool.
    pub fn active_tools(&self) -> Vec<ToolSpec> {
        match &self.tool_choice {
            ToolChoice::None => Vec::new(),
            ToolChoice::Auto => self.tools.clone(),
            ToolChoice::Named(name) => self
                .tools
                .iter()
                .filter(|t| &t.name == name)
                .cloned()
                .collect(),
        }
    }
}
