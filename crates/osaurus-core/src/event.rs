use serde::{Deserialize, Serialize};

use crate::request::Role;

/// Token counts reported by a backend for one completed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Why a generation stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

impl FinishReason {
    /// The OpenAI-style `finish_reason` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
        }
    }

    /// The Anthropic `stop_reason` string for the same outcome.
    pub fn anthropic_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
            FinishReason::Error => "error",
        }
    }
}

/// Dialect-neutral unit of a streamed response.
///
/// The pipeline produces these; the response writers re-encode them per wire
/// protocol. A well-formed stream matches
/// `RoleStart (ContentDelta | ToolCallDelta)* [Usage] Finish`.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Opens the stream. Emitted exactly once, before any content.
    RoleStart { role: Role },
    /// A chunk of assistant text. Never empty; append-only.
    ContentDelta { text: String },
    /// A structured chunk of a tool invocation request. `index` is stable
    /// for the lifetime of one call.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Token accounting. At most once, immediately before `Finish`.
    Usage(UsageInfo),
    /// Closes the stream. Emitted exactly once. `diagnostic` is set when
    /// `reason == Error`.
    Finish {
        reason: FinishReason,
        diagnostic: Option<String>,
    },
}

impl GenerationEvent {
    pub fn is_finish(&self) -> bool {
        matches!(self, GenerationEvent::Finish { .. })
    }

    pub fn content_delta(text: impl Into<String>) -> Self {
        GenerationEvent::ContentDelta { text: text.into() }
    }

    pub fn finish(reason: FinishReason) -> Self {
        GenerationEvent::Finish {
            reason,
            diagnostic: None,
        }
    }

    pub fn error(diagnostic: impl Into<String>) -> Self {
        GenerationEvent::Finish {
            reason: FinishReason::Error,
            diagnostic: Some(diagnostic.into()),
        }
    }
}
