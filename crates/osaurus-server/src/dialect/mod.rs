//! Wire codecs: each dialect decodes into the internal
//! [`ChatRequest`](osaurus_core::ChatRequest) and re-encodes the pipeline's
//! generation events in its own framing.

pub mod anthropic;
pub mod ollama;
pub mod openai;

use osaurus_core::{CoreError, Dialect};

/// The error body for one dialect. The OpenAI envelope is the fallback for
/// surfaces with no dialect of their own (direct MCP calls and the like).
pub fn error_envelope(dialect: Option<Dialect>, error: &CoreError) -> serde_json::Value {
    let message = error.to_string();
    match dialect {
        Some(Dialect::Anthropic) => serde_json::json!({
            "type": "error",
            "error": {
                "type": anthropic_error_type(error),
                "message": message,
            }
        }),
        Some(Dialect::Ollama) => serde_json::json!({ "error": message }),
        Some(Dialect::OpenAi) | None => serde_json::json!({
            "error": {
                "message": message,
                "type": openai_error_type(error),
                "code": null,
            }
        }),
    }
}

fn openai_error_type(error: &CoreError) -> &'static str {
    match error {
        CoreError::InvalidRequest(_)
        | CoreError::InvalidArguments { .. }
        | CoreError::DuplicateName(_)
        | CoreError::Json(_) => "invalid_request_error",
        CoreError::UnknownModel(_) | CoreError::UnknownTool(_) => "not_found_error",
        CoreError::PolicyDenied { .. } => "permission_error",
        CoreError::Timeout(_) => "timeout_error",
        _ => "api_error",
    }
}

fn anthropic_error_type(error: &CoreError) -> &'static str {
    match error {
        CoreError::InvalidRequest(_)
        | CoreError::InvalidArguments { .. }
        | CoreError::DuplicateName(_)
        | CoreError::Json(_) => "invalid_request_error",
        CoreError::UnknownModel(_) | CoreError::UnknownTool(_) => "not_found_error",
        CoreError::PolicyDenied { .. } => "permission_error",
        CoreError::UpstreamFailure(_) | CoreError::ToolFailed { .. } => "api_error",
        CoreError::Timeout(_) => "overloaded_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_matches_dialect() {
        let err = CoreError::UnknownModel("m".into());

        let openai = error_envelope(Some(Dialect::OpenAi), &err);
        assert!(openai["error"]["message"].is_string());
        assert_eq!(openai["error"]["type"], "not_found_error");

        let anthropic = error_envelope(Some(Dialect::Anthropic), &err);
        assert_eq!(anthropic["type"], "error");
        assert!(anthropic["error"]["message"].is_string());

        let ollama = error_envelope(Some(Dialect::Ollama), &err);
        assert!(ollama["error"].is_string());
    }

    #[test]
    fn unknown_dialect_uses_openai_envelope() {
        let err = CoreError::InvalidRequest("bad".into());
        let envelope = error_envelope(None, &err);
        assert_eq!(envelope["error"]["type"], "invalid_request_error");
    }
}
