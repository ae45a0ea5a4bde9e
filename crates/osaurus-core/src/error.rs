use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("duplicate tool name: {0}")]
    DuplicateName(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("policy denied for tool '{tool}': {reason}")]
    PolicyDenied { tool: String, reason: String },

    #[error("invalid arguments for tool '{tool}': {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("tool '{tool}' failed: {detail}")]
    ToolFailed { tool: String, detail: String },

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// HTTP status this error maps to when it surfaces before any response
    /// byte has been written. Mid-stream errors never change the status.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::InvalidRequest(_)
            | CoreError::InvalidArguments { .. }
            | CoreError::DuplicateName(_)
            | CoreError::Json(_) => 400,
            CoreError::PolicyDenied { .. } => 403,
            CoreError::UnknownModel(_) | CoreError::UnknownTool(_) => 404,
            CoreError::ToolFailed { .. } => 500,
            CoreError::UpstreamFailure(_) => 502,
            CoreError::Timeout(_) => 504,
        }
    }
}
