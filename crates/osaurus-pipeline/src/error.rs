use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend rejected request: {0}")]
    BackendRequest(String),

    #[error("generation cancelled")]
    Cancelled,
}
