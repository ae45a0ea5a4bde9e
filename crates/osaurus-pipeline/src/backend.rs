//! The contract between the pipeline and an inference backend.
//!
//! Backends are external collaborators: MLX, a system foundation model, a
//! remote OpenAI-compatible provider. All the pipeline requires is "given a
//! request, yield a lazy sequence of token chunks plus optional structured
//! tool-invocation events, cancellable". [`ScriptedBackend`] is the
//! first-class stub used by tests and the `stub` provider.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use osaurus_core::{ChatRequest, UsageInfo};

use crate::error::PipelineError;

/// Why a backend stream ended, from the backend's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFinish {
    Stop,
    Length,
    Error(String),
}

/// One event off the raw backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A chunk of generated text, in generation order.
    TokenChunk(String),
    /// A structured tool call produced natively by the backend. Bypasses
    /// inline detection.
    NativeToolCall {
        name: String,
        arguments_json: String,
    },
    Usage(UsageInfo),
    Finish(BackendFinish),
}

/// A model id a backend can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
}

/// An inference backend the gateway can dispatch to.
///
/// `generate` returns the receiving half of an event channel; the backend
/// task must stop producing promptly when `cancel` fires (backends may sit
/// on blocking FFI, so cancellation is explicit rather than drop-based).
pub trait InferenceBackend: Send + Sync {
    /// Stable identifier, used in logs.
    fn id(&self) -> &str;

    /// Model ids this backend can serve right now.
    fn models(&self) -> Pin<Box<dyn Future<Output = Vec<ModelInfo>> + Send + '_>>;

    fn generate(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<BackendEvent>, PipelineError>> + Send + '_>,
    >;
}

/// Backend that replays a canned event script.
///
/// Used for deterministic pipeline tests and as the `stub` provider so the
/// server runs end-to-end without an inference runtime.
pub struct ScriptedBackend {
    model_id: String,
    script: Vec<BackendEvent>,
    /// Pause between events, to exercise cancellation mid-stream.
    pace: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(model_id: impl Into<String>, script: Vec<BackendEvent>) -> Self {
        Self {
            model_id: model_id.into(),
            script,
            pace: None,
        }
    }

    /// A backend that streams `text` one whitespace-separated token at a
    /// time and finishes cleanly.
    pub fn speaking(model_id: impl Into<String>, text: &str) -> Self {
        let mut script: Vec<BackendEvent> = text
            .split_inclusive(' ')
            .map(|t| BackendEvent::TokenChunk(t.to_string()))
            .collect();
        script.push(BackendEvent::Finish(BackendFinish::Stop));
        Self::new(model_id, script)
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

impl InferenceBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> Pin<Box<dyn Future<Output = Vec<ModelInfo>> + Send + '_>> {
        let model = ModelInfo {
            id: self.model_id.clone(),
        };
        Box::pin(async move { vec![model] })
    }

    fn generate(
        &self,
        _request: ChatRequest,
        cancel: CancellationToken,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<BackendEvent>, PipelineError>> + Send + '_>,
    > {
        let script = self.script.clone();
        let pace = self.pace;
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in script {
                    if let Some(pace) = pace {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(pace) => {}
                        }
                    } else if cancel.is_cancelled() {
                        return;
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        })
    }
}
