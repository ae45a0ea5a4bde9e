//! Streaming generation pipeline for Osaurus.
//!
//! The pipeline sits between an inference backend and a response writer. It
//! consumes raw [`BackendEvent`]s, maintains a bounded rolling window of the
//! generated text, truncates at stop sequences, detects tool calls embedded
//! in model output, and emits a well-formed sequence of
//! [`GenerationEvent`](osaurus_core::GenerationEvent)s:
//!
//! ```text
//! RoleStart (ContentDelta | ToolCallDelta)* [Usage] Finish
//! ```
//!
//! Cancellation flows both ways through one shared
//! [`CancellationToken`](tokio_util::sync::CancellationToken): the writer
//! cancels when the client disconnects, and the pipeline cancels the backend
//! when a stop sequence or tool call ends the stream early.

pub mod backend;
pub mod buffer;
pub mod detect;
pub mod error;
pub mod pipeline;
pub mod think;

pub use backend::{BackendEvent, BackendFinish, InferenceBackend, ModelInfo, ScriptedBackend};
pub use error::PipelineError;
pub use pipeline::{PipelineOptions, run};
