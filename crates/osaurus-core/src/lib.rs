//! Core types and tool execution for Osaurus.
//!
//! This crate carries the dialect-neutral request model every wire codec
//! decodes into, the generation events every response writer consumes, and
//! [`ToolRegistry`], the process-wide name → tool map with per-tool
//! permission policy and JSON-Schema argument validation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use osaurus_core::{CallerContext, ToolRegistry, ToolSpec};
//! use osaurus_core::registry::FnHandler;
//!
//! # async fn run() -> Result<(), osaurus_core::CoreError> {
//! let registry = Arc::new(ToolRegistry::new());
//! registry
//!     .register(
//!         ToolSpec::builtin("echo", "Echo the input back", serde_json::json!({
//!             "type": "object",
//!             "properties": { "msg": { "type": "string" } },
//!             "required": ["msg"]
//!         })),
//!         Arc::new(FnHandler::new(|args, _ctx| {
//!             let msg = serde_json::from_str::<serde_json::Value>(args)
//!                 .ok()
//!                 .and_then(|v| v["msg"].as_str().map(str::to_string))
//!                 .unwrap_or_default();
//!             Ok(msg)
//!         })),
//!     )
//!     .await?;
//!
//! let out = registry
//!     .execute("echo", r#"{"msg":"hi"}"#, &CallerContext::mcp())
//!     .await?;
//! assert_eq!(out, "hi");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod error;
pub mod event;
pub mod registry;
pub mod request;
pub mod schema;
pub mod tool;

pub use error::CoreError;
pub use event::{FinishReason, GenerationEvent, UsageInfo};
pub use registry::{ApprovalHook, ToolHandler, ToolRegistry};
pub use request::{ChatRequest, Dialect, GenParams, Message, Role, ToolChoice};
pub use tool::{CallSource, CallerContext, PermissionPolicy, Provenance, ToolCall, ToolSpec};
