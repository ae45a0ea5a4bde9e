//! The registry-level `batch` tool: run a bounded sequence of tool
//! invocations in one call, continuing past individual failures.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use serde::Deserialize;

use crate::error::CoreError;
use crate::registry::{ToolHandler, ToolRegistry};
use crate::tool::{CallerContext, ToolSpec};

pub const BATCH_TOOL_NAME: &str = "batch";

/// Most operations one batch may carry.
pub const MAX_BATCH_OPERATIONS: usize = 30;

/// Tools that may never run inside a batch. Shell execution is excluded
/// because a batch hides its steps from the approval surface; the batch
/// tool excludes itself to keep execution depth bounded.
const BATCH_DENYLIST: &[&str] = &[BATCH_TOOL_NAME, "shell_exec", "execute_shell"];

#[derive(Debug, Deserialize)]
struct BatchArgs {
    operations: Vec<BatchOperation>,
}

#[derive(Debug, Deserialize)]
struct BatchOperation {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

struct BatchHandler {
    // Weak: the registry owns this handler; a strong reference back would
    // keep both alive forever.
    registry: Weak<ToolRegistry>,
}

impl ToolHandler for BatchHandler {
    fn invoke<'a>(
        &'a self,
        arguments_json: &'a str,
        ctx: &'a CallerContext,
    ) -> Pin<Box<dyn Future<Output = Result<String, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let registry = self.registry.upgrade().ok_or_else(|| CoreError::ToolFailed {
                tool: BATCH_TOOL_NAME.into(),
                detail: "registry is gone".into(),
            })?;

            let args: BatchArgs =
                serde_json::from_str(arguments_json).map_err(|e| CoreError::InvalidArguments {
                    tool: BATCH_TOOL_NAME.into(),
                    detail: e.to_string(),
                })?;

            if args.operations.len() > MAX_BATCH_OPERATIONS {
                return Err(CoreError::InvalidArguments {
                    tool: BATCH_TOOL_NAME.into(),
                    detail: format!(
                        "batch carries {} operations; the limit is {MAX_BATCH_OPERATIONS}",
                        args.operations.len()
                    ),
                });
            }

            let batch_id = format!("batch_{}", uuid::Uuid::new_v4().simple());
            let step_ctx = ctx.batch_step(&batch_id);

            tracing::info!(
                batch_id,
                operations = args.operations.len(),
                "Starting batch"
            );

            let mut results = Vec::with_capacity(args.operations.len());
            for op in &args.operations {
                let step = run_step(&registry, op, &step_ctx).await;
                results.push(match step {
                    Ok(result) => serde_json::json!({
                        "tool": op.tool,
                        "ok": true,
                        "result": result,
                    }),
                    Err(e) => serde_json::json!({
                        "tool": op.tool,
                        "ok": false,
                        "error": e.to_string(),
                    }),
                });
            }

            Ok(serde_json::json!({
                "batch_id": batch_id,
                "results": results,
            })
            .to_string())
        })
    }
}

async fn run_step(
    registry: &ToolRegistry,
    op: &BatchOperation,
    ctx: &CallerContext,
) -> Result<String, CoreError> {
    if BATCH_DENYLIST.contains(&op.tool.as_str()) {
        return Err(CoreError::PolicyDenied {
            tool: op.tool.clone(),
            reason: "tool may not run inside a batch".into(),
        });
    }
    let step_args = match &op.args {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    registry.execute(&op.tool, &step_args, ctx).await
}

/// Register the batch tool on `registry`.
pub async fn register_batch_tool(registry: &Arc<ToolRegistry>) -> Result<(), CoreError> {
    let spec = ToolSpec::builtin(
        BATCH_TOOL_NAME,
        "Execute up to 30 tool operations in sequence, reporting a per-step result",
        serde_json::json!({
            "type": "object",
            "properties": {
                "operations": {
                    "type": "array",
                    "maxItems": MAX_BATCH_OPERATIONS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool": { "type": "string" },
                            "args": { "type": "object" }
                        },
                        "required": ["tool"]
                    }
                }
            },
            "required": ["operations"]
        }),
    );
    registry
        .register(
            spec,
            Arc::new(BatchHandler {
                registry: Arc::downgrade(registry),
            }),
        )
        .await
}
