use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::schema::CompiledSchema;
use crate::tool::{CallerContext, PermissionPolicy, ToolSpec};

/// Executes one tool invocation.
///
/// Handlers are invoked outside the registry lock and may run concurrently
/// with each other and with registration.
pub trait ToolHandler: Send + Sync {
    fn invoke<'a>(
        &'a self,
        arguments_json: &'a str,
        ctx: &'a CallerContext,
    ) -> Pin<Box<dyn Future<Output = Result<String, CoreError>> + Send + 'a>>;
}

/// Adapter turning a plain closure into a [`ToolHandler`]. Handy for
/// builtins and tests.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&str, &CallerContext) -> Result<String, CoreError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(&str, &CallerContext) -> Result<String, CoreError> + Send + Sync,
{
    fn invoke<'a>(
        &'a self,
        arguments_json: &'a str,
        ctx: &'a CallerContext,
    ) -> Pin<Box<dyn Future<Output = Result<String, CoreError>> + Send + 'a>> {
        let result = (self.0)(arguments_json, ctx);
        Box::pin(async move { result })
    }
}

/// Decides whether an `ask`-gated invocation may proceed.
pub trait ApprovalHook: Send + Sync {
    fn approve<'a>(
        &'a self,
        spec: &'a ToolSpec,
        arguments_json: &'a str,
        ctx: &'a CallerContext,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CoreError>> + Send + 'a>>;
}

struct RegisteredTool {
    spec: ToolSpec,
    schema: Arc<CompiledSchema>,
    handler: Arc<dyn ToolHandler>,
}

/// Process-wide name → tool map with policy enforcement and argument
/// validation.
///
/// # Locking
///
/// The registry lock is a leaf: `execute` clones the handler, spec, and
/// compiled schema out of the map and releases the lock before any policy
/// hook or handler runs, so tool code can never deadlock against
/// registration. Writes (register/unregister) are serialized by the write
/// lock; `list` takes a snapshot.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    approval: RwLock<Option<Arc<dyn ApprovalHook>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            approval: RwLock::new(None),
        }
    }

    /// Install the hook consulted for `ask`-gated tools.
    pub async fn set_approval_hook(&self, hook: Arc<dyn ApprovalHook>) {
        *self.approval.write().await = Some(hook);
    }

    /// Register a tool. Fails with `DuplicateName` on collision.
    pub async fn register(
        &self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), CoreError> {
        let mut tools = self.tools.write().await;
        if tools.contains_key(&spec.name) {
            return Err(CoreError::DuplicateName(spec.name));
        }
        let schema = Arc::new(CompiledSchema::compile(&spec.name, &spec.parameters));
        tracing::debug!(tool_name = %spec.name, "Tool registered");
        tools.insert(
            spec.name.clone(),
            RegisteredTool {
                spec,
                schema,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a tool. Idempotent; unregistering an absent name is a no-op.
    pub async fn unregister(&self, name: &str) {
        let mut tools = self.tools.write().await;
        if tools.remove(name).is_some() {
            tracing::debug!(tool_name = name, "Tool unregistered");
        }
    }

    /// Snapshot of all registered tool specs, sorted by name.
    pub async fn list(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().await;
        let mut specs: Vec<ToolSpec> = tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Invoke a tool by name, enforcing its permission policy and validating
    /// `arguments_json` against its parameter schema.
    pub async fn execute(
        &self,
        name: &str,
        arguments_json: &str,
        ctx: &CallerContext,
    ) -> Result<String, CoreError> {
        // Clone what we need, then release the lock before calling out.
        let (spec, schema, handler) = {
            let tools = self.tools.read().await;
            let tool = tools
                .get(name)
                .ok_or_else(|| CoreError::UnknownTool(name.to_string()))?;
            (
                tool.spec.clone(),
                Arc::clone(&tool.schema),
                Arc::clone(&tool.handler),
            )
        };

        match spec.permission_policy {
            PermissionPolicy::Deny => {
                return Err(CoreError::PolicyDenied {
                    tool: name.to_string(),
                    reason: "tool policy is deny".into(),
                });
            }
            PermissionPolicy::Ask => {
                if !ctx.auto_approves() {
                    let hook = self.approval.read().await.clone();
                    match hook {
                        Some(hook) => {
                            let approved = hook.approve(&spec, arguments_json, ctx).await?;
                            if !approved {
                                return Err(CoreError::PolicyDenied {
                                    tool: name.to_string(),
                                    reason: "approval denied".into(),
                                });
                            }
                        }
                        None => {
                            return Err(CoreError::PolicyDenied {
                                tool: name.to_string(),
                                reason: "approval required but no approver configured".into(),
                            });
                        }
                    }
                }
            }
            PermissionPolicy::Auto => {}
        }

        schema.check(name, arguments_json)?;

        tracing::debug!(
            tool_name = name,
            batch_id = ?ctx.batch_id,
            "Invoking tool"
        );
        handler.invoke(arguments_json, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
