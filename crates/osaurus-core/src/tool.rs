use serde::{Deserialize, Serialize};

use crate::request::Dialect;

/// Per-tool gate applied by the registry before every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    /// Invoke without asking.
    #[default]
    Auto,
    /// Route through the configured approval hook first.
    Ask,
    /// Never invoke.
    Deny,
}

/// Where a tool came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Provenance {
    #[default]
    Builtin,
    ExternalPlugin { plugin_id: String, version: String },
    RemoteMcp { provider_id: String },
}

/// Declaration of one invocable tool.
///
/// `parameters` is a JSON-Schema-shaped value describing the arguments
/// object. Names are unique process-wide; the plugin loader namespaces
/// colliding names as `<plugin_id>.<tool_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub permission_policy: PermissionPolicy,
    #[serde(default)]
    pub provenance: Provenance,
}

impl ToolSpec {
    pub fn builtin(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            permission_policy: PermissionPolicy::Auto,
            provenance: Provenance::Builtin,
        }
    }
}

/// A model's request to invoke a tool.
///
/// Arguments are always carried as a serialized JSON string (the OpenAI
/// convention); structured arguments are serialized before transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

impl ToolCall {
    /// A call with a fresh process-unique id in the OpenAI `call_…` shape.
    pub fn fresh(name: impl Into<String>, arguments_json: impl Into<String>) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments_json: arguments_json.into(),
        }
    }
}

/// Who is asking for a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSource {
    /// A chat request on one of the wire dialects.
    Http(Dialect),
    /// The MCP surface (stdio or HTTP). MCP has no approval UI, so `ask`
    /// tools proceed as if approved.
    Mcp,
    /// A step inside a running batch.
    Batch,
}

/// Invocation-time metadata handed to every tool handler.
///
/// Explicit rather than ambient: there is no task-local state to fish ids
/// out of. The batch tool threads its batch id through here so plugin tools
/// can correlate the steps of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub request_id: Option<String>,
    pub batch_id: Option<String>,
    pub source: CallSource,
}

impl CallerContext {
    pub fn http(dialect: Dialect) -> Self {
        Self {
            request_id: Some(format!("req_{}", uuid::Uuid::new_v4().simple())),
            batch_id: None,
            source: CallSource::Http(dialect),
        }
    }

    pub fn mcp() -> Self {
        Self {
            request_id: Some(format!("req_{}", uuid::Uuid::new_v4().simple())),
            batch_id: None,
            source: CallSource::Mcp,
        }
    }

    /// Derive the context for one step of a batch, preserving the request id.
    pub fn batch_step(&self, batch_id: &str) -> Self {
        Self {
            request_id: self.request_id.clone(),
            batch_id: Some(batch_id.to_string()),
            source: CallSource::Batch,
        }
    }

    /// Whether `ask`-gated tools may proceed without consulting a hook.
    pub fn auto_approves(&self) -> bool {
        matches!(self.source, CallSource::Mcp)
    }
}
