//! The JSON manifest a plugin returns from `get_manifest`.

use serde::{Deserialize, Serialize};

use osaurus_core::PermissionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub tools: Vec<ToolDecl>,
}

/// One tool a plugin declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON-Schema-shaped description of the arguments object.
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub requirements: Option<serde_json::Value>,
    #[serde(default)]
    pub permission_policy: PermissionPolicy,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}
