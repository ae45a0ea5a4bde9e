//! Argument validation against a tool's declared parameter schema.

use crate::error::CoreError;

/// A parameter schema compiled once at registration time.
///
/// Compilation failures are tolerated: a tool whose declared schema is not
/// itself valid JSON Schema is registered without validation (the plugin
/// author's bug should not make the tool uncallable), with a warning logged.
pub struct CompiledSchema {
    validator: Option<jsonschema::Validator>,
}

impl CompiledSchema {
    pub fn compile(tool_name: &str, schema: &serde_json::Value) -> Self {
        match jsonschema::validator_for(schema) {
            Ok(validator) => Self {
                validator: Some(validator),
            },
            Err(e) => {
                tracing::warn!(
                    tool_name,
                    error = %e,
                    "Tool parameter schema does not compile; skipping argument validation"
                );
                Self { validator: None }
            }
        }
    }

    /// Parse `arguments_json` and validate it against the schema.
    ///
    /// Returns the parsed value so callers do not parse twice.
    pub fn check(
        &self,
        tool_name: &str,
        arguments_json: &str,
    ) -> Result<serde_json::Value, CoreError> {
        let value: serde_json::Value =
            serde_json::from_str(arguments_json).map_err(|e| CoreError::InvalidArguments {
                tool: tool_name.to_string(),
                detail: format!("arguments are not valid JSON: {e}"),
            })?;

        if let Some(validator) = &self.validator {
            let errors: Vec<String> = validator
                .iter_errors(&value)
                .map(|e| format!("{}: {e}", e.instance_path()))
                .collect();
            if !errors.is_empty() {
                return Err(CoreError::InvalidArguments {
                    tool: tool_name.to_string(),
                    detail: errors.join("; "),
                });
            }
        }

        Ok(value)
    }
}
