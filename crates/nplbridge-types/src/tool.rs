//! Tool definition and call/result types exchanged with the agent runtime.

use crate::error::BridgeError;
use crate::operation::ParameterSpec;
use serde::{Deserialize, Serialize};

/// What the agent runtime is told about one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// e.g. `commerce_Product_create`.
    pub name: String,
    pub description: String,
    /// Flat JSON Schema object, one property per parameter.
    pub input_schema: serde_json::Value,
}

/// One tool invocation issued by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the call with its [`ToolResult`].
    pub id: String,
    pub name: String,
    /// Arguments keyed by flattened parameter name.
    pub input: serde_json::Value,
}

/// Outcome of a [`ToolCall`], serialized to text for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    /// Engine response body, or a serialized `ToolFailure`.
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Wrap a successful JSON body.
    pub fn success(tool_use_id: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: body.to_string(),
            is_error: false,
        }
    }

    /// Wrap a failure as its structured JSON form.
    pub fn failure(tool_use_id: impl Into<String>, err: &BridgeError) -> Self {
        let content = serde_json::to_string(&err.to_failure()).unwrap_or_else(|_| err.to_string());
        Self {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: true,
        }
    }
}

/// Flat JSON Schema object for an ordered parameter list.
///
/// Property order follows parameter order, so required parameters come first.
pub fn input_schema_for(parameters: &[ParameterSpec]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in parameters {
        let mut schema = param.primitive_type.json_schema();
        if let Some(obj) = schema.as_object_mut() {
            if !param.description.is_empty() {
                obj.insert(
                    "description".to_string(),
                    serde_json::Value::String(param.description.clone()),
                );
            }
            if param.nullable {
                obj.insert("nullable".to_string(), serde_json::Value::Bool(true));
            }
        }
        properties.insert(param.flattened_name.clone(), schema);
        if param.required {
            required.push(serde_json::Value::String(param.flattened_name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
