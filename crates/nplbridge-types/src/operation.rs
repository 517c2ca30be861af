//! Operation and parameter descriptors derived from a package's interface description.

use serde::{Deserialize, Serialize};

/// The flat type a tool parameter accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrimitiveType {
    /// Any JSON string.
    String,
    /// Any JSON number (schema `number` and `integer`).
    Number,
    /// `true` or `false`.
    Boolean,
    /// One of a fixed set of strings.
    Enum { values: Vec<String> },
    /// A list of primitive values.
    Sequence { items: Box<PrimitiveType> },
}

impl PrimitiveType {
    /// Whether `value` is an acceptable argument of this type.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            PrimitiveType::String => value.is_string(),
            PrimitiveType::Number => value.is_number(),
            PrimitiveType::Boolean => value.is_boolean(),
            PrimitiveType::Enum { values } => value
                .as_str()
                .map(|s| values.iter().any(|v| v == s))
                .unwrap_or(false),
            PrimitiveType::Sequence { items } => value
                .as_array()
                .map(|arr| arr.iter().all(|v| items.accepts(v)))
                .unwrap_or(false),
        }
    }

    /// JSON Schema fragment describing this type.
    pub fn json_schema(&self) -> serde_json::Value {
        match self {
            PrimitiveType::String => serde_json::json!({ "type": "string" }),
            PrimitiveType::Number => serde_json::json!({ "type": "number" }),
            PrimitiveType::Boolean => serde_json::json!({ "type": "boolean" }),
            PrimitiveType::Enum { values } => {
                serde_json::json!({ "type": "string", "enum": values })
            }
            PrimitiveType::Sequence { items } => {
                serde_json::json!({ "type": "array", "items": items.json_schema() })
            }
        }
    }
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveType::String => write!(f, "str"),
            PrimitiveType::Number => write!(f, "number"),
            PrimitiveType::Boolean => write!(f, "bool"),
            PrimitiveType::Enum { .. } => write!(f, "enum"),
            PrimitiveType::Sequence { items } => write!(f, "list[{items}]"),
        }
    }
}

/// Where a parameter's value goes when the request is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterLocation {
    /// Nested JSON body field at `source_path`.
    Body,
    /// Party claim at `source_path` inside `@parties`, wrapped in a one-element list.
    PartyClaim,
    /// Substituted into the path template segment named by `source_path[0]`.
    Path,
    /// Sent as the HTTP header named by `source_path[0]`.
    Header,
}

/// One flat, typed parameter of a compiled tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Unique name within the operation (path segments joined by the separator).
    pub flattened_name: String,
    /// Accepted value type.
    pub primitive_type: PrimitiveType,
    /// Whether the argument must be supplied.
    pub required: bool,
    /// Whether an explicit `null` is meaningful and forwarded.
    #[serde(default)]
    pub nullable: bool,
    /// Field names used to rebuild the nested request.
    pub source_path: Vec<String>,
    /// How the value is transported.
    pub location: ParameterLocation,
    /// Human-readable description for the tool documentation.
    #[serde(default)]
    pub description: String,
}

/// Whether an operation creates an instance or acts on an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Action,
}

/// A single callable engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Package the operation belongs to.
    pub package: String,
    /// Protocol type name (e.g. `Product`).
    pub protocol_name: String,
    /// Action name (`create` for instantiation).
    pub action_name: String,
    /// Create or action.
    pub kind: OperationKind,
    /// HTTP method (upper case).
    pub http_method: String,
    /// Path relative to the engine root, with `{name}` placeholders.
    pub path_template: String,
    /// Short summary from the description, if any.
    #[serde(default)]
    pub summary: Option<String>,
    /// Ordered parameters: required first, then optional.
    pub parameters: Vec<ParameterSpec>,
}

impl OperationSpec {
    /// `Protocol.action` label used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}.{}", self.protocol_name, self.action_name)
    }

    /// Look up a parameter by its flattened name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.flattened_name == name)
    }

    /// Parameters that must be supplied.
    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.iter().filter(|p| p.required)
    }
}
