//! Compiled tools: typed, flat-argument callables over engine operations.
//!
//! A [`CompiledTool`] owns its [`OperationSpec`] and a handle to the shared
//! transport. It never holds a credential; the transport asks the
//! credential manager on every call, so rotation is transparent.

use crate::compiler::{tool_name, PARTIES_FIELD};
use crate::http::HttpMethod;
use crate::transport::{CallRequest, ResilientTransport};
use nplbridge_types::error::{BridgeError, BridgeResult};
use nplbridge_types::operation::{
    OperationKind, OperationSpec, ParameterLocation, ParameterSpec, PrimitiveType,
};
use nplbridge_types::tool::{input_schema_for, ToolDefinition};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A callable tool generated from one engine operation.
#[derive(Clone)]
pub struct CompiledTool {
    name: String,
    description: String,
    spec: Arc<OperationSpec>,
    transport: Arc<ResilientTransport>,
    engine_url: String,
}

impl std::fmt::Debug for CompiledTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTool")
            .field("name", &self.name)
            .field("operation", &self.spec.label())
            .field("parameters", &self.spec.parameters.len())
            .finish()
    }
}

impl CompiledTool {
    pub fn new(spec: OperationSpec, transport: Arc<ResilientTransport>, engine_url: &str) -> Self {
        let name = tool_name(&spec);
        let description = render_description(&spec);
        Self {
            name,
            description,
            spec: Arc::new(spec),
            transport,
            engine_url: engine_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documentation string: summary, purpose and one line per parameter.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.spec.parameters
    }

    pub fn package(&self) -> &str {
        &self.spec.package
    }

    /// Telemetry tag, e.g. `commerce/Product.create`.
    pub fn operation_tag(&self) -> String {
        format!("{}/{}", self.spec.package, self.spec.label())
    }

    /// JSON-Schema definition handed to the agent runtime.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: input_schema_for(&self.spec.parameters),
        }
    }

    /// Validate `args` and rebuild the engine request.
    ///
    /// Fails with `InvalidArgument` before any network traffic.
    pub fn build_request(&self, args: &Map<String, Value>) -> BridgeResult<CallRequest> {
        for key in args.keys() {
            if self.spec.parameter(key).is_none() {
                return Err(BridgeError::InvalidArgument(format!(
                    "unknown argument '{key}' for tool '{}'",
                    self.name
                )));
            }
        }

        let mut body = Map::new();
        let mut path_values: Vec<(&str, String)> = Vec::new();
        let mut headers: Vec<(String, String)> = Vec::new();

        for param in &self.spec.parameters {
            let value = match args.get(&param.flattened_name) {
                None | Some(Value::Null) if param.required => {
                    return Err(BridgeError::InvalidArgument(format!(
                        "missing required argument '{}' for tool '{}'",
                        param.flattened_name, self.name
                    )));
                }
                Some(Value::Null) if param.nullable => Value::Null,
                None | Some(Value::Null) => continue,
                Some(v) => {
                    check_type(param, v)?;
                    v.clone()
                }
            };

            match param.location {
                ParameterLocation::Body => insert_nested(&mut body, &param.source_path, value),
                ParameterLocation::PartyClaim => {
                    let mut path = vec![PARTIES_FIELD.to_string()];
                    if let [party, claim] = param.source_path.as_slice() {
                        path.extend([party.clone(), "claims".to_string(), claim.clone()]);
                    } else {
                        path.extend(param.source_path.iter().cloned());
                    }
                    insert_nested(&mut body, &path, Value::Array(vec![value]));
                }
                ParameterLocation::Path => {
                    let segment = value.as_str().unwrap_or_default();
                    validate_path_segment(&param.flattened_name, segment)?;
                    let placeholder = param
                        .source_path
                        .first()
                        .map(String::as_str)
                        .unwrap_or(param.flattened_name.as_str());
                    path_values.push((placeholder, segment.to_string()));
                }
                ParameterLocation::Header => {
                    let header = param
                        .source_path
                        .first()
                        .cloned()
                        .unwrap_or_else(|| param.flattened_name.clone());
                    headers.push((header, scalar_text(&value)));
                }
            }
        }

        let mut path = self.spec.path_template.clone();
        for (placeholder, segment) in &path_values {
            path = path.replace(&format!("{{{placeholder}}}"), segment);
        }
        let method = HttpMethod::parse(&self.spec.http_method).unwrap_or(HttpMethod::Post);
        let url = format!("{}{}", self.engine_url, path);

        let mut request =
            CallRequest::new(self.operation_tag(), method, url).json(Value::Object(body));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }

    /// Validate, rebuild the request and send it through the transport.
    ///
    /// An empty or `204` response yields `{}`.
    pub async fn invoke(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> BridgeResult<Value> {
        let request = self.build_request(args)?;
        debug!(tool = %self.name, url = %request.url, "Invoking tool");
        let result = self.transport.call(&request, cancel).await?;
        if self.spec.kind == OperationKind::Create {
            let instance_id = result.get("@id").and_then(Value::as_str).unwrap_or("");
            info!(tool = %self.name, instance_id, "Created protocol instance");
        }
        Ok(result)
    }
}

fn check_type(param: &ParameterSpec, value: &Value) -> BridgeResult<()> {
    if param.primitive_type.accepts(value) {
        return Ok(());
    }
    let expected = match &param.primitive_type {
        PrimitiveType::Enum { values } => format!("one of: {}", values.join(", ")),
        other => other.to_string(),
    };
    Err(BridgeError::InvalidArgument(format!(
        "argument '{}' must be {expected}, got {value}",
        param.flattened_name
    )))
}

pub(crate) fn validate_path_segment(name: &str, segment: &str) -> BridgeResult<()> {
    if segment.trim().is_empty() {
        return Err(BridgeError::InvalidArgument(format!(
            "argument '{name}' must not be empty"
        )));
    }
    if segment.contains(['/', '?', '#']) {
        return Err(BridgeError::InvalidArgument(format!(
            "argument '{name}' must be a single path segment, got '{segment}'"
        )));
    }
    Ok(())
}

/// Insert `value` at `path`, creating intermediate objects.
fn insert_nested(root: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.clone(), value);
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_description(spec: &OperationSpec) -> String {
    let purpose = match spec.kind {
        OperationKind::Create => format!(
            "Creates a new {} protocol instance in the {} package.",
            spec.protocol_name, spec.package
        ),
        OperationKind::Action => format!(
            "Executes the {} action on a {} protocol instance.",
            spec.action_name, spec.protocol_name
        ),
    };
    let mut out = match &spec.summary {
        Some(summary) if !summary.is_empty() => format!("{summary}\n\n{purpose}"),
        _ => purpose,
    };
    if !spec.parameters.is_empty() {
        out.push_str("\n\nArgs:");
        for p in &spec.parameters {
            let req = if p.required { "required" } else { "optional" };
            out.push_str(&format!("\n    {}: {} ({req})", p.flattened_name, p.primitive_type));
            if !p.description.is_empty() {
                out.push_str(&format!(" - {}", p.description));
            }
        }
    }
    out
}
