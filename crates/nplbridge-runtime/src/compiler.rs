//! Schema-to-tool compiler.
//!
//! Turns each create/action operation of an OpenAPI document into an
//! [`OperationSpec`] whose parameters are the flattened primitive leaves of
//! the request-body schema.
//!
//! Rules:
//! - Nested objects recurse; leaf names join the field path with the
//!   configured separator (`address_city`).
//! - `string`, `number`/`integer`, `boolean` and string enums map to
//!   primitive types; arrays of primitives become one sequence parameter.
//! - Arrays of objects and free-form objects fail the operation with
//!   `UnsupportedSchema`; two leaves flattening to one name fail it with
//!   `AmbiguousFlattening`. A failing operation is skipped, the rest of the
//!   package still compiles.
//! - A leaf is required only if it is required at every level of its path
//!   and nothing on the path is nullable.
//! - Required parameters come first, then optional ones, each group in
//!   schema declaration order.

use crate::openapi::{OpenApiDocument, PathKind, RawOperation, ResolvedSchema};
use nplbridge_types::error::{BridgeError, BridgeResult};
use nplbridge_types::operation::{
    OperationKind, OperationSpec, ParameterLocation, ParameterSpec, PrimitiveType,
};
use nplbridge_types::package::normalize_package_name;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Name of the path parameter carrying the instance id of action tools.
pub const INSTANCE_ID_PARAM: &str = "instance_id";
/// Name of the optional acting-party parameter of action tools.
pub const PARTY_PARAM: &str = "party";
/// Header the acting party is sent in.
pub const PARTY_HEADER: &str = "X-Party";
/// Body field holding party claims on create.
pub const PARTIES_FIELD: &str = "@parties";

/// Claims exposed for every party of a create operation.
const PARTY_CLAIMS: [&str; 2] = ["organization", "department"];

/// An operation that could not be compiled.
#[derive(Debug, Clone)]
pub struct SkippedOperation {
    /// `Protocol.action`.
    pub operation: String,
    pub error: BridgeError,
}

/// Compilation result for one package.
#[derive(Debug, Clone)]
pub struct CompiledPackage {
    pub package: String,
    pub operations: Vec<OperationSpec>,
    pub skipped: Vec<SkippedOperation>,
}

/// Flattens operation schemas into typed parameter lists.
#[derive(Debug, Clone)]
pub struct ToolCompiler {
    separator: String,
}

impl Default for ToolCompiler {
    fn default() -> Self {
        Self::new("_")
    }
}

impl ToolCompiler {
    pub fn new(separator: &str) -> Self {
        Self {
            separator: if separator.is_empty() {
                "_".to_string()
            } else {
                separator.to_string()
            },
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Compile every operation of `doc`, skipping (and reporting) the ones
    /// that fail.
    pub fn compile(&self, doc: &OpenApiDocument) -> CompiledPackage {
        let mut operations = Vec::new();
        let mut skipped = Vec::new();
        for raw in doc.operations() {
            match self.compile_operation(doc, &raw) {
                Ok(spec) => {
                    debug!(
                        package = doc.package(),
                        operation = %spec.label(),
                        parameters = spec.parameters.len(),
                        "Compiled operation"
                    );
                    operations.push(spec);
                }
                Err(error) => {
                    warn!(
                        package = doc.package(),
                        operation = %raw.label(),
                        error = %error,
                        "Skipping operation"
                    );
                    skipped.push(SkippedOperation {
                        operation: raw.label(),
                        error,
                    });
                }
            }
        }
        CompiledPackage {
            package: doc.package().to_string(),
            operations,
            skipped,
        }
    }

    /// Compile a single operation.
    pub fn compile_operation(
        &self,
        doc: &OpenApiDocument,
        raw: &RawOperation,
    ) -> BridgeResult<OperationSpec> {
        let package = doc.package();
        let label = raw.label();
        let mut walk = Walk {
            doc,
            separator: &self.separator,
            operation: &label,
            params: Vec::new(),
            names: HashSet::new(),
        };

        let (kind, path_template) = match &raw.kind {
            PathKind::Create { protocol } => (
                OperationKind::Create,
                format!("/npl/{}/{}/", package.trim_matches('/'), protocol),
            ),
            PathKind::Action { protocol, action } => {
                walk.push(ParameterSpec {
                    flattened_name: INSTANCE_ID_PARAM.to_string(),
                    primitive_type: PrimitiveType::String,
                    required: true,
                    nullable: false,
                    source_path: vec![INSTANCE_ID_PARAM.to_string()],
                    location: ParameterLocation::Path,
                    description: format!("The {protocol} instance id"),
                })?;
                walk.push(ParameterSpec {
                    flattened_name: PARTY_PARAM.to_string(),
                    primitive_type: PrimitiveType::String,
                    required: false,
                    nullable: false,
                    source_path: vec![PARTY_HEADER.to_string()],
                    location: ParameterLocation::Header,
                    description: "The party role executing this action (e.g. 'seller', 'buyer')"
                        .to_string(),
                })?;
                (
                    OperationKind::Action,
                    format!(
                        "/npl/{}/{}/{{{}}}/{}",
                        package.trim_matches('/'),
                        protocol,
                        INSTANCE_ID_PARAM,
                        action
                    ),
                )
            }
        };

        if let Some(schema) = &raw.request_schema {
            let root = doc.resolve(schema, &[], &label)?;
            let is_object =
                root.type_name() == Some("object") || root.schema.get("properties").is_some();
            if !is_object {
                return Err(BridgeError::UnsupportedSchema {
                    operation: label.clone(),
                    reason: "request body is not an object".to_string(),
                });
            }
            let has_properties = root
                .schema
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(|p| !p.is_empty());
            if has_properties {
                walk.object(&root, &[], &mut Vec::new(), true, kind == OperationKind::Create)?;
            }
        }

        // Stable partition: required first, declaration order within groups.
        let (mut parameters, optional): (Vec<_>, Vec<_>) =
            walk.params.into_iter().partition(|p| p.required);
        parameters.extend(optional);

        Ok(OperationSpec {
            package: package.to_string(),
            protocol_name: raw.protocol().to_string(),
            action_name: raw.action().to_string(),
            kind,
            http_method: "POST".to_string(),
            path_template,
            summary: raw.summary.clone(),
            parameters,
        })
    }
}

/// Tool name for an operation: `{package}_{Protocol}_{action}`.
pub fn tool_name(spec: &OperationSpec) -> String {
    format!(
        "{}_{}_{}",
        normalize_package_name(&spec.package),
        spec.protocol_name,
        spec.action_name
    )
}

/// State of one depth-first walk over an operation's request schema.
struct Walk<'a> {
    doc: &'a OpenApiDocument,
    separator: &'a str,
    operation: &'a str,
    params: Vec<ParameterSpec>,
    names: HashSet<String>,
}

impl Walk<'_> {
    fn push(&mut self, param: ParameterSpec) -> BridgeResult<()> {
        if !self.names.insert(param.flattened_name.clone()) {
            return Err(BridgeError::AmbiguousFlattening {
                operation: self.operation.to_string(),
                name: param.flattened_name,
            });
        }
        self.params.push(param);
        Ok(())
    }

    fn unsupported(&self, path: &[String], reason: &str) -> BridgeError {
        let at = if path.is_empty() {
            "<body>".to_string()
        } else {
            path.join(".")
        };
        BridgeError::UnsupportedSchema {
            operation: self.operation.to_string(),
            reason: format!("{reason} at '{at}'"),
        }
    }

    /// Walk the properties of an object schema.
    ///
    /// `ancestors` are the component names dereferenced above this object,
    /// `path` is its field path and `required` whether it is required all the
    /// way up.
    fn object(
        &mut self,
        object: &ResolvedSchema,
        ancestors: &[String],
        path: &mut Vec<String>,
        required: bool,
        allow_parties: bool,
    ) -> BridgeResult<()> {
        let Some(properties) = object.schema.get("properties").and_then(Value::as_object) else {
            return Err(self.unsupported(path, "free-form object"));
        };
        let required_fields: HashSet<&str> = object
            .schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        // Component names on the current path, for cycle detection.
        let visiting: Vec<String> = ancestors.iter().chain(&object.refs).cloned().collect();

        for (name, prop) in properties {
            if name == PARTIES_FIELD {
                if allow_parties && path.is_empty() {
                    self.parties(prop, required && required_fields.contains(name.as_str()))?;
                }
                continue;
            }
            if name.starts_with('@') {
                debug!(operation = self.operation, field = %name, "Ignoring engine metadata field");
                continue;
            }

            let resolved = self.doc.resolve(prop, &visiting, self.operation)?;
            let nullable = resolved.nullable;
            let leaf_required = required && required_fields.contains(name.as_str()) && !nullable;
            path.push(name.clone());

            let result = self.field(prop, &resolved, &visiting, path, leaf_required, nullable);
            path.pop();
            result?;
        }
        Ok(())
    }

    fn field(
        &mut self,
        declared: &Value,
        resolved: &ResolvedSchema,
        visiting: &[String],
        path: &mut Vec<String>,
        required: bool,
        nullable: bool,
    ) -> BridgeResult<()> {
        let schema = &resolved.schema;
        let description = describe(declared, resolved);

        if let Some(values) = enum_values(schema) {
            return self.leaf(path, PrimitiveType::Enum { values }, required, nullable, description);
        }

        match resolved.type_name() {
            Some("object") => self.nested(resolved, visiting, path, required),
            None if schema.get("properties").is_some() => {
                self.nested(resolved, visiting, path, required)
            }
            Some("array") => {
                let Some(items) = schema.get("items") else {
                    return Err(self.unsupported(path, "array without items"));
                };
                let chain: Vec<String> = visiting.iter().chain(&resolved.refs).cloned().collect();
                let items = self.doc.resolve(items, &chain, self.operation)?;
                let item_type = match primitive_of(&items) {
                    Some(t) => t,
                    None => return Err(self.unsupported(path, "array of objects")),
                };
                self.leaf(
                    path,
                    PrimitiveType::Sequence {
                        items: Box::new(item_type),
                    },
                    required,
                    nullable,
                    description,
                )
            }
            _ => match primitive_of(resolved) {
                Some(t) => self.leaf(path, t, required, nullable, description),
                None => Err(self.unsupported(path, "unsupported type")),
            },
        }
    }

    fn nested(
        &mut self,
        resolved: &ResolvedSchema,
        visiting: &[String],
        path: &mut Vec<String>,
        required: bool,
    ) -> BridgeResult<()> {
        let has_properties = resolved
            .schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|p| !p.is_empty());
        if !has_properties {
            return Err(self.unsupported(path, "free-form object"));
        }
        self.object(resolved, visiting, path, required, false)
    }

    fn leaf(
        &mut self,
        path: &[String],
        primitive_type: PrimitiveType,
        required: bool,
        nullable: bool,
        description: String,
    ) -> BridgeResult<()> {
        self.push(ParameterSpec {
            flattened_name: path.join(self.separator),
            primitive_type,
            required,
            nullable,
            source_path: path.to_vec(),
            location: ParameterLocation::Body,
            description,
        })
    }

    /// Expose `{party}_organization` / `{party}_department` for each party.
    fn parties(&mut self, declared: &Value, parties_required: bool) -> BridgeResult<()> {
        let parties = self.doc.resolve(declared, &[], self.operation)?;
        let Some(properties) = parties.schema.get("properties").and_then(Value::as_object) else {
            return Ok(());
        };
        let required: HashSet<&str> = parties
            .schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        for party in properties.keys() {
            for claim in PARTY_CLAIMS {
                self.push(ParameterSpec {
                    flattened_name: format!("{party}{}{claim}", self.separator),
                    primitive_type: PrimitiveType::String,
                    required: parties_required && required.contains(party.as_str()),
                    nullable: false,
                    source_path: vec![party.clone(), claim.to_string()],
                    location: ParameterLocation::PartyClaim,
                    description: format!("{} name for {party} party", capitalize(claim)),
                })?;
            }
        }
        Ok(())
    }
}

fn enum_values(schema: &Value) -> Option<Vec<String>> {
    let values: Vec<String> = schema
        .get("enum")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Primitive type of a resolved schema, `None` for objects and arrays.
///
/// Referenced schemas without a structural type (e.g. `Product_Reference`)
/// are instance identifiers and map to strings.
fn primitive_of(resolved: &ResolvedSchema) -> Option<PrimitiveType> {
    if let Some(values) = enum_values(&resolved.schema) {
        return Some(PrimitiveType::Enum { values });
    }
    match resolved.type_name() {
        Some("string") => Some(PrimitiveType::String),
        Some("number") | Some("integer") => Some(PrimitiveType::Number),
        Some("boolean") => Some(PrimitiveType::Boolean),
        Some("object") | Some("array") => None,
        None if resolved.schema.get("properties").is_some() => None,
        None if resolved.schema.get("items").is_some() => None,
        _ => Some(PrimitiveType::String),
    }
}

/// Documentation line for a leaf.
fn describe(declared: &Value, resolved: &ResolvedSchema) -> String {
    let schema = &resolved.schema;
    if let Some(values) = enum_values(schema) {
        return format!("One of: {}", values.join(", "));
    }
    let format = schema.get("format").and_then(Value::as_str).unwrap_or("");
    if format == "zoned-date-time" || format == "date-time" {
        return "DateTime string (e.g. '2025-01-15T00:00:00Z')".to_string();
    }
    let text = declared
        .get("description")
        .or_else(|| schema.get("description"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if !text.is_empty() {
        return text.to_string();
    }
    if resolved.is_reference() && resolved.type_name().is_none() {
        return "Reference ID".to_string();
    }
    match schema.get("example") {
        Some(Value::String(e)) => format!("e.g. '{e}'"),
        Some(e) if !e.is_null() => format!("e.g. {e}"),
        _ => String::new(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
