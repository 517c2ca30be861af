//! Read-only view over a package's OpenAPI document.
//!
//! Validates the top-level shape, enumerates the engine's create/action
//! operations in declaration order and resolves schema indirections
//! (`$ref`, single-element `allOf`, nullable `anyOf`/`oneOf`).

use nplbridge_types::error::{BridgeError, BridgeResult};
use serde_json::{Map, Value};

const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

/// Whether a path creates an instance or runs an action on one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    Create { protocol: String },
    Action { protocol: String, action: String },
}

/// One POST operation found in the document.
#[derive(Debug, Clone)]
pub struct RawOperation {
    pub path: String,
    pub kind: PathKind,
    pub summary: Option<String>,
    /// Request-body JSON schema, unresolved.
    pub request_schema: Option<Value>,
}

impl RawOperation {
    pub fn protocol(&self) -> &str {
        match &self.kind {
            PathKind::Create { protocol } | PathKind::Action { protocol, .. } => protocol,
        }
    }

    pub fn action(&self) -> &str {
        match &self.kind {
            PathKind::Create { .. } => "create",
            PathKind::Action { action, .. } => action,
        }
    }

    /// `Protocol.action`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.protocol(), self.action())
    }
}

/// A schema after indirections were followed.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub schema: Value,
    /// A nullable wrapper or `nullable: true` was seen on the way.
    pub nullable: bool,
    /// Names of the component schemas that were dereferenced, outermost first.
    pub refs: Vec<String>,
}

impl ResolvedSchema {
    pub fn type_name(&self) -> Option<&str> {
        self.schema.get("type").and_then(Value::as_str)
    }

    pub fn is_reference(&self) -> bool {
        !self.refs.is_empty()
    }
}

/// A parsed, well-formed OpenAPI document.
#[derive(Debug, Clone)]
pub struct OpenApiDocument {
    package: String,
    paths: Map<String, Value>,
    schemas: Map<String, Value>,
}

impl OpenApiDocument {
    /// Validate the top-level fields and wrap the document.
    ///
    /// Fails with `SpecUnparseable` when `openapi`/`swagger` or the `paths`
    /// object is missing.
    pub fn parse(package: &str, document: Value) -> BridgeResult<Self> {
        let unparseable = |reason: &str| BridgeError::SpecUnparseable {
            package: package.to_string(),
            reason: reason.to_string(),
        };
        let Value::Object(mut root) = document else {
            return Err(unparseable("document is not a JSON object"));
        };
        let has_version = ["openapi", "swagger"]
            .iter()
            .any(|k| root.get(*k).and_then(Value::as_str).is_some());
        if !has_version {
            return Err(unparseable("missing 'openapi' version field"));
        }
        let paths = match root.remove("paths") {
            Some(Value::Object(paths)) => paths,
            Some(_) => return Err(unparseable("'paths' is not an object")),
            None => return Err(unparseable("missing 'paths' object")),
        };
        let schemas = root
            .get("components")
            .and_then(|c| c.get("schemas"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            package: package.to_string(),
            paths,
            schemas,
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// POST create/action operations, in declaration order.
    pub fn operations(&self) -> Vec<RawOperation> {
        let mut ops = Vec::new();
        for (path, item) in &self.paths {
            let Some(post) = item.get("post") else {
                continue;
            };
            let Some(kind) = classify_path(path, &self.package) else {
                continue;
            };
            let summary = ["summary", "description"]
                .iter()
                .find_map(|k| post.get(*k).and_then(Value::as_str))
                .map(str::to_string);
            let request_schema = post
                .get("requestBody")
                .and_then(|b| b.get("content"))
                .and_then(|c| c.get("application/json"))
                .and_then(|j| j.get("schema"))
                .cloned();
            ops.push(RawOperation {
                path: path.clone(),
                kind,
                summary,
                request_schema,
            });
        }
        ops
    }

    /// Follow `$ref`, single-element `allOf` and nullable `anyOf`/`oneOf`
    /// wrappers until a concrete schema is reached.
    ///
    /// `visiting` holds the component names on the current walk; meeting one
    /// of them again is a cycle and fails with `UnsupportedSchema`.
    pub fn resolve(
        &self,
        schema: &Value,
        visiting: &[String],
        operation: &str,
    ) -> BridgeResult<ResolvedSchema> {
        let mut current = schema.clone();
        let mut nullable = is_nullable_flag(&current);
        let mut refs: Vec<String> = Vec::new();

        loop {
            if let Some(reference) = current.get("$ref").and_then(Value::as_str) {
                let name = reference
                    .strip_prefix(SCHEMA_REF_PREFIX)
                    .ok_or_else(|| BridgeError::UnsupportedSchema {
                        operation: operation.to_string(),
                        reason: format!("external reference '{reference}'"),
                    })?
                    .to_string();
                if visiting.contains(&name) || refs.contains(&name) {
                    return Err(BridgeError::UnsupportedSchema {
                        operation: operation.to_string(),
                        reason: format!("recursive schema '{name}'"),
                    });
                }
                let target = self.schemas.get(&name).cloned().ok_or_else(|| {
                    BridgeError::UnsupportedSchema {
                        operation: operation.to_string(),
                        reason: format!("unknown schema '{name}'"),
                    }
                })?;
                refs.push(name);
                nullable |= is_nullable_flag(&target);
                current = target;
                continue;
            }

            if let Some(all_of) = current.get("allOf").and_then(Value::as_array) {
                if all_of.len() == 1 {
                    let inner = all_of[0].clone();
                    nullable |= is_nullable_flag(&inner);
                    current = inner;
                    continue;
                }
                return Err(BridgeError::UnsupportedSchema {
                    operation: operation.to_string(),
                    reason: "allOf with more than one member".to_string(),
                });
            }

            let union = current
                .get("anyOf")
                .or_else(|| current.get("oneOf"))
                .and_then(Value::as_array)
                .cloned();
            if let Some(members) = union {
                let (nulls, rest): (Vec<&Value>, Vec<&Value>) = members
                    .iter()
                    .partition(|m| m.get("type").and_then(Value::as_str) == Some("null"));
                if rest.len() == 1 {
                    nullable |= !nulls.is_empty();
                    current = rest[0].clone();
                    continue;
                }
                return Err(BridgeError::UnsupportedSchema {
                    operation: operation.to_string(),
                    reason: "union of several non-null types".to_string(),
                });
            }

            // OpenAPI 3.1 style `type: [T, "null"]`.
            if let Some(types) = current.get("type").and_then(Value::as_array).cloned() {
                let non_null: Vec<&Value> = types
                    .iter()
                    .filter(|t| t.as_str() != Some("null"))
                    .collect();
                if non_null.len() == 1 {
                    nullable |= non_null.len() != types.len();
                    if let Some(obj) = current.as_object_mut() {
                        obj.insert("type".to_string(), non_null[0].clone());
                    }
                } else {
                    return Err(BridgeError::UnsupportedSchema {
                        operation: operation.to_string(),
                        reason: "multiple non-null types".to_string(),
                    });
                }
            }

            return Ok(ResolvedSchema {
                schema: current,
                nullable,
                refs,
            });
        }
    }
}

fn is_nullable_flag(schema: &Value) -> bool {
    schema.get("nullable").and_then(Value::as_bool).unwrap_or(false)
}

/// Classify an operation path of `package`.
///
/// Accepts engine-absolute paths (`/npl/{package}/Protocol/...`) and paths
/// relative to a `servers` base (`/Protocol/...`):
///
/// - `/npl/pkg/Product/` → create `Product`
/// - `/npl/pkg/Product/{id}/approve` → action `Product.approve`
pub fn classify_path(path: &str, package: &str) -> Option<PathKind> {
    let prefix = format!("/npl/{}/", package.trim_matches('/'));
    let relative = if let Some(rest) = path.strip_prefix(&prefix) {
        rest
    } else if path.starts_with("/npl/") {
        return None;
    } else {
        path
    };

    let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
    // `/-/` marks engine metadata endpoints such as the spec itself.
    if parts.contains(&"-") {
        return None;
    }
    let protocol = parts.first()?;
    if protocol.starts_with('{') {
        return None;
    }
    match parts.len() {
        1 => Some(PathKind::Create {
            protocol: protocol.to_string(),
        }),
        n if n >= 3 => {
            let action = parts[n - 1];
            if action.starts_with('{') {
                return None;
            }
            Some(PathKind::Action {
                protocol: protocol.to_string(),
                action: action.to_string(),
            })
        }
        _ => None,
    }
}
