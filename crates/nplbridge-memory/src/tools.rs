//! Agent-facing memory tools.
//!
//! Four tools let an agent look up the instances it created or received
//! without the workflow hard-coding ids. Every response carries a `hint`
//! telling the agent what to do with it.

use crate::instance::{InstanceMemory, ROLE_PARTICIPANT};
use nplbridge_types::error::{BridgeError, BridgeResult};
use nplbridge_types::memory::MemoryRecord;
use nplbridge_types::tool::ToolDefinition;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const RECALL_MY_PROTOCOLS: &str = "recall_my_protocols";
pub const GET_PROTOCOL_ID: &str = "get_protocol_id";
pub const GET_WORKFLOW_CONTEXT: &str = "get_workflow_context";
pub const REMEMBER_PROTOCOL: &str = "remember_protocol";

const TOOL_NAMES: [&str; 4] = [
    RECALL_MY_PROTOCOLS,
    GET_PROTOCOL_ID,
    GET_WORKFLOW_CONTEXT,
    REMEMBER_PROTOCOL,
];

/// Memory tools bound to a shared [`InstanceMemory`].
#[derive(Clone)]
pub struct MemoryTools {
    memory: Arc<InstanceMemory>,
}

impl MemoryTools {
    pub fn new(memory: Arc<InstanceMemory>) -> Self {
        Self { memory }
    }

    pub fn is_memory_tool(name: &str) -> bool {
        TOOL_NAMES.contains(&name)
    }

    /// Definitions handed to the agent runtime.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: RECALL_MY_PROTOCOLS.to_string(),
                description: "Recall all NPL protocol instances you have created or interacted with. \
                    Use this when you need the ids of instances from earlier steps."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "protocol_type": {"type": "string", "description": "Filter by protocol type name"},
                        "state": {"type": "string", "description": "Filter by state (e.g. 'published', 'approved')"}
                    },
                    "required": []
                }),
            },
            ToolDefinition {
                name: GET_PROTOCOL_ID.to_string(),
                description: "Get the most recent instance id for a protocol type.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "protocol_type": {"type": "string", "description": "The NPL protocol type name"}
                    },
                    "required": ["protocol_type"]
                }),
            },
            ToolDefinition {
                name: GET_WORKFLOW_CONTEXT.to_string(),
                description: "Get a summary of every protocol instance you have worked with, grouped by type."
                    .to_string(),
                input_schema: json!({"type": "object", "properties": {}, "required": []}),
            },
            ToolDefinition {
                name: REMEMBER_PROTOCOL.to_string(),
                description: "Remember a protocol instance you received from another agent or an external source."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "protocol_type": {"type": "string", "description": "The NPL protocol type name"},
                        "instance_id": {"type": "string", "description": "The instance id"},
                        "state": {"type": "string", "description": "Current state (default 'created')"},
                        "role": {"type": "string", "description": "Your role (default 'participant')"},
                        "description": {"type": "string", "description": "Note to help you remember what this is"}
                    },
                    "required": ["protocol_type", "instance_id"]
                }),
            },
        ]
    }

    /// Run memory tool `name` for `agent`.
    pub fn execute(&self, agent: &str, name: &str, input: &Value) -> BridgeResult<Value> {
        let empty = Map::new();
        let args = match input {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(BridgeError::InvalidArgument(format!(
                    "arguments for '{name}' must be a JSON object"
                )))
            }
        };

        match name {
            RECALL_MY_PROTOCOLS => {
                let protocol_type = optional_str(args, "protocol_type")?;
                let state = optional_str(args, "state")?;
                let found = self.memory.protocols(agent, protocol_type, state);
                if found.is_empty() {
                    return Ok(json!({
                        "success": true,
                        "count": 0,
                        "protocols": [],
                        "hint": format!(
                            "No protocols found matching filters. protocol_type={}, state={}",
                            protocol_type.unwrap_or("None"),
                            state.unwrap_or("None")
                        ),
                    }));
                }
                Ok(json!({
                    "success": true,
                    "count": found.len(),
                    "protocols": found.iter().map(record_view).collect::<Vec<_>>(),
                    "hint": "Use the instance_id from these results when calling other NPL tools",
                }))
            }
            GET_PROTOCOL_ID => {
                let protocol_type = required_str(args, "protocol_type")?;
                match self.memory.latest(agent, protocol_type) {
                    Some(record) => Ok(json!({
                        "success": true,
                        "protocol_type": protocol_type,
                        "instance_id": record.instance_id,
                        "state": record.state,
                        "role": record.role,
                        "metadata": record.metadata,
                        "hint": format!(
                            "Use instance_id '{}' when calling {protocol_type} actions",
                            record.instance_id
                        ),
                    })),
                    None => Ok(json!({
                        "success": false,
                        "error": format!("No {protocol_type} instances found in memory"),
                        "hint": format!(
                            "You may need to create a {protocol_type} first, or the instance was created in a previous session"
                        ),
                    })),
                }
            }
            GET_WORKFLOW_CONTEXT => {
                let summary = self.memory.summary(agent);
                Ok(json!({
                    "success": true,
                    "agent_id": summary.agent_identity,
                    "total_protocols": summary.total_protocols,
                    "by_type": summary.by_type,
                    "recent_actions": summary.recent.iter().map(record_view).collect::<Vec<_>>(),
                    "hint": "This shows all protocols you've interacted with. Use recall_my_protocols() for details.",
                }))
            }
            REMEMBER_PROTOCOL => {
                let protocol_type = required_str(args, "protocol_type")?;
                let instance_id = required_str(args, "instance_id")?;
                let state = optional_str(args, "state")?.unwrap_or("created");
                let role = optional_str(args, "role")?.unwrap_or(ROLE_PARTICIPANT);
                let mut metadata = Map::new();
                if let Some(description) = optional_str(args, "description")?.filter(|d| !d.is_empty()) {
                    metadata.insert("description".to_string(), Value::String(description.to_string()));
                }
                let record = MemoryRecord::new(
                    agent,
                    protocol_type,
                    instance_id,
                    Some(state.to_string()),
                    Some(role.to_string()),
                )
                .with_metadata(metadata);
                self.memory.append(record);
                Ok(json!({
                    "success": true,
                    "remembered": {
                        "protocol_type": protocol_type,
                        "instance_id": instance_id,
                        "state": state,
                        "role": role,
                    },
                    "hint": format!(
                        "You can now recall this {protocol_type} using get_protocol_id('{protocol_type}')"
                    ),
                }))
            }
            other => Err(BridgeError::NotFound(format!("unknown memory tool '{other}'"))),
        }
    }
}

fn record_view(record: &MemoryRecord) -> Value {
    json!({
        "protocol_type": record.protocol_type_name,
        "instance_id": record.instance_id,
        "state": record.state,
        "role": record.role,
        "metadata": record.metadata,
        "recorded_at": record.recorded_at,
    })
}

fn optional_str<'a>(args: &'a Map<String, Value>, key: &str) -> BridgeResult<Option<&'a str>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(BridgeError::InvalidArgument(format!(
            "argument '{key}' must be a string, got {other}"
        ))),
    }
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> BridgeResult<&'a str> {
    optional_str(args, key)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::InvalidArgument(format!("missing required argument '{key}'")))
}
