//! Instance-memory record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One observation of a protocol instance on behalf of an agent.
///
/// Records are immutable; newer records supersede older ones for readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// The agent on whose behalf the record was written.
    pub agent_identity: String,
    /// Protocol type name (e.g. `Offer`).
    pub protocol_type_name: String,
    /// Engine instance identifier.
    pub instance_id: String,
    /// Protocol state at the time of recording, if known.
    #[serde(default)]
    pub state: Option<String>,
    /// The agent's relationship to the instance (`owner`, `participant`, ...).
    #[serde(default)]
    pub role: Option<String>,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
    /// Scalar context captured alongside the record.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MemoryRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        agent_identity: impl Into<String>,
        protocol_type_name: impl Into<String>,
        instance_id: impl Into<String>,
        state: Option<String>,
        role: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_identity: agent_identity.into(),
            protocol_type_name: protocol_type_name.into(),
            instance_id: instance_id.into(),
            state,
            role,
            recorded_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Aggregate view of one agent's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySummary {
    /// The agent the summary belongs to.
    pub agent_identity: String,
    /// Number of distinct tracked instances.
    pub total_protocols: usize,
    /// Instance labels (`id (state)`) grouped by protocol type.
    pub by_type: std::collections::BTreeMap<String, Vec<String>>,
    /// Most recent records, newest first.
    pub recent: Vec<MemoryRecord>,
}
