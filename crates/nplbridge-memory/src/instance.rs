//! Per-agent ledger of protocol instances.
//!
//! Each agent owns a bounded ring of [`MemoryRecord`]s in insertion order;
//! the oldest record is evicted first. Records are never edited: a state
//! change appends a new record and readers take the most recent one.
//! Ledgers of different agents are independent, so writers for different
//! agents do not contend beyond the `DashMap` shard.

use chrono::Utc;
use dashmap::DashMap;
use nplbridge_types::error::{BridgeError, BridgeResult};
use nplbridge_types::event::{emit, NoopSink, TelemetryEvent, TelemetrySink};
use nplbridge_types::memory::{MemoryRecord, MemorySummary};
use nplbridge_types::operation::OperationKind;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default records kept per agent.
pub const DEFAULT_CAPACITY: usize = 256;

/// Role recorded for instances an agent created.
pub const ROLE_OWNER: &str = "owner";
/// Role recorded for instances an agent acted on or received.
pub const ROLE_PARTICIPANT: &str = "participant";

/// Records shown in a summary.
const SUMMARY_RECENT: usize = 5;

type Ledger = Arc<Mutex<VecDeque<MemoryRecord>>>;

/// Process-wide instance memory, scoped by agent identity.
pub struct InstanceMemory {
    ledgers: DashMap<String, Ledger>,
    capacity: usize,
    sink: Arc<dyn TelemetrySink>,
}

impl Default for InstanceMemory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InstanceMemory {
    /// Create a memory keeping at most `capacity` records per agent.
    pub fn new(capacity: usize) -> Self {
        Self {
            ledgers: DashMap::new(),
            capacity: capacity.max(1),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ledger(&self, agent: &str) -> Ledger {
        self.ledgers
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    fn existing(&self, agent: &str) -> Option<Ledger> {
        self.ledgers.get(agent).map(|l| l.clone())
    }

    /// Snapshot of an agent's records, oldest first.
    fn records(&self, agent: &str) -> Vec<MemoryRecord> {
        let Some(ledger) = self.existing(agent) else {
            return Vec::new();
        };
        let records = ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        records
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append a record for `agent`.
    pub fn remember(
        &self,
        agent: &str,
        protocol_type: &str,
        instance_id: &str,
        state: Option<&str>,
        role: Option<&str>,
    ) -> MemoryRecord {
        self.append(MemoryRecord::new(
            agent,
            protocol_type,
            instance_id,
            state.map(str::to_string),
            role.map(str::to_string),
        ))
    }

    /// Append a prepared record to its agent's ledger.
    pub fn append(&self, record: MemoryRecord) -> MemoryRecord {
        let ledger = self.ledger(&record.agent_identity);
        {
            let mut ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
            ledger.push_back(record.clone());
            while ledger.len() > self.capacity {
                ledger.pop_front();
            }
        }
        debug!(
            agent = %record.agent_identity,
            protocol = %record.protocol_type_name,
            instance_id = %record.instance_id,
            state = record.state.as_deref().unwrap_or(""),
            "Remembered protocol instance"
        );
        emit(
            self.sink.as_ref(),
            TelemetryEvent::MemoryWrite {
                agent_identity: record.agent_identity.clone(),
                protocol_type_name: record.protocol_type_name.clone(),
                instance_id: record.instance_id.clone(),
                timestamp: Utc::now(),
            },
        );
        record
    }

    /// Record a new state for an instance the agent already tracks.
    ///
    /// Role and metadata carry over from the latest record of the instance.
    pub fn update_state(
        &self,
        agent: &str,
        protocol_type: &str,
        instance_id: &str,
        new_state: &str,
    ) -> BridgeResult<MemoryRecord> {
        let previous = self.latest_instance(agent, protocol_type, instance_id).ok_or_else(|| {
            BridgeError::NotFound(format!(
                "{protocol_type} instance '{instance_id}' is not tracked for agent '{agent}'"
            ))
        })?;
        let record = MemoryRecord::new(
            agent,
            protocol_type,
            instance_id,
            Some(new_state.to_string()),
            previous.role,
        )
        .with_metadata(previous.metadata);
        Ok(self.append(record))
    }

    /// Copy `from`'s most recent `protocol_type` record into `to`'s ledger.
    pub fn handoff(
        &self,
        from: &str,
        to: &str,
        protocol_type: &str,
        role: Option<&str>,
    ) -> BridgeResult<MemoryRecord> {
        let source = self.latest(from, protocol_type).ok_or_else(|| {
            BridgeError::NotFound(format!("no {protocol_type} instance remembered by '{from}'"))
        })?;
        let mut metadata = source.metadata;
        metadata.insert("handed_off_by".to_string(), Value::String(from.to_string()));
        let record = MemoryRecord::new(
            to,
            protocol_type,
            source.instance_id,
            source.state,
            Some(role.unwrap_or(ROLE_PARTICIPANT).to_string()),
        )
        .with_metadata(metadata);
        Ok(self.append(record))
    }

    /// Track the instance touched by a successful tool call.
    ///
    /// Creates record `@id` / `id` and `@state` / `state` (default
    /// `created`) with role `owner`, keeping scalar non-`@` fields as
    /// metadata. Actions record the state returned for `instance_id` with
    /// role `participant`; an action that returns no state is only recorded
    /// when the instance is not yet tracked.
    pub fn auto_track(
        &self,
        agent: &str,
        protocol_type: &str,
        kind: OperationKind,
        instance_id: Option<&str>,
        result: &Value,
    ) -> Option<MemoryRecord> {
        let state = result
            .get("@state")
            .or_else(|| result.get("state"))
            .and_then(Value::as_str);
        match kind {
            OperationKind::Create => {
                let id = result
                    .get("@id")
                    .or_else(|| result.get("id"))
                    .and_then(Value::as_str)?;
                let record = MemoryRecord::new(
                    agent,
                    protocol_type,
                    id,
                    Some(state.unwrap_or("created").to_string()),
                    Some(ROLE_OWNER.to_string()),
                )
                .with_metadata(scalar_metadata(result));
                Some(self.append(record))
            }
            OperationKind::Action => {
                let id = instance_id.filter(|id| !id.is_empty())?;
                let previous = self.latest_instance(agent, protocol_type, id);
                if state.is_none() && previous.is_some() {
                    return None;
                }
                let state = state
                    .map(str::to_string)
                    .or_else(|| previous.as_ref().and_then(|p| p.state.clone()));
                let role = previous
                    .and_then(|p| p.role)
                    .unwrap_or_else(|| ROLE_PARTICIPANT.to_string());
                Some(self.remember_with(agent, protocol_type, id, state, role))
            }
        }
    }

    /// Track an instance read back from the engine.
    ///
    /// The instance comes from `@id` / `id` and its state from `@state` /
    /// `state`. The role of the previous record is kept, else `participant`.
    /// Nothing is appended when the state matches the latest record.
    pub fn observe(
        &self,
        agent: &str,
        protocol_type: &str,
        instance: &Value,
    ) -> Option<MemoryRecord> {
        let id = instance
            .get("@id")
            .or_else(|| instance.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())?;
        let state = instance
            .get("@state")
            .or_else(|| instance.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let previous = self.latest_instance(agent, protocol_type, id);
        if let Some(prev) = &previous {
            if state.is_none() || prev.state == state {
                return None;
            }
        }
        let role = previous
            .and_then(|p| p.role)
            .unwrap_or_else(|| ROLE_PARTICIPANT.to_string());
        let record = MemoryRecord::new(agent, protocol_type, id, state, Some(role))
            .with_metadata(scalar_metadata(instance));
        Some(self.append(record))
    }

    fn remember_with(
        &self,
        agent: &str,
        protocol_type: &str,
        instance_id: &str,
        state: Option<String>,
        role: String,
    ) -> MemoryRecord {
        self.append(MemoryRecord::new(
            agent,
            protocol_type,
            instance_id,
            state,
            Some(role),
        ))
    }

    /// Forget everything remembered for `agent`.
    pub fn clear(&self, agent: &str) {
        self.ledgers.remove(agent);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Latest record of `protocol_type` for `agent`.
    pub fn latest(&self, agent: &str, protocol_type: &str) -> Option<MemoryRecord> {
        let ledger = self.existing(agent)?;
        let ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger
            .iter()
            .rev()
            .find(|r| r.protocol_type_name == protocol_type)
            .cloned()
    }

    fn latest_instance(
        &self,
        agent: &str,
        protocol_type: &str,
        instance_id: &str,
    ) -> Option<MemoryRecord> {
        let ledger = self.existing(agent)?;
        let ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger
            .iter()
            .rev()
            .find(|r| r.protocol_type_name == protocol_type && r.instance_id == instance_id)
            .cloned()
    }

    /// Instance id of the latest `protocol_type` record, or `NotFound`.
    pub fn most_recent(&self, agent: &str, protocol_type: &str) -> BridgeResult<String> {
        self.latest(agent, protocol_type)
            .map(|r| r.instance_id)
            .ok_or_else(|| {
                BridgeError::NotFound(format!(
                    "no {protocol_type} instance remembered for agent '{agent}'"
                ))
            })
    }

    /// Records of `agent`, newest first, optionally filtered by type.
    ///
    /// The result is a snapshot; calling again restarts from the newest
    /// record.
    pub fn history(&self, agent: &str, protocol_type: Option<&str>) -> Vec<MemoryRecord> {
        let mut records = self.records(agent);
        records.reverse();
        if let Some(t) = protocol_type {
            records.retain(|r| r.protocol_type_name == t);
        }
        records
    }

    /// Latest record per tracked instance, newest first, filtered by type
    /// and current state.
    pub fn protocols(
        &self,
        agent: &str,
        protocol_type: Option<&str>,
        state: Option<&str>,
    ) -> Vec<MemoryRecord> {
        let mut seen = HashSet::new();
        self.history(agent, protocol_type)
            .into_iter()
            .filter(|r| seen.insert((r.protocol_type_name.clone(), r.instance_id.clone())))
            .filter(|r| state.map_or(true, |s| r.state.as_deref() == Some(s)))
            .collect()
    }

    /// Tracked instances grouped by type, plus the most recent records.
    pub fn summary(&self, agent: &str) -> MemorySummary {
        let current = self.protocols(agent, None, None);
        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in current.iter().rev() {
            let label = match &record.state {
                Some(state) => format!("{} ({state})", record.instance_id),
                None => record.instance_id.clone(),
            };
            by_type
                .entry(record.protocol_type_name.clone())
                .or_default()
                .push(label);
        }
        MemorySummary {
            agent_identity: agent.to_string(),
            total_protocols: current.len(),
            by_type,
            recent: self.history(agent, None).into_iter().take(SUMMARY_RECENT).collect(),
        }
    }

    /// Number of records held for `agent`.
    pub fn len(&self, agent: &str) -> usize {
        self.existing(agent)
            .map(|l| l.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    /// Agents with a ledger, sorted.
    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.ledgers.iter().map(|e| e.key().clone()).collect();
        agents.sort();
        agents
    }
}

/// Scalar, non-engine fields of a create response.
fn scalar_metadata(result: &Value) -> Map<String, Value> {
    let Some(obj) = result.as_object() else {
        return Map::new();
    };
    obj.iter()
        .filter(|(k, v)| {
            !k.starts_with('@')
                && !matches!(k.as_str(), "id" | "state" | "success")
                && !v.is_object()
                && !v.is_array()
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_most_recent_and_history_order() {
        let memory = InstanceMemory::default();
        memory.remember("buyer1", "Offer", "off-1", None, None);
        memory.remember("buyer1", "Offer", "off-2", None, None);
        assert_eq!(memory.most_recent("buyer1", "Offer").unwrap(), "off-2");
        let ids: Vec<String> = memory
            .history("buyer1", Some("Offer"))
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(ids, vec!["off-2", "off-1"]);
    }

    #[test]
    fn test_not_found() {
        let memory = InstanceMemory::default();
        memory.remember("buyer1", "Offer", "off-1", None, None);
        let err = memory.most_recent("buyer1", "Order").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        assert!(memory.most_recent("seller1", "Offer").is_err());
        assert!(memory.history("nobody", None).is_empty());
    }

    #[test]
    fn test_agents_are_isolated() {
        let memory = InstanceMemory::default();
        memory.remember("buyer1", "Offer", "off-1", None, None);
        memory.remember("seller1", "Offer", "off-9", None, None);
        assert_eq!(memory.most_recent("buyer1", "Offer").unwrap(), "off-1");
        assert_eq!(memory.most_recent("seller1", "Offer").unwrap(), "off-9");
        assert_eq!(memory.agents(), vec!["buyer1", "seller1"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let memory = InstanceMemory::new(3);
        for i in 0..5 {
            memory.remember("a", "Offer", &format!("off-{i}"), None, None);
        }
        assert_eq!(memory.len("a"), 3);
        let ids: Vec<String> = memory.history("a", None).into_iter().map(|r| r.instance_id).collect();
        assert_eq!(ids, vec!["off-4", "off-3", "off-2"]);
    }

    #[test]
    fn test_repeated_remember_is_idempotent_for_readers() {
        let memory = InstanceMemory::default();
        memory.remember("a", "Offer", "off-1", Some("draft"), None);
        memory.remember("a", "Offer", "off-1", Some("draft"), None);
        assert_eq!(memory.most_recent("a", "Offer").unwrap(), "off-1");
        assert_eq!(memory.protocols("a", None, None).len(), 1);
    }

    #[test]
    fn test_update_state_and_protocol_views() {
        let memory = InstanceMemory::default();
        memory.remember("a", "Offer", "off-1", Some("draft"), Some(ROLE_OWNER));
        memory.remember("a", "Product", "p-1", Some("active"), Some(ROLE_OWNER));
        let updated = memory.update_state("a", "Offer", "off-1", "published").unwrap();
        assert_eq!(updated.role.as_deref(), Some(ROLE_OWNER));

        let published = memory.protocols("a", None, Some("published"));
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].instance_id, "off-1");
        assert!(memory.protocols("a", Some("Offer"), Some("draft")).is_empty());

        let err = memory.update_state("a", "Offer", "off-404", "x").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));

        let summary = memory.summary("a");
        assert_eq!(summary.total_protocols, 2);
        assert_eq!(summary.by_type["Offer"], vec!["off-1 (published)"]);
        assert_eq!(summary.recent.len(), 3);
        assert_eq!(summary.recent[0].state.as_deref(), Some("published"));
    }

    #[test]
    fn test_handoff() {
        let memory = InstanceMemory::default();
        memory.remember("buyer1", "PurchaseOrder", "po-1", Some("submitted"), Some(ROLE_OWNER));
        let record = memory.handoff("buyer1", "supplier1", "PurchaseOrder", None).unwrap();
        assert_eq!(record.agent_identity, "supplier1");
        assert_eq!(record.role.as_deref(), Some(ROLE_PARTICIPANT));
        assert_eq!(record.metadata["handed_off_by"], json!("buyer1"));
        assert_eq!(memory.most_recent("supplier1", "PurchaseOrder").unwrap(), "po-1");
        assert!(memory.handoff("buyer1", "x", "Invoice", None).is_err());
    }

    #[test]
    fn test_auto_track() {
        let memory = InstanceMemory::default();
        let created = memory
            .auto_track(
                "a",
                "Product",
                OperationKind::Create,
                None,
                &json!({"@id": "p-1", "@state": "draft", "name": "Pump", "tags": ["x"], "@parties": {}}),
            )
            .unwrap();
        assert_eq!(created.instance_id, "p-1");
        assert_eq!(created.state.as_deref(), Some("draft"));
        assert_eq!(created.role.as_deref(), Some(ROLE_OWNER));
        assert_eq!(created.metadata.len(), 1);
        assert_eq!(created.metadata["name"], json!("Pump"));

        // No id in the response: nothing to track.
        assert!(memory
            .auto_track("a", "Product", OperationKind::Create, None, &json!({"ok": true}))
            .is_none());

        let acted = memory
            .auto_track(
                "a",
                "Product",
                OperationKind::Action,
                Some("p-1"),
                &json!({"@state": "active"}),
            )
            .unwrap();
        assert_eq!(acted.state.as_deref(), Some("active"));
        assert_eq!(acted.role.as_deref(), Some(ROLE_OWNER));

        // Void action on a tracked instance changes nothing.
        assert!(memory
            .auto_track("a", "Product", OperationKind::Action, Some("p-1"), &json!({}))
            .is_none());

        // Void action on an unknown instance starts tracking it.
        let joined = memory
            .auto_track("a", "Offer", OperationKind::Action, Some("off-7"), &json!({}))
            .unwrap();
        assert_eq!(joined.role.as_deref(), Some(ROLE_PARTICIPANT));
        assert!(joined.state.is_none());
    }

    #[test]
    fn test_observe_tracks_state_changes() {
        let memory = InstanceMemory::default();
        memory.auto_track(
            "seller",
            "Product",
            OperationKind::Create,
            None,
            &json!({"@id": "p-1", "@state": "draft"}),
        );

        // Same state as last remembered: no new record.
        assert!(memory
            .observe("seller", "Product", &json!({"@id": "p-1", "@state": "draft"}))
            .is_none());
        assert_eq!(memory.len("seller"), 1);

        let seen = memory
            .observe(
                "seller",
                "Product",
                &json!({"@id": "p-1", "@state": "active", "price": 90}),
            )
            .unwrap();
        assert_eq!(seen.state.as_deref(), Some("active"));
        assert_eq!(seen.role.as_deref(), Some(ROLE_OWNER));
        assert_eq!(seen.metadata["price"], json!(90));

        let other = memory
            .observe("buyer", "Product", &json!({"id": "p-2"}))
            .unwrap();
        assert_eq!(other.role.as_deref(), Some(ROLE_PARTICIPANT));
        assert!(other.state.is_none());

        assert!(memory.observe("buyer", "Product", &json!({"@state": "x"})).is_none());
    }

    struct CountingSink(AtomicUsize);

    impl TelemetrySink for CountingSink {
        fn record(&self, event: &TelemetryEvent) -> Result<(), String> {
            if matches!(event, TelemetryEvent::MemoryWrite { .. }) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            Err("sink offline".to_string())
        }
    }

    #[test]
    fn test_writes_emit_telemetry() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let memory = InstanceMemory::default().with_sink(sink.clone());
        memory.remember("a", "Offer", "off-1", None, None);
        memory.update_state("a", "Offer", "off-1", "sent").unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
        assert_eq!(memory.len("a"), 2);
    }

    #[test]
    fn test_concurrent_writers() {
        let memory = Arc::new(InstanceMemory::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let memory = memory.clone();
                std::thread::spawn(move || {
                    let agent = format!("agent-{}", t % 2);
                    for i in 0..100 {
                        memory.remember(&agent, "Offer", &format!("{t}-{i}"), None, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(memory.len("agent-0") + memory.len("agent-1"), 800);

        // Per-writer order is preserved within a ledger.
        let history = memory.history("agent-0", None);
        let from_zero: Vec<String> = history
            .iter()
            .rev()
            .filter(|r| r.instance_id.starts_with("0-"))
            .map(|r| r.instance_id.clone())
            .collect();
        let expected: Vec<String> = (0..100).map(|i| format!("0-{i}")).collect();
        assert_eq!(from_zero, expected);
    }
}
