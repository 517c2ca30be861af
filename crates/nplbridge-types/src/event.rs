//! Telemetry events emitted by the transport and the instance memory.
//!
//! Consumers (dashboards, activity logs) live outside the bridge; they
//! receive events through a [`TelemetrySink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single transport attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 2xx response.
    Success,
    /// 401 response.
    Unauthorized,
    /// 429 or 5xx response.
    TransientStatus,
    /// Connection refused/reset or timeout.
    NetworkError,
    /// Non-retryable 4xx response.
    Rejected,
    /// The caller cancelled the attempt.
    Cancelled,
    /// The request could not be issued at all.
    Failed,
}

impl AttemptOutcome {
    /// Stable tag value for metric keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Unauthorized => "unauthorized",
            AttemptOutcome::TransientStatus => "transient_status",
            AttemptOutcome::NetworkError => "network_error",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::Cancelled => "cancelled",
            AttemptOutcome::Failed => "failed",
        }
    }

    /// Whether this outcome counts as an error for metrics.
    pub fn is_error(&self) -> bool {
        !matches!(self, AttemptOutcome::Success)
    }
}

/// A telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// One HTTP attempt made by the transport.
    TransportAttempt {
        operation_tag: String,
        outcome: AttemptOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        http_status: Option<u16>,
        elapsed_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// One record appended to the instance memory.
    MemoryWrite {
        agent_identity: String,
        protocol_type_name: String,
        instance_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Receiver of telemetry events.
///
/// Emission is best-effort: callers ignore returned errors, so a failing
/// sink never affects the operation that produced the event.
pub trait TelemetrySink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &TelemetryEvent) -> Result<(), String>;
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _event: &TelemetryEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Emit to a sink, swallowing (and tracing nothing about) sink failures.
pub fn emit(sink: &dyn TelemetrySink, event: TelemetryEvent) {
    let _ = sink.record(&event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = TelemetryEvent::TransportAttempt {
            operation_tag: "commerce/Product.create".to_string(),
            outcome: AttemptOutcome::TransientStatus,
            http_status: Some(503),
            elapsed_ms: 12,
            message: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transport_attempt");
        assert_eq!(json["outcome"], "transient_status");
        assert_eq!(json["http_status"], 503);
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_outcome_tags() {
        assert_eq!(AttemptOutcome::NetworkError.as_str(), "network_error");
        assert!(!AttemptOutcome::Success.is_error());
        assert!(AttemptOutcome::Rejected.is_error());
    }

    #[test]
    fn test_emit_swallows_errors() {
        struct Broken;
        impl TelemetrySink for Broken {
            fn record(&self, _event: &TelemetryEvent) -> Result<(), String> {
                Err("disk full".to_string())
            }
        }
        emit(
            &Broken,
            TelemetryEvent::MemoryWrite {
                agent_identity: "buyer1".to_string(),
                protocol_type_name: "Offer".to_string(),
                instance_id: "off-1".to_string(),
                timestamp: Utc::now(),
            },
        );
    }
}
