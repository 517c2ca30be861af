//! In-process metrics: counters, latency histograms and recent errors.
//!
//! [`MetricsCollector`] implements [`TelemetrySink`], so the transport can
//! report every attempt into it. [`BroadcastSink`] forwards raw events to
//! external subscribers, and [`FanoutSink`] combines several sinks.

use chrono::{DateTime, Utc};
use nplbridge_types::event::{TelemetryEvent, TelemetrySink};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Latency samples kept per histogram key.
const MAX_SAMPLES: usize = 1000;

/// Recent errors kept.
const MAX_ERRORS: usize = 100;

/// Counter of transport attempts.
pub const METRIC_CALLS: &str = "npl.api.calls";
/// Counter of failed transport attempts.
pub const METRIC_ERRORS: &str = "npl.api.errors";
/// Latency histogram of transport attempts (milliseconds).
pub const METRIC_LATENCY: &str = "npl.api.latency_ms";
/// Counter of instance-memory writes.
pub const METRIC_MEMORY_WRITES: &str = "npl.memory.writes";

/// Summary statistics over one latency histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// One recorded error with its context.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

/// Point-in-time view of all metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub counters: BTreeMap<String, u64>,
    pub latency: BTreeMap<String, LatencyStats>,
    pub recent_errors: Vec<ErrorEntry>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, VecDeque<f64>>,
    errors: VecDeque<ErrorEntry>,
}

/// Thread-safe metrics collector.
#[derive(Default)]
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by `value`.
    pub fn increment(&self, name: &str, value: u64, tags: &[(&str, &str)]) {
        let key = format_key(name, tags);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state.counters.entry(key).or_insert(0) += value;
    }

    /// Record a latency sample.
    pub fn record_latency(&self, name: &str, latency_ms: f64, tags: &[(&str, &str)]) {
        let key = format_key(name, tags);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let samples = state.histograms.entry(key).or_default();
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    /// Record an error with context.
    pub fn record_error(&self, error_type: &str, message: &str, context: &[(&str, &str)]) {
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.errors.len() >= MAX_ERRORS {
            state.errors.pop_front();
        }
        state.errors.push_back(entry);
    }

    /// Current value of a counter.
    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let key = format_key(name, tags);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.counters.get(&key).copied().unwrap_or(0)
    }

    /// All counters.
    pub fn counters(&self) -> BTreeMap<String, u64> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Latency statistics for one histogram, `None` if it has no samples.
    pub fn latency_stats(&self, name: &str, tags: &[(&str, &str)]) -> Option<LatencyStats> {
        let key = format_key(name, tags);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.histograms.get(&key).and_then(compute_stats)
    }

    /// Most recent errors, newest first.
    pub fn errors(&self, limit: usize) -> Vec<ErrorEntry> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.errors.iter().rev().take(limit).cloned().collect()
    }

    /// Counters, per-key latency statistics and the ten most recent errors.
    pub fn summary(&self) -> MetricsSummary {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSummary {
            counters: state
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            latency: state
                .histograms
                .iter()
                .filter_map(|(k, v)| compute_stats(v).map(|s| (k.clone(), s)))
                .collect(),
            recent_errors: state.errors.iter().rev().take(10).cloned().collect(),
            timestamp: Utc::now(),
        }
    }

    /// Clear everything.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = MetricsState::default();
    }
}

impl TelemetrySink for MetricsCollector {
    fn record(&self, event: &TelemetryEvent) -> Result<(), String> {
        match event {
            TelemetryEvent::TransportAttempt {
                operation_tag,
                outcome,
                http_status,
                elapsed_ms,
                message,
                ..
            } => {
                let tags = [
                    ("operation", operation_tag.as_str()),
                    ("outcome", outcome.as_str()),
                ];
                self.increment(METRIC_CALLS, 1, &tags);
                self.record_latency(
                    METRIC_LATENCY,
                    *elapsed_ms as f64,
                    &[("operation", operation_tag.as_str())],
                );
                if outcome.is_error() {
                    self.increment(METRIC_ERRORS, 1, &tags);
                    let status = http_status.map(|s| s.to_string()).unwrap_or_default();
                    self.record_error(
                        outcome.as_str(),
                        message.as_deref().unwrap_or(""),
                        &[
                            ("operation", operation_tag.as_str()),
                            ("status", status.as_str()),
                        ],
                    );
                }
            }
            TelemetryEvent::MemoryWrite {
                protocol_type_name,
                ..
            } => {
                self.increment(
                    METRIC_MEMORY_WRITES,
                    1,
                    &[("protocol", protocol_type_name.as_str())],
                );
            }
        }
        Ok(())
    }
}

/// `name[k=v,...]` with tags sorted by key.
pub fn format_key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<&(&str, &str)> = tags.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let tag_str = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}[{tag_str}]")
}

fn compute_stats(samples: &VecDeque<f64>) -> Option<LatencyStats> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let pick = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
    Some(LatencyStats {
        count: n,
        min: sorted[0],
        max: sorted[n - 1],
        avg: sorted.iter().sum::<f64>() / n as f64,
        p50: pick(0.5),
        p95: pick(0.95),
        p99: pick(0.99),
    })
}

// ---------------------------------------------------------------------------
// Forwarding sinks
// ---------------------------------------------------------------------------

/// Forwards events to `tokio::sync::broadcast` subscribers.
pub struct BroadcastSink {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TelemetrySink for BroadcastSink {
    fn record(&self, event: &TelemetryEvent) -> Result<(), String> {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Delivers each event to every inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanoutSink {
    fn record(&self, event: &TelemetryEvent) -> Result<(), String> {
        let failures: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|s| s.record(event).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}
