//! Engine health probing.
//!
//! One unretried `GET {engine}/actuator/health` with a short timeout, plus
//! the credential state and an optional metrics snapshot.

use crate::credentials::CredentialManager;
use crate::http::{HttpBackend, HttpMethod, HttpRequest};
use crate::metrics::{MetricsCollector, MetricsSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Probe timeout.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Longest response body kept in an unhealthy report.
const MAX_BODY: usize = 200;

/// Engine reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

/// Result of probing the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub url: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Response body (unhealthy) or error text (unreachable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Credential state, without any secret.
#[derive(Debug, Clone, Serialize)]
pub struct AuthHealth {
    pub provider: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Full health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub engine: EngineHealth,
    pub auth: AuthHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSummary>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.engine.status == HealthStatus::Healthy
    }
}

/// Probes the engine and reports credential state.
pub struct HealthCheck {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<CredentialManager>,
    engine_url: String,
    timeout: Duration,
}

impl HealthCheck {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<CredentialManager>,
        engine_url: &str,
    ) -> Self {
        Self {
            backend,
            credentials,
            engine_url: engine_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn check_engine(&self) -> EngineHealth {
        let url = format!("{}/actuator/health", self.engine_url);
        let start = Instant::now();
        let result = self
            .backend
            .send(HttpRequest::new(HttpMethod::Get, &url, self.timeout))
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.is_success() => EngineHealth {
                status: HealthStatus::Healthy,
                url,
                latency_ms,
                http_status: Some(resp.status),
                detail: None,
            },
            Ok(resp) => EngineHealth {
                status: HealthStatus::Unhealthy,
                url,
                latency_ms,
                http_status: Some(resp.status),
                detail: Some(resp.body.chars().take(MAX_BODY).collect()),
            },
            Err(e) => EngineHealth {
                status: HealthStatus::Unreachable,
                url,
                latency_ms,
                http_status: None,
                detail: Some(e.to_string()),
            },
        }
    }

    pub fn check_auth(&self) -> AuthHealth {
        let snapshot = self.credentials.snapshot();
        AuthHealth {
            provider: self.credentials.provider_name().to_string(),
            authenticated: snapshot.is_some(),
            expires_at: snapshot.and_then(|s| s.credential.expires_at()),
        }
    }

    /// Engine probe, credential state and (when given) a metrics snapshot.
    pub async fn report(&self, metrics: Option<&MetricsCollector>) -> HealthReport {
        HealthReport {
            engine: self.check_engine().await,
            auth: self.check_auth(),
            metrics: metrics.map(MetricsCollector::summary),
            timestamp: Utc::now(),
        }
    }
}
