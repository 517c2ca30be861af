//! Resilient transport: authenticated engine calls with bounded retry.
//!
//! One call runs an explicit attempt loop:
//!
//! - 2xx: parse the body and return.
//! - 401: ask the credential manager to renew once and retry; a 401 after
//!   renewal is `AuthExpired`. The renewal retry does not use up an attempt.
//! - 429, 5xx, connect errors and timeouts: back off and retry until the
//!   attempt count or the total wait budget runs out (`TransientExhausted`).
//! - any other 4xx: `BusinessRejected`, never retried.
//!
//! Cancellation aborts the in-flight attempt or backoff sleep and returns
//! `Cancelled`. Every attempt is reported to the telemetry sink.

use crate::credentials::{CredentialManager, CredentialSnapshot};
use crate::http::{HttpBackend, HttpMethod, HttpRequest, HttpResponse};
use crate::retry::{next_delay, RetryConfig};
use chrono::Utc;
use nplbridge_types::error::{BridgeError, BridgeResult};
use nplbridge_types::event::{emit, AttemptOutcome, NoopSink, TelemetryEvent, TelemetrySink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 200;

/// One logical engine call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Tag used in telemetry (e.g. `commerce/Product.create`).
    pub operation_tag: String,
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Attach a bearer credential and handle 401 by renewing it.
    pub authenticated: bool,
}

impl CallRequest {
    pub fn new(operation_tag: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            operation_tag: operation_tag.into(),
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            authenticated: true,
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

/// HTTP client with retry, backoff and credential renewal.
pub struct ResilientTransport {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<CredentialManager>,
    sink: Arc<dyn TelemetrySink>,
    retry: RetryConfig,
    timeout: Duration,
}

impl ResilientTransport {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<CredentialManager>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            credentials,
            sink: Arc::new(NoopSink),
            retry,
            timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn backend(&self) -> &Arc<dyn HttpBackend> {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform a call and parse the response body as JSON.
    ///
    /// An empty body yields `{}`; a non-JSON body yields a JSON string.
    pub async fn call(
        &self,
        request: &CallRequest,
        cancel: &CancellationToken,
    ) -> BridgeResult<serde_json::Value> {
        let resp = self.execute(request, cancel).await?;
        Ok(parse_body(&resp.body))
    }

    /// Perform a call and return the raw response body.
    pub async fn call_text(
        &self,
        request: &CallRequest,
        cancel: &CancellationToken,
    ) -> BridgeResult<String> {
        Ok(self.execute(request, cancel).await?.body)
    }

    async fn execute(
        &self,
        request: &CallRequest,
        cancel: &CancellationToken,
    ) -> BridgeResult<HttpResponse> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut credential = if request.authenticated {
            Some(self.cancellable(cancel, self.credentials.get_valid_credential()).await?)
        } else {
            None
        };
        let mut counted: u32 = 0;
        let mut waited_ms: u64 = 0;
        let mut renewed = false;

        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            let http_request = self.build(request, credential.as_ref());
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.report(request, AttemptOutcome::Cancelled, None, started, None);
                    return Err(BridgeError::Cancelled);
                }
                r = self.backend.send(http_request) => r,
            };

            // (status, message, retry-after hint) of a transient failure.
            let transient: (Option<u16>, String, Option<u64>) = match result {
                Ok(resp) if resp.is_success() => {
                    self.report(request, AttemptOutcome::Success, Some(resp.status), started, None);
                    debug!(
                        operation = %request.operation_tag,
                        status = resp.status,
                        "Engine call succeeded"
                    );
                    return Ok(resp);
                }
                Ok(resp) if resp.status == 401 && credential.is_some() => {
                    self.report(
                        request,
                        AttemptOutcome::Unauthorized,
                        Some(401),
                        started,
                        Some(error_message(&resp.body)),
                    );
                    if renewed {
                        return Err(BridgeError::AuthExpired(format!(
                            "engine rejected the renewed credential for {}",
                            request.operation_tag
                        )));
                    }
                    renewed = true;
                    let Some(stale) = credential.as_ref() else {
                        return Err(BridgeError::Internal("missing credential".to_string()));
                    };
                    let fresh = self
                        .cancellable(cancel, self.credentials.on_unauthorized(stale))
                        .await?;
                    credential = Some(fresh);
                    continue;
                }
                Ok(resp) if is_transient_status(resp.status) => {
                    let message = error_message(&resp.body);
                    self.report(
                        request,
                        AttemptOutcome::TransientStatus,
                        Some(resp.status),
                        started,
                        Some(message.clone()),
                    );
                    (Some(resp.status), message, resp.retry_after_ms)
                }
                Ok(resp) => {
                    let message = error_message(&resp.body);
                    self.report(
                        request,
                        AttemptOutcome::Rejected,
                        Some(resp.status),
                        started,
                        Some(message.clone()),
                    );
                    return Err(BridgeError::BusinessRejected {
                        status: resp.status,
                        message,
                    });
                }
                Err(e) if e.is_transient() => {
                    self.report(
                        request,
                        AttemptOutcome::NetworkError,
                        None,
                        started,
                        Some(e.to_string()),
                    );
                    (None, e.to_string(), None)
                }
                Err(e) => {
                    self.report(request, AttemptOutcome::Failed, None, started, Some(e.to_string()));
                    return Err(BridgeError::Internal(format!(
                        "{} {}: {e}",
                        request.method, request.url
                    )));
                }
            };

            counted += 1;
            let (status, message, hint) = transient;
            let delay = if counted >= max_attempts {
                None
            } else {
                next_delay(&self.retry, counted - 1, hint, waited_ms)
            };
            let Some(delay_ms) = delay else {
                warn!(
                    operation = %request.operation_tag,
                    attempts = counted,
                    status = ?status,
                    "Retries exhausted"
                );
                return Err(BridgeError::TransientExhausted {
                    status,
                    message,
                    attempts: counted,
                });
            };

            warn!(
                operation = %request.operation_tag,
                attempt = counted,
                max_attempts,
                status = ?status,
                delay_ms,
                "Transient failure, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            waited_ms = waited_ms.saturating_add(delay_ms);
        }
    }

    fn build(&self, request: &CallRequest, credential: Option<&CredentialSnapshot>) -> HttpRequest {
        let mut http = HttpRequest::new(request.method, &request.url, self.timeout)
            .header("Accept", "application/json");
        if let Some(bearer) = credential.and_then(|c| c.credential.bearer_header()) {
            http = http.header("Authorization", bearer);
        }
        for (name, value) in &request.headers {
            http = http.header(name.clone(), value.clone());
        }
        if let Some(body) = &request.body {
            http = http.json(body.clone());
        }
        http
    }

    async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = BridgeResult<T>>,
    ) -> BridgeResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            r = fut => r,
        }
    }

    fn report(
        &self,
        request: &CallRequest,
        outcome: AttemptOutcome,
        http_status: Option<u16>,
        started: Instant,
        message: Option<String>,
    ) {
        emit(
            self.sink.as_ref(),
            TelemetryEvent::TransportAttempt {
                operation_tag: request.operation_tag.clone(),
                outcome,
                http_status,
                elapsed_ms: started.elapsed().as_millis() as u64,
                message,
                timestamp: Utc::now(),
            },
        );
    }
}

/// 429 and 5xx are retried.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// JSON body, `{}` for an empty body, or the raw text as a JSON string.
pub fn parse_body(body: &str) -> serde_json::Value {
    if body.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
}

/// Human-readable message from an engine error body.
pub fn error_message(body: &str) -> String {
    if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error_description", "error", "detail", "title"] {
            if let Some(serde_json::Value::String(s)) = obj.get(key) {
                if !s.is_empty() {
                    return s.clone();
                }
            }
        }
    }
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
