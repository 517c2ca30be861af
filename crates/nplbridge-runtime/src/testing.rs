//! Scripted HTTP backend for unit tests.

use crate::http::{HttpBackend, HttpRequest, HttpResponse, TransportFailure};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Replays queued results in order, then falls back to per-URL routes.
#[derive(Default)]
pub struct ScriptedBackend {
    queue: Mutex<VecDeque<Result<HttpResponse, TransportFailure>>>,
    routes: Mutex<Vec<(String, HttpResponse)>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Mutex<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<HttpResponse, TransportFailure>) -> &Self {
        self.queue.lock().unwrap().push_back(result);
        self
    }

    pub fn push_status(&self, status: u16, body: &str) -> &Self {
        self.push(Ok(HttpResponse::new(status, body)))
    }

    /// Answer every request whose URL ends with `suffix`.
    pub fn route(&self, suffix: &str, status: u16, body: &str) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .push((suffix.to_string(), HttpResponse::new(status, body)));
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn count_matching(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .count()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        let routes = self.routes.lock().unwrap();
        routes
            .iter()
            .find(|(suffix, _)| url.ends_with(suffix.as_str()))
            .map(|(_, resp)| Ok(resp.clone()))
            .unwrap_or_else(|| Ok(HttpResponse::new(404, "no route")))
    }
}

/// Accept connections, announce a 100-byte body, send three bytes and
/// hang up. Returns the base URL and the accepted connection count.
pub async fn truncating_server() -> (String, Arc<AtomicU32>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc")
                .await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), accepted)
}
