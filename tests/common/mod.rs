//! Shared test doubles for the integration suite.

use async_trait::async_trait;
use floodgate::{Transport, TransportError, TransportRequest, TransportResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport that replays a scripted sequence of results, optionally holding each
/// call open for a fixed delay.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into()), delay: None, calls: AtomicUsize::new(0) })
    }

    pub fn with_delay(
        script: Vec<Result<TransportResponse, TransportError>>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().expect("transport script exhausted");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        next
    }
}

/// A response whose body is JSON when non-empty.
pub fn response(status: u16, body: &str) -> TransportResponse {
    let mut headers = HashMap::new();
    if !body.is_empty() {
        headers.insert("Content-Type".to_string(), "application/json".to_string());
    }
    TransportResponse {
        status,
        status_text: match status {
            200 => "OK",
            401 => "Unauthorized",
            429 => "Too Many Requests",
            503 => "Service Unavailable",
            _ => "",
        }
        .to_string(),
        headers,
        body: body.to_string(),
    }
}

pub fn network_error(code: &str) -> TransportError {
    TransportError { message: format!("{} failure", code), code: Some(code.to_string()) }
}
