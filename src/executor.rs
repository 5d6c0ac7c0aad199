//! Request executor: limiter gate, transport call, classification, retry loop.
//!
//! Semantics:
//! - Every attempt (initial and retries alike) first takes a token from the limiter.
//!   A denial surfaces as `ApiError::RateLimited` immediately; the executor never
//!   spins on the limiter inside one logical call, so limiter backoff and transport
//!   retry can never stack into unbounded delay.
//! - Each transport call is bounded by the configured timeout; an elapsed timeout is a
//!   network failure and therefore retry-eligible.
//! - Outcome classification is closed: 2xx success, 401/403 authentication, 429 server
//!   throttle, other 4xx client error, 5xx server error, transport failure. Only 5xx
//!   and transport failures are retried, with capped exponential backoff between
//!   attempts.
//! - `max_retries` counts retries after the initial attempt: the default of 3 yields at
//!   most 4 transport calls.
//!
//! Invariants:
//! - Exactly one typed error leaves `execute` per failure; nothing untyped escapes.
//! - Backoff delay before retry `k` is `min(max_delay, base_delay * 2^(k-1))`, before
//!   jitter.
//! - A retry consumes limiter capacity like any other attempt.

use crate::backoff::Backoff;
use crate::error::ApiError;
use crate::jitter::Jitter;
use crate::limiter::TokenBucketLimiter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::transport::{Method, Transport, TransportRequest, TransportResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fallback when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_millis(60_000);

/// Response body parsed according to its `Content-Type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Empty,
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    /// Deserialize a JSON payload into a concrete type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => serde_json::from_value(value),
            Payload::Text(text) => serde_json::from_str(&text),
            Payload::Empty => serde_json::from_str("null"),
        }
    }
}

/// One logical request handed to the executor.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    /// Overrides the executor-wide transport timeout when set.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: HashMap::new(), body: None, timeout: None }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Retry and timeout settings for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::exponential(
                Duration::from_millis(1_000),
                Duration::from_millis(30_000),
            )
            .expect("default backoff bounds are valid"),
            jitter: Jitter::None,
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Performs one logical HTTP request end-to-end.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    limiter: Arc<TokenBucketLimiter>,
    sleeper: Arc<dyn Sleeper>,
    config: ExecutorConfig,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<TokenBucketLimiter>,
        config: ExecutorConfig,
    ) -> Self {
        Self { transport, limiter, sleeper: Arc::new(TokioSleeper), config }
    }

    /// Replace the sleeper, for deterministic backoff tests.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run the request through the gate → send → classify → retry loop.
    pub async fn execute(&self, request: ApiRequest) -> Result<Payload, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            let acquisition = self.limiter.acquire();
            if !acquisition.allowed {
                let retry_after = acquisition.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
                return Err(ApiError::rate_limited(retry_after, None, None));
            }

            match self.attempt_once(&request).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay =
                        self.config.jitter.apply(self.config.backoff.delay(attempt as usize + 1));
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(attempts = attempt + 1, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_once(&self, request: &ApiRequest) -> Result<Payload, ApiError> {
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let transport_request = TransportRequest {
            method: request.method,
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.as_ref().map(Value::to_string),
        };

        let response =
            match tokio::time::timeout(timeout, self.transport.send(transport_request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    return Err(ApiError::network(err.message, err.code, request.url.clone()))
                }
                Err(_) => {
                    return Err(ApiError::network(
                        format!("request timed out after {} ms", timeout.as_millis()),
                        Some("timeout".into()),
                        request.url.clone(),
                    ))
                }
            };

        classify(response, &request.url)
    }
}

/// Map a transport response to exactly one outcome of the closed taxonomy.
fn classify(response: TransportResponse, url: &str) -> Result<Payload, ApiError> {
    match response.status {
        200..=299 => Ok(parse_body(&response)),
        401 | 403 => Err(ApiError::authentication(response.status)),
        429 => Err(ApiError::rate_limited(
            parse_retry_after(&response),
            parse_u32_header(&response, "X-RateLimit-Limit"),
            parse_u32_header(&response, "X-RateLimit-Remaining"),
        )),
        status => {
            tracing::debug!(status, url, "non-success response");
            Err(ApiError::api(status, response.status_text.clone(), mine_error_messages(&response)))
        }
    }
}

fn parse_body(response: &TransportResponse) -> Payload {
    if response.body.is_empty() {
        return Payload::Empty;
    }
    let is_json = response
        .header("Content-Type")
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    if is_json {
        // A mislabeled body degrades to text rather than failing the call.
        if let Ok(value) = serde_json::from_str(&response.body) {
            return Payload::Json(value);
        }
    }
    Payload::Text(response.body.clone())
}

/// `Retry-After` is specified in whole seconds; absent or malformed values fall back
/// to one minute.
fn parse_retry_after(response: &TransportResponse) -> Duration {
    response
        .header("Retry-After")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|seconds| Duration::from_millis(seconds.saturating_mul(1_000)))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn parse_u32_header(response: &TransportResponse, name: &str) -> Option<u32> {
    response.header(name).and_then(|value| value.trim().parse().ok())
}

/// Pull human-readable messages out of a structured JSON error body
/// (`errorMessages` array and/or `errors` object), when the server sent one.
fn mine_error_messages(response: &TransportResponse) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(&response.body) else {
        return Vec::new();
    };
    let mut messages = Vec::new();
    if let Some(list) = value.get("errorMessages").and_then(Value::as_array) {
        messages.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    if let Some(map) = value.get("errors").and_then(Value::as_object) {
        messages.extend(
            map.iter()
                .filter_map(|(field, detail)| detail.as_str().map(|d| format!("{}: {}", field, d))),
        );
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TrackingSleeper;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport that replays a scripted sequence of results.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().expect("script exhausted")
        }
    }

    /// Transport that never completes; used to exercise the timeout path.
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn send(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            futures::future::pending().await
        }
    }

    fn response(status: u16, content_type: &str, body: &str) -> TransportResponse {
        let mut headers = HashMap::new();
        if !content_type.is_empty() {
            headers.insert("Content-Type".to_string(), content_type.to_string());
        }
        TransportResponse {
            status,
            status_text: match status {
                200 => "OK",
                400 => "Bad Request",
                401 => "Unauthorized",
                429 => "Too Many Requests",
                500 => "Internal Server Error",
                503 => "Service Unavailable",
                _ => "",
            }
            .to_string(),
            headers,
            body: body.to_string(),
        }
    }

    fn network_failure(code: &str) -> TransportError {
        TransportError { message: format!("{} failure", code), code: Some(code.to_string()) }
    }

    fn executor(transport: Arc<dyn Transport>) -> RequestExecutor {
        let limiter = TokenBucketLimiter::new(100, 100, Duration::from_secs(30));
        RequestExecutor::new(transport, limiter, ExecutorConfig::default())
            .with_sleeper(Arc::new(TrackingSleeper::new()))
    }

    fn get(url: &str) -> ApiRequest {
        ApiRequest::new(Method::Get, url)
    }

    #[tokio::test]
    async fn success_parses_json_body() {
        let transport =
            ScriptedTransport::new(vec![Ok(response(200, "application/json", r#"{"id":7}"#))]);
        let result = executor(transport.clone()).execute(get("https://api.test/item")).await;

        let payload = result.expect("success");
        assert_eq!(payload.as_json().and_then(|v| v.get("id")).and_then(Value::as_u64), Some(7));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn success_returns_text_for_non_json() {
        let transport = ScriptedTransport::new(vec![Ok(response(200, "text/plain", "pong"))]);
        let payload = executor(transport).execute(get("https://api.test/ping")).await.unwrap();
        assert_eq!(payload.as_text(), Some("pong"));
    }

    #[tokio::test]
    async fn empty_body_is_empty_payload() {
        let transport = ScriptedTransport::new(vec![Ok(response(204, "", ""))]);
        let payload = executor(transport).execute(get("https://api.test/item")).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn mislabeled_json_degrades_to_text() {
        let transport =
            ScriptedTransport::new(vec![Ok(response(200, "application/json", "not json"))]);
        let payload = executor(transport).execute(get("https://api.test/item")).await.unwrap();
        assert_eq!(payload.as_text(), Some("not json"));
    }

    #[tokio::test]
    async fn authentication_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(response(401, "", ""))]);
        let err = executor(transport.clone())
            .execute(get("https://api.test/secure"))
            .await
            .unwrap_err();

        assert!(err.is_authentication());
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn client_error_is_not_retried_and_mines_messages() {
        let body = r#"{"errorMessages":["project is required"],"errors":{"summary":"too long"}}"#;
        let transport =
            ScriptedTransport::new(vec![Ok(response(400, "application/json", body))]);
        let err =
            executor(transport.clone()).execute(get("https://api.test/issue")).await.unwrap_err();

        match &err {
            ApiError::Api { status, messages, .. } => {
                assert_eq!(*status, 400);
                assert!(messages.contains(&"project is required".to_string()));
                assert!(messages.contains(&"summary: too long".to_string()));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn server_throttle_is_not_retried_and_parses_headers() {
        let mut throttled = response(429, "", "");
        throttled.headers.insert("Retry-After".into(), "30".into());
        throttled.headers.insert("X-RateLimit-Limit".into(), "100".into());
        throttled.headers.insert("X-RateLimit-Remaining".into(), "0".into());

        let transport = ScriptedTransport::new(vec![Ok(throttled)]);
        let err =
            executor(transport.clone()).execute(get("https://api.test/search")).await.unwrap_err();

        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        match err {
            ApiError::RateLimited { limit, remaining, .. } => {
                assert_eq!(limit, Some(100));
                assert_eq!(remaining, Some(0));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_retry_after_falls_back_to_one_minute() {
        let mut throttled = response(429, "", "");
        throttled.headers.insert("Retry-After".into(), "soon".into());

        let transport = ScriptedTransport::new(vec![Ok(throttled)]);
        let err = executor(transport).execute(get("https://api.test/search")).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn server_errors_retry_until_exhausted() {
        let transport = ScriptedTransport::new(vec![
            Ok(response(503, "", "")),
            Ok(response(503, "", "")),
            Ok(response(503, "", "")),
            Ok(response(503, "", "")),
        ]);
        let sleeper = Arc::new(TrackingSleeper::new());
        let limiter = TokenBucketLimiter::new(100, 100, Duration::from_secs(30));
        let exec = RequestExecutor::new(transport.clone(), limiter, ExecutorConfig::default())
            .with_sleeper(sleeper.clone());

        let err = exec.execute(get("https://api.test/flaky")).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        // Initial attempt + 3 retries.
        assert_eq!(transport.calls(), 4);
        // Exact exponential sequence: 1 s, 2 s, 4 s.
        assert_eq!(sleeper.calls(), 3);
        assert_eq!(sleeper.call_at(0), Some(Duration::from_millis(1_000)));
        assert_eq!(sleeper.call_at(1), Some(Duration::from_millis(2_000)));
        assert_eq!(sleeper.call_at(2), Some(Duration::from_millis(4_000)));
    }

    #[tokio::test]
    async fn network_failure_recovers_on_retry() {
        let transport = ScriptedTransport::new(vec![
            Err(network_failure("connect")),
            Ok(response(200, "application/json", r#"{"ok":true}"#)),
        ]);
        let payload =
            executor(transport.clone()).execute(get("https://api.test/item")).await.unwrap();
        assert!(payload.as_json().is_some());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn limiter_denial_short_circuits_before_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let limiter = TokenBucketLimiter::with_clock(
            1,
            60,
            Duration::from_secs(30),
            Arc::new(crate::clock::ManualClock::new()),
        );
        assert!(limiter.acquire().allowed); // drain the bucket

        let exec =
            RequestExecutor::new(transport.clone(), limiter, ExecutorConfig::default())
                .with_sleeper(Arc::new(TrackingSleeper::new()));
        let err = exec.execute(get("https://api.test/item")).await.unwrap_err();

        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn retries_stop_when_limiter_runs_dry() {
        let transport = ScriptedTransport::new(vec![
            Ok(response(503, "", "")),
            Ok(response(503, "", "")),
        ]);
        let limiter = TokenBucketLimiter::with_clock(
            2,
            60,
            Duration::from_secs(30),
            Arc::new(crate::clock::ManualClock::new()),
        );
        let exec = RequestExecutor::new(transport.clone(), limiter, ExecutorConfig::default())
            .with_sleeper(Arc::new(TrackingSleeper::new()));

        let err = exec.execute(get("https://api.test/flaky")).await.unwrap_err();
        // Two attempts spent the bucket; the third acquisition is denied.
        assert!(err.is_rate_limited());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_classifies_as_retryable_network_error() {
        let limiter = TokenBucketLimiter::new(100, 100, Duration::from_secs(30));
        let config = ExecutorConfig { max_retries: 0, ..ExecutorConfig::default() };
        let exec = RequestExecutor::new(Arc::new(HangingTransport), limiter, config)
            .with_sleeper(Arc::new(TrackingSleeper::new()));

        let request = get("https://api.test/slow").timeout(Duration::from_millis(50));
        let err = exec.execute(request).await.unwrap_err();

        assert!(err.is_network());
        assert!(err.is_retryable());
        match err {
            ApiError::Network { code, .. } => assert_eq!(code.as_deref(), Some("timeout")),
            other => panic!("expected Network, got {:?}", other),
        }
    }
}
