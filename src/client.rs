//! Governed API client facade.
//!
//! Owns one limiter, one executor, and one deduplicator, and exposes the
//! `execute(method, path, body, options)` surface the host application calls. The
//! facade is responsible for everything that happens before governance kicks in:
//! input validation, URL assembly with percent-encoded query params, the HTTP Basic
//! auth header, and the deduplication key.
//!
//! Only GET requests are coalesced; mutating requests always go straight to the
//! executor.

use crate::clock::Clock;
use crate::config::{ClientConfig, ConfigError};
use crate::dedup::Deduplicator;
use crate::error::ApiError;
use crate::executor::{ApiRequest, ExecutorConfig, Payload, RequestExecutor};
use crate::limiter::{LimiterStats, TokenBucketLimiter};
use crate::sleeper::Sleeper;
use crate::transport::{Method, ReqwestTransport, Transport};
use crate::{Backoff, Jitter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-call options: extra headers, query params, and a timeout override.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub params: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// REST API client with rate limiting, classified retries, and GET coalescing.
pub struct ApiClient {
    executor: Arc<RequestExecutor>,
    dedup: Deduplicator<Payload>,
    limiter: Arc<TokenBucketLimiter>,
    base_url: url::Url,
    auth_header: String,
}

impl ApiClient {
    /// Start building a client from validated configuration.
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder { config, transport: None, clock: None, sleeper: None }
    }

    /// Perform one governed request against `path` relative to the base URL.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Payload, ApiError> {
        if path.trim().is_empty() {
            return Err(ApiError::validation(
                "request path must not be empty",
                Some("path".into()),
                None,
            ));
        }

        let mut url = self.base_url.join(path.trim_start_matches('/')).map_err(|err| {
            ApiError::validation(
                format!("invalid request path: {}", err),
                Some("path".into()),
                Some(path.to_string()),
            )
        })?;

        // Sorted params give every caller of the same logical operation the same URL,
        // which is what the dedup key is built from.
        let mut params = options.params;
        params.sort();
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), self.auth_header.clone());
        headers.insert("Accept".to_string(), "application/json".to_string());
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        headers.extend(options.headers);

        let mut request = ApiRequest::new(method, url.to_string());
        request.headers = headers;
        request.body = body;
        request.timeout = options.timeout;

        if method.is_idempotent_read() {
            let key = format!("{} {}", method, url);
            let executor = self.executor.clone();
            self.dedup.run(&key, move || async move { executor.execute(request).await }).await
        } else {
            self.executor.execute(request).await
        }
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<Payload, ApiError> {
        self.execute(Method::Get, path, None, options).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<Payload, ApiError> {
        self.execute(Method::Post, path, Some(body), options).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<Payload, ApiError> {
        self.execute(Method::Put, path, Some(body), options).await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<Payload, ApiError> {
        self.execute(Method::Delete, path, None, options).await
    }

    /// Snapshot of the shared limiter.
    pub fn limiter_stats(&self) -> LimiterStats {
        self.limiter.stats()
    }

    /// Stop the limiter's background tick and settle any queued waiters. Idempotent.
    pub fn shutdown(&self) {
        self.limiter.destroy();
    }
}

/// Builder wiring the governance triad together with injectable collaborators.
pub struct ApiClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl ApiClientBuilder {
    /// Replace the production transport, e.g. with a scripted fake.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Validate the configuration and assemble the client.
    ///
    /// Must be called from within a tokio runtime; the limiter spawns its drain tick
    /// here.
    pub fn build(self) -> Result<ApiClient, ConfigError> {
        self.config.validate()?;

        // Url::join treats the last segment of a slash-less base as a file and would
        // drop it; normalize so relative paths always append.
        let mut base = self.config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = url::Url::parse(&base)
            .map_err(|err| ConfigError::InvalidBaseUrl(err.to_string()))?;

        let backoff = Backoff::exponential(
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        )
        .map_err(|_| ConfigError::DelayBoundsInverted {
            base: self.config.base_delay_ms,
            max: self.config.max_delay_ms,
        })?;

        let limiter = match self.clock {
            Some(clock) => TokenBucketLimiter::with_clock(
                self.config.burst_limit,
                self.config.requests_per_minute,
                Duration::from_millis(self.config.queue_timeout_ms),
                clock,
            ),
            None => TokenBucketLimiter::new(
                self.config.burst_limit,
                self.config.requests_per_minute,
                Duration::from_millis(self.config.queue_timeout_ms),
            ),
        };

        let transport =
            self.transport.unwrap_or_else(|| Arc::new(ReqwestTransport::new()) as Arc<dyn Transport>);
        let executor_config = ExecutorConfig {
            max_retries: self.config.max_retries,
            backoff,
            jitter: Jitter::None,
            timeout: Duration::from_millis(self.config.timeout_ms),
        };
        let mut executor = RequestExecutor::new(transport, limiter.clone(), executor_config);
        if let Some(sleeper) = self.sleeper {
            executor = executor.with_sleeper(sleeper);
        }

        let auth_header = format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", self.config.email, self.config.api_token))
        );

        Ok(ApiClient {
            executor: Arc::new(executor),
            dedup: Deduplicator::new(),
            limiter,
            base_url,
            auth_header,
        })
    }
}
