//! Typed error taxonomy for the request governance layer.
//!
//! The taxonomy is closed: every failure path out of the executor produces exactly one
//! of these variants. Each variant carries a human-readable message and the UTC
//! timestamp at which it was constructed. Retry policy is derived from the variant,
//! never from string matching:
//!
//! - `Network` and `Api` with status >= 500 are retryable.
//! - `Authentication`, `RateLimited`, `Validation`, and other `Api` statuses are not.
//!
//! Errors are `Clone` so a coalesced in-flight request can hand the same failure to
//! every joined caller.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Unified error type for governed API calls.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum ApiError {
    /// Transport-level failure before any HTTP status was obtained (timeout, DNS,
    /// connection reset).
    #[error("{message}")]
    Network {
        message: String,
        /// Coarse transport error code when known (e.g. "timeout", "connect").
        code: Option<String>,
        url: String,
        timestamp: DateTime<Utc>,
    },
    /// The server rejected our credentials (401 or 403).
    #[error("{message}")]
    Authentication { message: String, status: u16, timestamp: DateTime<Utc> },
    /// Denied by the local limiter, or throttled by the server (429).
    #[error("{message}")]
    RateLimited {
        message: String,
        /// How long the caller should wait before trying again.
        retry_after: Duration,
        /// Server-reported request quota, when present.
        limit: Option<u32>,
        /// Server-reported remaining quota, when present.
        remaining: Option<u32>,
        timestamp: DateTime<Utc>,
    },
    /// Any other non-success HTTP status.
    #[error("{message}")]
    Api {
        message: String,
        status: u16,
        status_text: String,
        /// Error strings mined from a structured JSON error body, when present.
        messages: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Malformed input caught before any network call was attempted.
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
        value: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ApiError {
    pub fn network(message: impl Into<String>, code: Option<String>, url: impl Into<String>) -> Self {
        Self::Network { message: message.into(), code, url: url.into(), timestamp: Utc::now() }
    }

    pub fn authentication(status: u16) -> Self {
        Self::Authentication {
            message: format!("authentication rejected (status {})", status),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn rate_limited(retry_after: Duration, limit: Option<u32>, remaining: Option<u32>) -> Self {
        Self::RateLimited {
            message: format!("rate limited; retry after {} ms", retry_after.as_millis()),
            retry_after,
            limit,
            remaining,
            timestamp: Utc::now(),
        }
    }

    pub fn api(status: u16, status_text: impl Into<String>, messages: Vec<String>) -> Self {
        let status_text = status_text.into();
        let message = if messages.is_empty() {
            format!("API error {} {}", status, status_text)
        } else {
            format!("API error {} {}: {}", status, status_text, messages.join("; "))
        };
        Self::Api { message, status, status_text, messages, timestamp: Utc::now() }
    }

    pub fn validation(
        message: impl Into<String>,
        field: Option<String>,
        value: Option<String>,
    ) -> Self {
        Self::Validation { message: message.into(), field, value, timestamp: Utc::now() }
    }

    /// Whether the executor may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status associated with this error, if one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Suggested wait before retrying, for rate-limit failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// When this error was constructed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Network { timestamp, .. }
            | Self::Authentication { timestamp, .. }
            | Self::RateLimited { timestamp, .. }
            | Self::Api { timestamp, .. }
            | Self::Validation { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
