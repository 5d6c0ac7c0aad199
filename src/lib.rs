#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Client-side request governance for REST APIs: many independent parts of an
//! application issue calls freely while the aggregate rate never exceeds the server's
//! quota, transient failures are retried safely, and duplicate in-flight requests are
//! coalesced.
//!
//! ## The governance triad
//!
//! - **[`TokenBucketLimiter`]**: token-bucket admission control with lazy refill and an
//!   explicit FIFO wait queue.
//! - **[`RequestExecutor`]**: limiter gate → transport call → outcome classification →
//!   capped exponential retry → typed error.
//! - **[`Deduplicator`]**: same-key in-flight calls share one execution and one
//!   settlement.
//!
//! [`ApiClient`] wires the triad together behind an
//! `execute(method, path, body, options)` surface with HTTP Basic auth and
//! percent-encoded query params. Transport, clock, and sleeper are injectable, so the
//! whole stack tests without a network or real time.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use floodgate::{ApiClient, ClientConfig, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(
//!         "https://example.atlassian.net/rest/api/2",
//!         "me@example.com",
//!         "api-token",
//!     );
//!     let client = ApiClient::builder(config).build()?;
//!
//!     let issue = client.get("issue/PROJ-1", RequestOptions::new()).await?;
//!     println!("{:?}", issue.as_json());
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod jitter;
pub mod limiter;
pub mod sleeper;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use client::{ApiClient, ApiClientBuilder, RequestOptions};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ClientConfig, ConfigError};
pub use dedup::Deduplicator;
pub use error::ApiError;
pub use executor::{ApiRequest, ExecutorConfig, Payload, RequestExecutor};
pub use jitter::Jitter;
pub use limiter::{Acquisition, LimiterStats, TokenBucketLimiter, WaitError};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{
    Method, ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse,
};
