//! Client configuration and validation.

use serde::{Deserialize, Serialize};

/// Configuration for a governed API client.
///
/// Durations are plain milliseconds so the struct round-trips through JSON settings
/// files unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root of the target REST API, e.g. `https://example.atlassian.net/rest/api/2/`.
    pub base_url: String,
    /// Account email for HTTP Basic auth.
    pub email: String,
    /// API token paired with `email`.
    pub api_token: String,
    /// Steady-state request budget.
    pub requests_per_minute: u32,
    /// Burst ceiling of the token bucket.
    pub burst_limit: u32,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-attempt transport timeout.
    pub timeout_ms: u64,
    /// How long a queued waiter may sit before settling with a timeout.
    pub queue_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            email: String::new(),
            api_token: String::new(),
            requests_per_minute: 100,
            burst_limit: 100,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            timeout_ms: 30_000,
            queue_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Default governance settings pointed at `base_url` with the given credentials.
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            email: email.into(),
            api_token: api_token.into(),
            ..Self::default()
        }
    }

    /// Check every bound the limiter, backoff, and transport rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        if let Err(err) = url::Url::parse(&self.base_url) {
            return Err(ConfigError::InvalidBaseUrl(err.to_string()));
        }
        if self.email.trim().is_empty() {
            return Err(ConfigError::EmptyEmail);
        }
        if self.api_token.trim().is_empty() {
            return Err(ConfigError::EmptyApiToken);
        }
        if self.requests_per_minute == 0 {
            return Err(ConfigError::InvalidRefillRate);
        }
        if self.burst_limit == 0 {
            return Err(ConfigError::InvalidBurstLimit);
        }
        if self.max_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::DelayBoundsInverted {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }
}

/// Errors produced while validating a [`ClientConfig`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("base_url must not be empty")]
    EmptyBaseUrl,
    #[error("base_url is not a valid URL: {0}")]
    InvalidBaseUrl(String),
    #[error("email must not be empty")]
    EmptyEmail,
    #[error("api_token must not be empty")]
    EmptyApiToken,
    #[error("requests_per_minute must be >= 1")]
    InvalidRefillRate,
    #[error("burst_limit must be >= 1")]
    InvalidBurstLimit,
    #[error("max_delay_ms ({max}) must be >= base_delay_ms ({base}) and positive")]
    DelayBoundsInverted { base: u64, max: u64 },
    #[error("timeout_ms must be >= 1")]
    InvalidTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ClientConfig {
        ClientConfig::new("https://example.test/rest/api/2/", "user@example.test", "token")
    }

    #[test]
    fn defaults_match_documented_governance_settings() {
        let config = ClientConfig::default();
        assert_eq!(config.requests_per_minute, 100);
        assert_eq!(config.burst_limit, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.timeout_ms, 30_000);
    }

    #[test]
    fn valid_config_passes() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let mut config = valid();
        config.email = "  ".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptyEmail));

        let mut config = valid();
        config.api_token = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyApiToken));
    }

    #[test]
    fn malformed_base_url_is_rejected() {
        let mut config = valid();
        config.base_url = "not a url".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBaseUrl(_))));
    }

    #[test]
    fn zero_rates_are_rejected() {
        let mut config = valid();
        config.requests_per_minute = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRefillRate));

        let mut config = valid();
        config.burst_limit = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBurstLimit));
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let mut config = valid();
        config.base_delay_ms = 60_000;
        assert!(matches!(config.validate(), Err(ConfigError::DelayBoundsInverted { .. })));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = valid();
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: ClientConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, config);
    }
}
