//! Configuration types for the SDK clients.

use std::time::Duration;
use url::Url;

/// Connection settings shared by the HTTP clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every request path is joined to.
    pub base_url: Url,
    /// Bearer token sent with every request.
    pub bearer_token: Option<String>,
    /// PEM encoded CA bundle trusted in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
    /// Skip TLS certificate verification.
    pub accept_invalid_certs: bool,
    /// Request timeout.
    pub timeout: Duration,
    /// Retry configuration.
    pub retry_config: RetryConfig,
}

impl ClientConfig {
    /// Create a new configuration with the given base URL.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            bearer_token: None,
            ca_pem: None,
            accept_invalid_certs: false,
            timeout: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_pem = Some(pem);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// HTTP status codes to retry on.
    pub retry_on_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retry_on_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Create a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        std::cmp::min(backoff, self.max_backoff)
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status_codes.contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = RetryConfig {
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn test_conflicts_are_not_retried_by_transport() {
        let config = RetryConfig::default();

        assert!(config.should_retry_status(503));
        assert!(!config.should_retry_status(404));
        assert!(!config.should_retry_status(409));
    }

    #[test]
    fn test_client_config_builders() {
        let url = Url::parse("https://10.0.0.1:6443").unwrap();
        let config = ClientConfig::new(url.clone())
            .with_bearer_token("token")
            .with_timeout(Duration::from_secs(5))
            .with_retry_config(RetryConfig::no_retry());

        assert_eq!(config.base_url, url);
        assert_eq!(config.bearer_token.as_deref(), Some("token"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retry_config.max_retries, 0);
        assert!(!config.accept_invalid_certs);
    }
}
