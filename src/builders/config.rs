//! Configuration Builder
//!
//! Fluent builder for client configuration.

use std::time::Duration;

use crate::error::{ApiError, ConfigurationError};
use crate::types::{
    CacheConfig, CircuitBreakerConfig, ClassifierConfig, ClientConfig, NotificationConfig,
    PollingProfile, RetryPolicy,
};
use secrecy::SecretString;

/// Client configuration builder.
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
    client_id: Option<String>,
}

impl ClientConfigBuilder {
    /// Create new configuration builder starting from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            client_id: None,
        }
    }

    /// Set API base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Set marketplace ID (e.g. `EBAY_GB`).
    pub fn marketplace_id(mut self, marketplace_id: impl Into<String>) -> Self {
        self.config.marketplace_id = marketplace_id.into();
        self
    }

    /// Set request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set maximum retries.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    /// Set base and maximum backoff delays.
    pub fn backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.config.retry.base_delay = base_delay;
        self.config.retry.max_delay = max_delay;
        self
    }

    pub fn classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.config.classifier = classifier;
        self
    }

    /// Add a provider error code that is always retried.
    pub fn add_retryable_error_code(mut self, code: impl Into<String>) -> Self {
        self.config.classifier.retryable_error_codes.insert(code.into());
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = breaker;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Set polling profile for token detection.
    pub fn polling(mut self, profile: PollingProfile) -> Self {
        self.config.polling = profile;
        self
    }

    pub fn notifications(mut self, notifications: NotificationConfig) -> Self {
        self.config.notifications = notifications;
        self
    }

    /// Set token endpoint.
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.refresh.token_endpoint = endpoint.into();
        self
    }

    /// Set client ID.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set client secret.
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.config.refresh.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Add an OAuth scope requested on refresh.
    pub fn add_scope(mut self, scope: impl Into<String>) -> Self {
        self.config.refresh.scopes.push(scope.into());
        self
    }

    /// Set how long before expiry a token is refreshed.
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.config.refresh.refresh_margin = margin;
        self
    }

    /// Build the client configuration.
    pub fn build(mut self) -> Result<ClientConfig, ApiError> {
        if let Some(client_id) = self.client_id {
            if client_id.trim().is_empty() {
                return Err(ApiError::Configuration(ConfigurationError::MissingRequired {
                    field: "client_id".to_string(),
                }));
            }
            self.config.refresh.client_id = client_id;
        }

        // A secret is only usable alongside the id it belongs to
        if self.config.refresh.client_secret.is_some() && self.config.refresh.client_id.is_empty()
        {
            return Err(ApiError::Configuration(ConfigurationError::MissingRequired {
                field: "client_id".to_string(),
            }));
        }

        self.config.validate()?;
        Ok(self.config)
    }
}

/// Create a new client configuration builder.
pub fn client_config() -> ClientConfigBuilder {
    ClientConfigBuilder::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_success() {
        let config = ClientConfigBuilder::new()
            .base_url("https://api.sandbox.ebay.com")
            .marketplace_id("EBAY_GB")
            .client_id("test-client")
            .client_secret("test-secret")
            .add_scope("https://api.ebay.com/oauth/api_scope")
            .max_retries(3)
            .build()
            .unwrap();

        assert_eq!(config.base_url, "https://api.sandbox.ebay.com");
        assert_eq!(config.marketplace_id, "EBAY_GB");
        assert_eq!(config.refresh.client_id, "test-client");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.refresh.scopes.len(), 1);
    }

    #[test]
    fn test_builder_defaults() {
        let config = client_config().build().unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.retry.max_delay, Duration::from_millis(60000));
        assert!(config
            .classifier
            .retryable_status_codes
            .iter()
            .eq([429u16, 500, 502, 503, 504].iter()));
    }

    #[test]
    fn test_builder_rejects_invalid_base_url() {
        let result = client_config().base_url("not a url").build();
        assert!(matches!(
            result,
            Err(ApiError::Configuration(ConfigurationError::InvalidEndpoint { .. }))
        ));
    }

    #[test]
    fn test_builder_rejects_inverted_backoff() {
        let result = client_config()
            .backoff(Duration::from_secs(10), Duration::from_secs(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_quorum() {
        let result = client_config()
            .polling(PollingProfile {
                quorum: 0,
                ..PollingProfile::standard()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_secret_without_client_id() {
        let result = client_config().client_secret("orphan").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_custom_retryable_code() {
        let config = client_config()
            .add_retryable_error_code("25001")
            .build()
            .unwrap();
        assert!(config.classifier.retryable_error_codes.contains("25001"));
    }
}
