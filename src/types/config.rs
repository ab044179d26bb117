//! Configuration Types
//!
//! Client configuration. Durations are carried as milliseconds on the wire and
//! option names follow the camelCase spelling used by the web client.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

use crate::error::{ApiError, ApiResult, ConfigurationError};

/// Default eBay production API root.
pub const DEFAULT_BASE_URL: &str = "https://api.ebay.com";
/// Default eBay OAuth token endpoint.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://api.ebay.com/identity/v1/oauth2/token";
pub const DEFAULT_MARKETPLACE_ID: &str = "EBAY_US";
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 300;

/// Retry and backoff policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction of the delay added as uniform jitter (0.0-1.0).
    pub jitter_factor: f64,
    /// Factor used for rate limits without a `Retry-After` header.
    pub rate_limit_factor: f64,
    pub server_error_factor: f64,
    /// Upper bound of the extra uniform jitter added to network retries.
    #[serde(with = "duration_ms")]
    pub network_extra_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        DEFAULT_RETRY_POLICY
    }
}

/// Default retry policy.
pub const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    max_retries: 5,
    base_delay: Duration::from_millis(1000),
    max_delay: Duration::from_millis(60000),
    backoff_factor: 2.0,
    jitter_factor: 0.1,
    rate_limit_factor: 3.0,
    server_error_factor: 2.5,
    network_extra_jitter: Duration::from_millis(2000),
};

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.backoff_factor < 1.0
            || self.rate_limit_factor < 1.0
            || self.server_error_factor < 1.0
        {
            return Err(invalid("backoff factors must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(invalid("jitterFactor must be within 0.0..=1.0"));
        }
        if self.base_delay > self.max_delay {
            return Err(invalid("baseDelay must not exceed maxDelay"));
        }
        Ok(())
    }
}

/// Error classifier configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassifierConfig {
    pub retryable_status_codes: BTreeSet<u16>,
    /// Provider error codes that are retryable regardless of status.
    pub retryable_error_codes: BTreeSet<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
            // eBay "system error" / "service unavailable" ids plus the OAuth transient codes.
            retryable_error_codes: ["10001", "20001", "server_error", "temporarily_unavailable"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Two-tier cache configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    #[serde(with = "duration_ms")]
    pub hot_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub warm_ttl: Duration,
    /// Values up to this size go to the hot tier when no tier is given.
    pub hot_item_max_bytes: usize,
    /// Values larger than this are never cached.
    pub max_item_bytes: usize,
    /// Warm hits beyond this count promote the entry to hot.
    pub promotion_threshold: u32,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 100,
            warm_capacity: 500,
            hot_ttl: Duration::from_secs(5 * 60),
            warm_ttl: Duration::from_secs(30 * 60),
            hot_item_max_bytes: 4 * 1024,
            max_item_bytes: 1024 * 1024,
            promotion_threshold: 3,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Adaptive polling profile for token detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollingProfile {
    #[serde(with = "duration_ms")]
    pub base_interval: Duration,
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
    pub growth_factor: f64,
    #[serde(with = "duration_ms")]
    pub jitter_max: Duration,
    /// Hard ceiling on total polling time.
    #[serde(with = "duration_ms")]
    pub max_duration: Duration,
    /// Backends that must report the same token before it is trusted.
    pub quorum: usize,
}

impl Default for PollingProfile {
    fn default() -> Self {
        Self::standard()
    }
}

impl PollingProfile {
    /// Startup detection.
    pub fn standard() -> Self {
        Self {
            base_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(5000),
            growth_factor: 1.5,
            jitter_max: Duration::from_millis(100),
            max_duration: Duration::from_secs(30),
            quorum: 2,
        }
    }

    /// Fallback used when callback-based synchronization after a popup fails.
    pub fn emergency() -> Self {
        Self {
            base_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(200),
            growth_factor: 1.5,
            jitter_max: Duration::from_millis(10),
            max_duration: Duration::from_secs(3),
            quorum: 2,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.quorum == 0 {
            return Err(invalid("polling quorum must be at least 1"));
        }
        if self.growth_factor < 1.0 {
            return Err(invalid("polling growthFactor must be >= 1.0"));
        }
        if self.base_interval.is_zero() || self.base_interval > self.max_interval {
            return Err(invalid(
                "polling baseInterval must be non-zero and not exceed maxInterval",
            ));
        }
        Ok(())
    }
}

/// Batching of token change notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationConfig {
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,
    /// Flush early once this many events are pending.
    pub max_batch: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(50),
            max_batch: 32,
        }
    }
}

/// Circuit breaker thresholds for repeated server errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive server errors before the circuit opens.
    pub failure_threshold: u32,
    /// Half-open successes needed to close the circuit again.
    pub success_threshold: u32,
    #[serde(with = "duration_ms")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Token refresh endpoint configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshConfig {
    pub token_endpoint: String,
    pub client_id: String,
    /// Never read from configuration files.
    #[serde(skip)]
    pub client_secret: Option<SecretString>,
    pub scopes: Vec<String>,
    /// Refresh this long before expiry.
    #[serde(with = "duration_ms")]
    pub refresh_margin: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            client_id: String::new(),
            client_secret: None,
            scopes: Vec::new(),
            refresh_margin: Duration::from_secs(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }
}

impl std::fmt::Debug for RefreshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}

/// Complete client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub base_url: String,
    pub marketplace_id: String,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub classifier: ClassifierConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub polling: PollingProfile,
    pub notifications: NotificationConfig,
    pub refresh: RefreshConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            marketplace_id: DEFAULT_MARKETPLACE_ID.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            classifier: ClassifierConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            polling: PollingProfile::default(),
            notifications: NotificationConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(raw: &str) -> ApiResult<Self> {
        let config: ClientConfig = serde_json::from_str(raw).map_err(|e| {
            ApiError::Configuration(ConfigurationError::InvalidConfig {
                message: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `EBAY_*` environment variables.
    pub fn from_env() -> ApiResult<Self> {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("EBAY_API_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(marketplace) = std::env::var("EBAY_MARKETPLACE_ID") {
            config.marketplace_id = marketplace;
        }
        if let Some(max_retries) = env_parse::<u32>("EBAY_MAX_RETRIES")? {
            config.retry.max_retries = max_retries;
        }
        if let Some(ms) = env_parse::<u64>("EBAY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("EBAY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("EBAY_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Ok(endpoint) = std::env::var("EBAY_TOKEN_ENDPOINT") {
            config.refresh.token_endpoint = endpoint;
        }
        if let Ok(client_id) = std::env::var("EBAY_CLIENT_ID") {
            config.refresh.client_id = client_id;
        }
        if let Ok(secret) = std::env::var("EBAY_CLIENT_SECRET") {
            config.refresh.client_secret = Some(SecretString::new(secret));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired {
                field: "baseUrl".to_string(),
            });
        }
        Url::parse(&self.base_url).map_err(|_| ConfigurationError::InvalidEndpoint {
            url: self.base_url.clone(),
        })?;
        Url::parse(&self.refresh.token_endpoint).map_err(|_| {
            ConfigurationError::InvalidEndpoint {
                url: self.refresh.token_endpoint.clone(),
            }
        })?;
        self.retry.validate()?;
        self.polling.validate()?;
        if self.cache.hot_capacity == 0 || self.cache.warm_capacity == 0 {
            return Err(invalid("cache tier capacities must be at least 1"));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(invalid("cache sweepInterval must be non-zero"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit breaker failureThreshold must be at least 1"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigurationError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(&format!("{} is not a valid number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::InvalidConfig {
        message: message.to_string(),
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(60000));
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.jitter_factor, 0.1);
        assert_eq!(policy.rate_limit_factor, 3.0);
    }

    #[test]
    fn test_default_classifier_statuses() {
        let config = ClassifierConfig::default();
        for status in [429, 500, 502, 503, 504] {
            assert!(config.retryable_status_codes.contains(&status));
        }
        assert!(!config.retryable_status_codes.contains(&404));
    }

    #[test]
    fn test_from_json_uses_millis_and_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{
                "retry": { "maxRetries": 2, "baseDelay": 250 },
                "polling": { "baseInterval": 25, "maxInterval": 200, "maxDuration": 3000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_millis(60000));
        assert_eq!(config.polling.max_duration, Duration::from_secs(3));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        let result = ClientConfig::from_json_str(r#"{ "retry": { "jitterFactor": 1.5 } }"#);
        assert!(matches!(result, Err(ApiError::Configuration(_))));
    }

    #[test]
    fn test_emergency_profile_is_capped() {
        let profile = PollingProfile::emergency();
        assert_eq!(profile.base_interval, Duration::from_millis(25));
        assert_eq!(profile.max_duration, Duration::from_secs(3));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_refresh_config_debug_redacts_secret() {
        let config = RefreshConfig {
            client_secret: Some(SecretString::new("hunter2".to_string())),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
