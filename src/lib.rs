//! eBay Resilient Client
//!
//! eBay REST client with classified retries, multi-backend OAuth token
//! synchronization and a two-tier response cache.
//!
//! # Features
//!
//! - Error classification into rate-limit, auth, server, business, network and unknown
//! - Category-specific recovery: `Retry-After`, token refresh, backoff, fail fast
//! - Token propagation across durable, ephemeral, global, channel and marker backends
//! - Quorum-based token detection with adaptive polling
//! - Single-flight token refresh with a configurable expiry margin
//! - Hot/warm response cache with LRU eviction and TTL sweeping
//! - Retry and error metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ebay_resilient_client::{client_config, ApiClient, CallContext, TokenStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = client_config()
//!         .client_id("my-client-id")
//!         .client_secret("my-client-secret")
//!         .marketplace_id("EBAY_GB")
//!         .build()?;
//!
//!     let store = Arc::new(TokenStore::in_memory());
//!     let client = ApiClient::new(config, store)?;
//!
//!     let results = client
//!         .call(
//!             "/buy/browse/v1/item_summary/search",
//!             &[("q", "lego"), ("limit", "10")],
//!             CallContext::get().with_cache("search:lego", None),
//!         )
//!         .await?;
//!
//!     println!("{}", results);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: token and configuration types
//! - `error`: error hierarchy, categories and user-facing actions
//! - `core`: HTTP transport
//! - `resilience`: backoff, classifier, circuit breaker and the retrying invoker
//! - `token`: backends, store, synchronizer, notifications and lifecycle
//! - `cache`: two-tier response cache
//! - `telemetry`: metrics and logging setup
//! - `builders`: fluent configuration builder
//! - `client`: high-level API facade combining all of the above

pub mod builders;
pub mod cache;
pub mod client;
pub mod core;
pub mod error;
pub mod resilience;
pub mod telemetry;
pub mod token;
pub mod types;

// Re-export main client
pub use client::{api_client, ApiClient, CallContext, CATEGORY_TREE_ENDPOINT, MARKETPLACE_HEADER};

// Re-export builders
pub use builders::{client_config, ClientConfigBuilder};

// Re-export errors
pub use error::{
    get_user_message, ApiError, ApiResult, ClassifiedError, ConfigurationError, ErrorCategory,
    RecoveryStrategy, RequestError, StorageError, TokenError, TransportErrorKind, UserAction,
};

// Re-export types
pub use types::{
    // Config
    CacheConfig, CircuitBreakerConfig, ClassifierConfig, ClientConfig, NotificationConfig,
    PollingProfile, RefreshConfig, RetryPolicy, DEFAULT_RETRY_POLICY,
    // Token
    TokenResponse, TokenSet,
};

// Re-export core components
pub use core::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport, ReqwestHttpTransport,
};

// Re-export resilience
pub use resilience::{
    next_delay, parse_retry_after, CircuitBreaker, CircuitBreakerStats, CircuitState,
    ErrorClassifier, InvokeContext, RefreshCallback, ResilientInvoker, RetryableOperation,
};

// Re-export token management
pub use token::{
    // Backends
    BackendKind, ChannelBackend, FileKeyValueStore, GlobalBackend, GlobalSlot,
    InMemoryKeyValueStore, KeyValueBackend, KeyValueStore, MarkerBackend, TokenBackend,
    // Store and synchronizer
    DetectionResult, DetectionState, TokenStore, TokenSynchronizer, WriteReport,
    // Notifications
    NotificationBatcher, TokenEvent, TokenNotification,
    // Lifecycle
    HttpTokenRefresher, MockTokenRefresher, TokenLifecycleManager, TokenRefresher,
};

// Re-export cache
pub use cache::{content_key, CacheStats, CacheTier, SmartCache};

// Re-export telemetry
pub use telemetry::{init_logging, LogFormat, LogLevel, LoggingConfig, MetricsSnapshot, RetryMetrics};
