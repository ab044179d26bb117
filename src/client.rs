//! eBay API Client
//!
//! High-level client that combines token lifecycle, classified retries and
//! the response cache behind a single `call`.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::cache::{content_key, CacheTier, SmartCache};
use crate::core::{HttpMethod, HttpRequest, HttpTransport, ReqwestHttpTransport};
use crate::error::{ApiError, ApiResult, ConfigurationError, RequestError};
use crate::resilience::{CircuitBreaker, InvokeContext, RefreshCallback, ResilientInvoker};
use crate::telemetry::{MetricsSnapshot, RetryMetrics};
use crate::token::{
    HttpTokenRefresher, NotificationBatcher, TokenLifecycleManager, TokenRefresher, TokenStore,
    TokenSynchronizer,
};
use crate::types::{ClientConfig, RetryPolicy};

/// eBay marketplace header.
pub const MARKETPLACE_HEADER: &str = "X-EBAY-C-MARKETPLACE-ID";
/// Taxonomy category tree endpoint prefix.
pub const CATEGORY_TREE_ENDPOINT: &str = "/commerce/taxonomy/v1/category_tree";

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Per-call options.
#[derive(Clone)]
pub struct CallContext {
    pub method: HttpMethod,
    pub body: Option<serde_json::Value>,
    /// Overrides the client's retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Opts the call into the response cache.
    pub cache_key: Option<String>,
    pub cache_tier: Option<CacheTier>,
    pub cache_ttl: Option<Duration>,
    /// Overrides the lifecycle manager's refresh for `Auth` recovery.
    pub token_refresh_callback: Option<RefreshCallback>,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            body: None,
            retry_policy: None,
            cache_key: None,
            cache_tier: None,
            cache_ttl: None,
            token_refresh_callback: None,
            deadline: None,
            cancel: None,
        }
    }
}

impl CallContext {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cache(mut self, key: impl Into<String>, tier: Option<CacheTier>) -> Self {
        self.cache_key = Some(key.into());
        self.cache_tier = tier;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_token_refresh(mut self, callback: RefreshCallback) -> Self {
        self.token_refresh_callback = Some(callback);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("method", &self.method)
            .field("has_body", &self.body.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("cache_key", &self.cache_key)
            .field("cache_tier", &self.cache_tier)
            .field("cache_ttl", &self.cache_ttl)
            .field("token_refresh_callback", &self.token_refresh_callback.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// eBay REST client.
pub struct ApiClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    invoker: Arc<ResilientInvoker>,
    lifecycle: Arc<TokenLifecycleManager>,
    cache: Arc<SmartCache<serde_json::Value>>,
    sweeper: JoinHandle<()>,
}

impl ApiClient {
    /// Client over reqwest, refreshing through the configured token endpoint.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig, store: Arc<TokenStore>) -> ApiResult<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestHttpTransport::with_options(
            config.request_timeout,
            MAX_RESPONSE_SIZE,
        )?);
        let refresher = Arc::new(HttpTokenRefresher::new(
            transport.clone(),
            config.refresh.clone(),
            config.request_timeout,
        ));
        Self::with_components(config, transport, store, refresher)
    }

    /// Client with custom implementations.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_components(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> ApiResult<Self> {
        config.validate()?;

        let metrics = Arc::new(RetryMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let invoker = Arc::new(
            ResilientInvoker::new(config.retry.clone(), config.classifier.clone(), metrics.clone())
                .with_circuit_breaker(breaker),
        );
        // the token endpoint is a different host, so API server errors must
        // not trip its breaker
        let refresh_invoker = Arc::new(ResilientInvoker::new(
            config.retry.clone(),
            config.classifier.clone(),
            metrics,
        ));

        let notifier = NotificationBatcher::spawn(config.notifications.clone());
        let sync = Arc::new(TokenSynchronizer::new(store, notifier, config.polling.clone()));
        let lifecycle = Arc::new(TokenLifecycleManager::new(
            sync,
            refresher,
            refresh_invoker,
            config.refresh.refresh_margin,
        ));

        let cache = Arc::new(SmartCache::new(config.cache.clone()));
        let sweeper = cache.spawn_sweeper();

        Ok(Self {
            config,
            transport,
            invoker,
            lifecycle,
            cache,
            sweeper,
        })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<TokenLifecycleManager> {
        &self.lifecycle
    }

    pub fn synchronizer(&self) -> &Arc<TokenSynchronizer> {
        self.lifecycle.synchronizer()
    }

    pub fn invoker(&self) -> &Arc<ResilientInvoker> {
        &self.invoker
    }

    pub fn cache(&self) -> &Arc<SmartCache<serde_json::Value>> {
        &self.cache
    }

    /// Retry and error counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.invoker.metrics().snapshot()
    }

    /// Access token good for at least the refresh margin.
    pub async fn get_valid_token(&self) -> ApiResult<String> {
        self.lifecycle.get_valid_token().await
    }

    /// Drop cached responses whose key matches `pattern`.
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern)
    }

    /// Stable cache key for an endpoint and its query parameters.
    pub fn request_cache_key(endpoint: &str, params: &[(&str, &str)]) -> ApiResult<String> {
        content_key(endpoint, params).map_err(|e| {
            ApiError::Configuration(ConfigurationError::InvalidConfig {
                message: format!("cannot derive cache key: {}", e),
            })
        })
    }

    /// Call an eBay REST endpoint.
    ///
    /// A cached response is returned without touching the network. Otherwise
    /// every attempt fetches a valid token, and failures are classified and
    /// retried by the invoker.
    #[instrument(skip(self, params, ctx), fields(method = ctx.method.as_str()))]
    pub async fn call(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        ctx: CallContext,
    ) -> ApiResult<serde_json::Value> {
        if let Some(key) = &ctx.cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(key = %key, "Cache hit");
                return Ok(hit);
            }
        }

        let url = self.build_url(endpoint, params)?;
        let body = match &ctx.body {
            Some(body) => Some(serde_json::to_string(body).map_err(|e| {
                ApiError::Request(RequestError::Protocol {
                    message: format!("cannot encode request body: {}", e),
                })
            })?),
            None => None,
        };

        // access token sent by the latest attempt
        let sent_token: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let refresh = ctx
            .token_refresh_callback
            .clone()
            .unwrap_or_else(|| self.lifecycle.refresh_callback(sent_token.clone()));
        let mut invoke_ctx = InvokeContext::new(endpoint).with_token_refresh(refresh);
        if let Some(policy) = ctx.retry_policy.clone() {
            invoke_ctx = invoke_ctx.with_policy(policy);
        }
        if let Some(deadline) = ctx.deadline {
            invoke_ctx = invoke_ctx.with_deadline(deadline);
        }
        if let Some(cancel) = ctx.cancel.clone() {
            invoke_ctx = invoke_ctx.with_cancel(cancel);
        }

        let method = ctx.method;
        let value = self
            .invoker
            .invoke(
                || self.send_once(method, &url, body.as_deref(), &sent_token),
                invoke_ctx,
            )
            .await?;

        if let Some(key) = ctx.cache_key {
            self.cache.set(key, value.clone(), ctx.cache_tier, ctx.cache_ttl);
        }
        Ok(value)
    }

    /// [`ApiClient::call`] with the response deserialized into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        ctx: CallContext,
    ) -> ApiResult<T> {
        let value = self.call(endpoint, params, ctx).await?;
        serde_json::from_value(value).map_err(|e| {
            ApiError::Request(RequestError::Protocol {
                message: format!("unexpected response shape: {}", e),
            })
        })
    }

    /// Category tree for a marketplace, cached in the warm tier.
    pub async fn get_categories(&self, tree_id: &str) -> ApiResult<serde_json::Value> {
        let endpoint = format!("{}/{}", CATEGORY_TREE_ENDPOINT, tree_id);
        let key = Self::request_cache_key(&endpoint, &[])?;
        self.call(
            &endpoint,
            &[],
            CallContext::get().with_cache(key, Some(CacheTier::Warm)),
        )
        .await
    }

    fn build_url(&self, endpoint: &str, params: &[(&str, &str)]) -> ApiResult<String> {
        let raw = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        let mut url = Url::parse(&raw)
            .map_err(|_| ApiError::Configuration(ConfigurationError::InvalidEndpoint { url: raw }))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        Ok(url.into())
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&str>,
        sent_token: &Mutex<Option<String>>,
    ) -> ApiResult<serde_json::Value> {
        let token = self.lifecycle.get_valid_token().await?;
        *sent_token.lock() = Some(token.clone());

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert(
            MARKETPLACE_HEADER.to_string(),
            self.config.marketplace_id.clone(),
        );
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        let response = self
            .transport
            .send(HttpRequest {
                method,
                url: url.to_string(),
                headers,
                body: body.map(String::from),
                timeout: Some(self.config.request_timeout),
            })
            .await?;

        if !response.is_success() {
            return Err(response.into_error().into());
        }
        if response.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&response.body).map_err(|e| {
            ApiError::Request(RequestError::Protocol {
                message: format!("invalid JSON response: {}", e),
            })
        })
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Create a new API client.
pub fn api_client(config: ClientConfig, store: Arc<TokenStore>) -> ApiResult<ApiClient> {
    ApiClient::new(config, store)
}
