//! Token Lifecycle
//!
//! Decides when to refresh, refreshes through the resilient invoker, and keeps
//! every backend in step with the result.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::sync::TokenSynchronizer;
use crate::core::{HttpMethod, HttpRequest, HttpTransport};
use crate::error::{ApiError, ApiResult, ErrorCategory, RequestError, TokenError};
use crate::resilience::{InvokeContext, RefreshCallback, ResilientInvoker};
use crate::types::{RefreshConfig, TokenResponse, TokenSet};

/// Token refresh endpoint interface.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a new token response.
    ///
    /// Endpoint failures are returned as [`ApiError::Request`] so the invoker
    /// can classify them.
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenResponse>;
}

/// Refresher posting `grant_type=refresh_token` to the OAuth token endpoint.
pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
    config: RefreshConfig,
    timeout: Duration,
}

impl HttpTokenRefresher {
    pub fn new(transport: Arc<dyn HttpTransport>, config: RefreshConfig, timeout: Duration) -> Self {
        Self {
            transport,
            config,
            timeout,
        }
    }

    fn build_body(&self, refresh_token: &str) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "refresh_token");
        form.append_pair("refresh_token", refresh_token);
        if !self.config.scopes.is_empty() {
            form.append_pair("scope", &self.config.scopes.join(" "));
        }
        if self.config.client_secret.is_none() && !self.config.client_id.is_empty() {
            form.append_pair("client_id", &self.config.client_id);
        }
        form.finish()
    }

    fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert("accept".to_string(), "application/json".to_string());

        if let Some(secret) = &self.config.client_secret {
            let credentials = format!("{}:{}", self.config.client_id, secret.expose_secret());
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            headers.insert("authorization".to_string(), format!("Basic {}", encoded));
        }

        headers
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenResponse> {
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.config.token_endpoint.clone(),
            headers: self.build_headers(),
            body: Some(self.build_body(refresh_token)),
            timeout: Some(self.timeout),
        };

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(response.into_error().into());
        }

        serde_json::from_str(&response.body).map_err(|e| {
            ApiError::Request(RequestError::Protocol {
                message: format!("invalid token response: {}", e),
            })
        })
    }
}

/// Mock token refresher for testing.
#[derive(Default)]
pub struct MockTokenRefresher {
    responses: Mutex<VecDeque<ApiResult<TokenResponse>>>,
    refresh_history: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTokenRefresher {
    /// Create new mock refresher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result (FIFO). Once empty, refreshes succeed with a generated token.
    pub fn queue(&self, result: ApiResult<TokenResponse>) -> &Self {
        self.responses.lock().push_back(result);
        self
    }

    /// Delay every refresh, to widen race windows in tests.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Refresh tokens received, in call order.
    pub fn get_refresh_history(&self) -> Vec<String> {
        self.refresh_history.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.refresh_history.lock().len()
    }
}

#[async_trait]
impl TokenRefresher for MockTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenResponse> {
        let call = {
            let mut history = self.refresh_history.lock();
            history.push(refresh_token.to_string());
            history.len()
        };

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.responses.lock().pop_front();
        queued.unwrap_or_else(|| {
            Ok(TokenResponse {
                access_token: format!("refreshed-access-token-{}", call),
                token_type: "User Access Token".to_string(),
                expires_in: Some(7200),
                refresh_token: None,
                scope: None,
            })
        })
    }
}

/// Owns the decision to refresh and the refresh itself.
pub struct TokenLifecycleManager {
    sync: Arc<TokenSynchronizer>,
    refresher: Arc<dyn TokenRefresher>,
    invoker: Arc<ResilientInvoker>,
    refresh_margin: Duration,
    // single-flight guard for refreshes
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenLifecycleManager {
    pub fn new(
        sync: Arc<TokenSynchronizer>,
        refresher: Arc<dyn TokenRefresher>,
        invoker: Arc<ResilientInvoker>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            sync,
            refresher,
            invoker,
            refresh_margin,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn synchronizer(&self) -> &Arc<TokenSynchronizer> {
        &self.sync
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// Access token that is good for at least the refresh margin.
    ///
    /// The common path reads the store and returns without any network call.
    #[instrument(skip(self))]
    pub async fn get_valid_token(&self) -> ApiResult<String> {
        let current = self
            .sync
            .store()
            .get()
            .await
            .ok_or_else(|| ApiError::unauthenticated("no token available"))?;

        if !current.is_expiring_soon(self.refresh_margin) {
            return Ok(current.access_token);
        }

        let refreshed = self.refresh_single_flight(&current.access_token).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh now, regardless of remaining lifetime.
    pub async fn force_refresh(&self) -> ApiResult<TokenSet> {
        let observed = self
            .sync
            .store()
            .get()
            .await
            .map(|tokens| tokens.access_token)
            .unwrap_or_default();
        self.refresh_single_flight(&observed).await
    }

    /// Refresh because the API rejected `rejected_access_token`.
    ///
    /// When the store already holds a different token with enough lifetime
    /// left, another caller recovered first and that token is returned.
    pub async fn refresh_rejected(&self, rejected_access_token: &str) -> ApiResult<TokenSet> {
        self.refresh_single_flight(rejected_access_token).await
    }

    /// Callback for the invoker's `Auth` recovery.
    ///
    /// `rejected` holds the access token the failed attempt sent. Without one
    /// the callback refreshes unconditionally.
    pub fn refresh_callback(
        self: &Arc<Self>,
        rejected: Arc<Mutex<Option<String>>>,
    ) -> RefreshCallback {
        let manager = Arc::clone(self);
        Arc::new(move || {
            let manager = manager.clone();
            let rejected = rejected.lock().clone();
            async move {
                match rejected {
                    Some(token) => manager.refresh_rejected(&token).await.map(|_| ()),
                    None => manager.force_refresh().await.map(|_| ()),
                }
            }
            .boxed()
        })
    }

    /// Finish an authorization-code flow.
    ///
    /// A `state` mismatch clears every backend and fails without calling `exchange`.
    pub async fn complete_authorization<F, Fut>(
        &self,
        expected_state: &str,
        received_state: &str,
        exchange: F,
    ) -> ApiResult<TokenSet>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<TokenSet>>,
    {
        if expected_state != received_state {
            warn!("Authorization state mismatch, clearing tokens");
            self.sync.clear().await;
            return Err(TokenError::StateMismatch {
                expected: expected_state.to_string(),
                received: received_state.to_string(),
            }
            .into());
        }

        let tokens = exchange().await?;
        self.sync.propagate(tokens.clone()).await?;
        info!("Authorization completed");
        Ok(tokens)
    }

    /// Clear every backend.
    pub async fn logout(&self) {
        self.sync.clear().await;
        info!("Logged out");
    }

    async fn refresh_single_flight(&self, stale_access_token: &str) -> ApiResult<TokenSet> {
        let _guard = self.refresh_lock.lock().await;

        // someone else refreshed while we waited
        if let Some(current) = self.sync.store().get().await {
            if current.access_token != stale_access_token
                && !current.is_expiring_soon(self.refresh_margin)
            {
                return Ok(current);
            }
        }

        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> ApiResult<TokenSet> {
        let current = self
            .sync
            .store()
            .get()
            .await
            .ok_or_else(|| ApiError::unauthenticated("no token available"))?;

        let refresh_token = match current.refresh_token.clone().filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => {
                warn!("Token expiring without a refresh token");
                self.sync.clear().await;
                return Err(ApiError::unauthenticated(TokenError::NoRefreshToken.to_string()));
            }
        };

        let refresher = self.refresher.clone();
        let presented = refresh_token.clone();
        let result = self
            .invoker
            .invoke(
                move || {
                    let refresher = refresher.clone();
                    let presented = presented.clone();
                    async move { refresher.refresh(&presented).await }
                },
                InvokeContext::new("token_refresh"),
            )
            .await
            .and_then(|response| {
                TokenSet::from_response(&response, Utc::now()).map_err(ApiError::from)
            });

        match result {
            Ok(mut tokens) => {
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                if tokens.scopes.is_empty() {
                    tokens.scopes = current.scopes.clone();
                }
                self.sync.propagate(tokens.clone()).await?;
                info!(expires_at = %tokens.expires_at, "Token refreshed");
                Ok(tokens)
            }
            Err(error) if refresh_token_rejected(&error) => {
                warn!(error = %error, "Refresh token rejected, clearing tokens");
                self.sync.clear().await;
                Err(ApiError::unauthenticated(format!(
                    "token refresh failed: {}",
                    error
                )))
            }
            Err(error) => {
                warn!(error = %error, "Token refresh failed, keeping tokens");
                Err(error)
            }
        }
    }
}

/// Whether the token endpoint refused the grant itself, as opposed to being
/// unreachable or failing on its side.
fn refresh_token_rejected(error: &ApiError) -> bool {
    matches!(
        error,
        ApiError::Failed(classified)
            if matches!(classified.category, ErrorCategory::Auth | ErrorCategory::BusinessLogic)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MockHttpTransport;
    use crate::error::TransportErrorKind;
    use crate::resilience::CircuitBreaker;
    use crate::telemetry::RetryMetrics;
    use crate::token::backend::{GlobalBackend, GlobalSlot, TokenBackend};
    use crate::token::notify::NotificationBatcher;
    use crate::token::store::TokenStore;
    use crate::types::{
        CircuitBreakerConfig, ClassifierConfig, NotificationConfig, PollingProfile, RetryPolicy,
    };
    use secrecy::SecretString;

    fn manager(refresher: Arc<dyn TokenRefresher>) -> (Arc<TokenLifecycleManager>, GlobalSlot) {
        let invoker = ResilientInvoker::new(
            RetryPolicy::default(),
            ClassifierConfig::default(),
            Arc::new(RetryMetrics::new()),
        );
        manager_with(refresher, invoker)
    }

    fn manager_with(
        refresher: Arc<dyn TokenRefresher>,
        invoker: ResilientInvoker,
    ) -> (Arc<TokenLifecycleManager>, GlobalSlot) {
        let slot = GlobalSlot::new();
        let store = Arc::new(TokenStore::new(vec![
            Arc::new(GlobalBackend::new(slot.clone())) as Arc<dyn TokenBackend>,
        ]));
        let sync = Arc::new(TokenSynchronizer::new(
            store,
            NotificationBatcher::spawn(NotificationConfig::default()),
            PollingProfile::standard(),
        ));
        (
            Arc::new(TokenLifecycleManager::new(
                sync,
                refresher,
                Arc::new(invoker),
                Duration::from_secs(300),
            )),
            slot,
        )
    }

    fn tokens(access: &str, lifetime: Duration, refresh: Option<&str>) -> TokenSet {
        TokenSet::new(access, refresh.map(String::from), lifetime).unwrap()
    }

    #[tokio::test]
    async fn test_fast_path_makes_no_call() {
        let refresher = Arc::new(MockTokenRefresher::new());
        let (manager, _) = manager(refresher.clone());
        manager
            .synchronizer()
            .propagate(tokens("fresh", Duration::from_secs(3600), Some("r")))
            .await
            .unwrap();

        assert_eq!(manager.get_valid_token().await.unwrap(), "fresh");
        assert_eq!(refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed() {
        let refresher = Arc::new(MockTokenRefresher::new());
        let (manager, slot) = manager(refresher.clone());
        manager
            .synchronizer()
            .propagate(tokens("old", Duration::from_secs(60), Some("refresh-1")))
            .await
            .unwrap();

        let token = manager.get_valid_token().await.unwrap();

        assert_eq!(token, "refreshed-access-token-1");
        assert_eq!(refresher.get_refresh_history(), vec!["refresh-1"]);
        let stored = slot.get().unwrap();
        assert_eq!(stored.access_token, token);
        // the endpoint returned no refresh token, so the old one is kept
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let (manager, _) = manager(Arc::new(MockTokenRefresher::new()));
        assert!(matches!(
            manager.get_valid_token().await,
            Err(ApiError::Unauthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_store() {
        let refresher = Arc::new(MockTokenRefresher::new());
        refresher.queue(Err(RequestError::http(
            400,
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
        )
        .into()));
        let (manager, slot) = manager(refresher.clone());
        manager
            .synchronizer()
            .propagate(tokens("old", Duration::from_secs(60), Some("r")))
            .await
            .unwrap();

        let result = manager.get_valid_token().await;

        assert!(matches!(result, Err(ApiError::Unauthenticated { .. })));
        assert_eq!(refresher.call_count(), 1);
        assert_eq!(slot.get(), None);
        assert_eq!(manager.synchronizer().store().current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_endpoint_keeps_tokens() {
        let refresher = Arc::new(MockTokenRefresher::new());
        for _ in 0..3 {
            refresher.queue(Err(RequestError::transport(
                TransportErrorKind::Timeout,
                "operation timed out",
            )
            .into()));
        }
        let invoker = ResilientInvoker::new(
            RetryPolicy {
                max_retries: 2,
                ..RetryPolicy::default()
            },
            ClassifierConfig::default(),
            Arc::new(RetryMetrics::new()),
        );
        let (manager, slot) = manager_with(refresher.clone(), invoker);
        let held = tokens("old", Duration::from_secs(60), Some("r"));
        manager.synchronizer().propagate(held.clone()).await.unwrap();

        let error = manager.get_valid_token().await.unwrap_err();

        assert_eq!(error.category(), Some(ErrorCategory::Network));
        assert!(!error.needs_reauth());
        assert_eq!(refresher.call_count(), 3);
        assert_eq!(slot.get(), Some(held.clone()));
        assert_eq!(manager.synchronizer().store().current(), Some(held));
    }

    #[tokio::test]
    async fn test_open_circuit_keeps_tokens() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        breaker.record_failure();
        let invoker = ResilientInvoker::new(
            RetryPolicy::default(),
            ClassifierConfig::default(),
            Arc::new(RetryMetrics::new()),
        )
        .with_circuit_breaker(breaker);
        let refresher = Arc::new(MockTokenRefresher::new());
        let (manager, slot) = manager_with(refresher.clone(), invoker);
        let held = tokens("old", Duration::from_secs(60), Some("r"));
        manager.synchronizer().propagate(held.clone()).await.unwrap();

        let result = manager.force_refresh().await;

        assert!(matches!(result, Err(ApiError::CircuitOpen)));
        assert_eq!(refresher.call_count(), 0);
        assert_eq!(slot.get(), Some(held));
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let refresher = Arc::new(MockTokenRefresher::new());
        let (manager, _) = manager(refresher.clone());
        manager
            .synchronizer()
            .propagate(tokens("old", Duration::from_secs(3600), Some("r")))
            .await
            .unwrap();

        let first = manager.refresh_rejected("old").await.unwrap();
        let second = manager.refresh_rejected("old").await.unwrap();

        assert_eq!(first.access_token, "refreshed-access-token-1");
        assert_eq!(second, first);
        assert_eq!(refresher.call_count(), 1);

        // a rejection of the current token refreshes again
        let third = manager.refresh_rejected(&first.access_token).await.unwrap();
        assert_eq!(third.access_token, "refreshed-access-token-2");
    }

    #[tokio::test]
    async fn test_no_refresh_token_clears_store() {
        let refresher = Arc::new(MockTokenRefresher::new());
        let (manager, slot) = manager(refresher.clone());
        manager
            .synchronizer()
            .propagate(tokens("old", Duration::from_secs(60), None))
            .await
            .unwrap();

        assert!(manager.get_valid_token().await.is_err());
        assert_eq!(refresher.call_count(), 0);
        assert_eq!(slot.get(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_are_single_flight() {
        let refresher = Arc::new(MockTokenRefresher::new());
        refresher.set_delay(Duration::from_millis(100));
        let (manager, _) = manager(refresher.clone());
        manager
            .synchronizer()
            .propagate(tokens("old", Duration::from_secs(60), Some("r")))
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            manager.get_valid_token(),
            manager.get_valid_token(),
            manager.get_valid_token()
        );

        assert_eq!(refresher.call_count(), 1);
        assert_eq!(a.unwrap(), "refreshed-access-token-1");
        assert_eq!(b.unwrap(), "refreshed-access-token-1");
        assert_eq!(c.unwrap(), "refreshed-access-token-1");
    }

    #[tokio::test]
    async fn test_state_mismatch_clears_tokens() {
        let (manager, slot) = manager(Arc::new(MockTokenRefresher::new()));
        manager
            .synchronizer()
            .propagate(tokens("existing", Duration::from_secs(3600), Some("r")))
            .await
            .unwrap();

        let result = manager
            .complete_authorization("expected", "forged", || async {
                Ok(tokens("attacker", Duration::from_secs(3600), None))
            })
            .await;

        assert!(matches!(
            result,
            Err(ApiError::Token(TokenError::StateMismatch { .. }))
        ));
        assert_eq!(slot.get(), None);
    }

    #[tokio::test]
    async fn test_complete_authorization_propagates() {
        let (manager, slot) = manager(Arc::new(MockTokenRefresher::new()));
        let issued = tokens("issued", Duration::from_secs(7200), Some("r"));

        let expected = issued.clone();
        let result = manager
            .complete_authorization("s1", "s1", move || async move { Ok(expected) })
            .await
            .unwrap();

        assert_eq!(result, issued);
        assert_eq!(slot.get(), Some(issued));
    }

    #[tokio::test]
    async fn test_logout() {
        let (manager, slot) = manager(Arc::new(MockTokenRefresher::new()));
        manager
            .synchronizer()
            .propagate(tokens("t", Duration::from_secs(3600), Some("r")))
            .await
            .unwrap();
        manager.logout().await;
        assert_eq!(slot.get(), None);
    }

    #[tokio::test]
    async fn test_http_refresher_request() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            &serde_json::json!({
                "access_token": "v^1.1#new",
                "expires_in": 7200,
                "token_type": "User Access Token"
            }),
        );
        let config = RefreshConfig {
            client_id: "app-id".to_string(),
            client_secret: Some(SecretString::new("cert-id".to_string())),
            scopes: vec!["https://api.ebay.com/oauth/api_scope".to_string()],
            ..RefreshConfig::default()
        };
        let refresher = HttpTokenRefresher::new(transport.clone(), config, Duration::from_secs(5));

        let response = refresher.refresh("refresh/with+chars").await.unwrap();
        assert_eq!(response.access_token, "v^1.1#new");

        let request = transport.get_last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        let body = request.body.unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=refresh%2Fwith%2Bchars"));
        let expected = base64::engine::general_purpose::STANDARD.encode("app-id:cert-id");
        assert_eq!(
            request.headers.get("authorization"),
            Some(&format!("Basic {}", expected))
        );
    }

    #[tokio::test]
    async fn test_http_refresher_error_status() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(401, &serde_json::json!({"error": "invalid_client"}));
        let refresher =
            HttpTokenRefresher::new(transport, RefreshConfig::default(), Duration::from_secs(5));

        match refresher.refresh("r").await {
            Err(ApiError::Request(error)) => assert_eq!(error.status(), Some(401)),
            other => panic!("unexpected: {:?}", other.map(|r| r.access_token)),
        }
    }
}
