//! Resilient Invoker
//!
//! Runs a caller-supplied async operation with classification-driven retries.
//!
//! Attempts for one invocation are strictly sequential. Each failure is
//! classified once; the verdict decides whether to stop, refresh the token,
//! or sleep before the next attempt.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::circuit_breaker::CircuitBreaker;
use super::classifier::ErrorClassifier;
use crate::error::{ApiError, ApiResult, ClassifiedError, ErrorCategory};
use crate::telemetry::RetryMetrics;
use crate::types::{ClassifierConfig, RetryPolicy};

/// Caller-supplied token refresh used on `Auth` failures.
pub type RefreshCallback = Arc<dyn Fn() -> BoxFuture<'static, ApiResult<()>> + Send + Sync>;

/// Per-invocation options.
#[derive(Clone, Default)]
pub struct InvokeContext {
    /// Name used in logs.
    pub operation: String,
    /// Overrides the invoker's default policy.
    pub policy: Option<RetryPolicy>,
    pub token_refresh: Option<RefreshCallback>,
    /// Overall budget for every attempt and sleep.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl InvokeContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_token_refresh(mut self, callback: RefreshCallback) -> Self {
        self.token_refresh = Some(callback);
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

impl std::fmt::Debug for InvokeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeContext")
            .field("operation", &self.operation)
            .field("policy", &self.policy)
            .field("token_refresh", &self.token_refresh.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// State of one logical call across its attempts.
#[derive(Debug, Clone)]
pub struct RetryableOperation {
    pub id: u64,
    /// Zero-based index of the current attempt.
    pub attempt: u32,
    pub started_at: Instant,
    pub category: Option<ErrorCategory>,
    pub last_error: Option<ClassifiedError>,
}

impl RetryableOperation {
    fn new(id: u64) -> Self {
        Self {
            id,
            attempt: 0,
            started_at: Instant::now(),
            category: None,
            last_error: None,
        }
    }

    /// Attempts started so far, including one in flight.
    fn attempts(&self) -> u32 {
        self.attempt + 1
    }
}

enum Interrupt {
    Deadline(Duration),
    Cancelled,
}

/// Executes operations with retry, backoff and per-category recovery.
pub struct ResilientInvoker {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    metrics: Arc<RetryMetrics>,
    breaker: Option<Arc<CircuitBreaker>>,
    next_id: AtomicU64,
}

impl ResilientInvoker {
    pub fn new(
        policy: RetryPolicy,
        classifier: ClassifierConfig,
        metrics: Arc<RetryMetrics>,
    ) -> Self {
        Self {
            policy,
            classifier: ErrorClassifier::new(classifier, metrics.clone()),
            metrics,
            breaker: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Notify `breaker` on server errors and fail fast while it is open.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<RetryMetrics> {
        &self.metrics
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// exhausts the policy.
    ///
    /// Only [`ApiError::Request`] failures are classified and retried; any
    /// other error from `op` is returned unchanged.
    #[instrument(skip_all, fields(operation = %ctx.operation))]
    pub async fn invoke<T, F, Fut>(&self, mut op: F, ctx: InvokeContext) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let policy = ctx.policy.clone().unwrap_or_else(|| self.policy.clone());
        let deadline_at = ctx.deadline.map(|d| Instant::now() + d);
        let cancel = ctx.cancel.as_ref();
        let mut operation = RetryableOperation::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut refreshed = false;

        self.metrics.record_request();

        loop {
            if let Some(breaker) = &self.breaker {
                if let Err(error) = breaker.try_acquire() {
                    self.record_terminal_failure(&operation);
                    return Err(error);
                }
            }

            let outcome = match guard(op(), deadline_at, ctx.deadline, cancel).await {
                Ok(outcome) => outcome,
                Err(interrupt) => return Err(self.interrupted(interrupt, &operation)),
            };

            let raw = match outcome {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    if operation.attempt > 0 {
                        self.metrics.record_successful_retry(operation.attempt);
                        info!(
                            id = operation.id,
                            retries = operation.attempt,
                            elapsed_ms = operation.started_at.elapsed().as_millis() as u64,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(ApiError::Request(raw)) => raw,
                Err(other) => {
                    self.record_terminal_failure(&operation);
                    return Err(other);
                }
            };

            let classified = self.classifier.classify(&raw, operation.attempts());
            operation.category = Some(classified.category);
            operation.last_error = Some(classified.clone());

            if classified.category == ErrorCategory::ServerError {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }
            }

            // Auth is never in the retryable status set but still gets its
            // one refresh cycle below
            let recoverable = classified.retryable || classified.category == ErrorCategory::Auth;
            if !recoverable || operation.attempt >= policy.max_retries {
                debug!(
                    id = operation.id,
                    category = %classified.category,
                    code = %classified.code,
                    retryable = classified.retryable,
                    "Operation failed"
                );
                self.record_terminal_failure(&operation);
                return Err(ApiError::Failed(classified));
            }

            let retry = operation.attempt + 1;
            let delay = match classified.category {
                ErrorCategory::Auth => {
                    let callback = match (&ctx.token_refresh, refreshed) {
                        (Some(callback), false) => callback.clone(),
                        _ => {
                            self.record_terminal_failure(&operation);
                            return Err(ApiError::Failed(classified));
                        }
                    };
                    refreshed = true;

                    match guard(callback(), deadline_at, ctx.deadline, cancel).await {
                        Ok(Ok(())) => Duration::ZERO,
                        Ok(Err(error)) => {
                            warn!(id = operation.id, error = %error, "Token refresh failed");
                            self.record_terminal_failure(&operation);
                            return Err(ApiError::unauthenticated(format!(
                                "token refresh failed: {}",
                                error
                            )));
                        }
                        Err(interrupt) => return Err(self.interrupted(interrupt, &operation)),
                    }
                }
                ErrorCategory::RateLimit => classified.retry_after.unwrap_or_else(|| {
                    policy.next_delay_with_factor(retry, policy.rate_limit_factor)
                }),
                ErrorCategory::ServerError => {
                    policy.next_delay_with_factor(retry, policy.server_error_factor)
                }
                ErrorCategory::Network => {
                    policy.next_delay(retry)
                        + policy.network_extra_jitter.mul_f64(rand::random::<f64>())
                }
                ErrorCategory::BusinessLogic | ErrorCategory::Unknown => policy.next_delay(retry),
            };

            self.metrics.record_retry();
            info!(
                id = operation.id,
                attempt = operation.attempts(),
                category = %classified.category,
                code = %classified.code,
                delay_ms = delay.as_millis() as u64,
                "Retrying operation"
            );

            if !delay.is_zero() {
                if let Err(interrupt) =
                    guard(tokio::time::sleep(delay), deadline_at, ctx.deadline, cancel).await
                {
                    return Err(self.interrupted(interrupt, &operation));
                }
            }
            operation.attempt += 1;
        }
    }

    fn record_terminal_failure(&self, operation: &RetryableOperation) {
        if operation.attempt > 0 {
            self.metrics.record_failed_retry();
        }
    }

    fn interrupted(&self, interrupt: Interrupt, operation: &RetryableOperation) -> ApiError {
        self.record_terminal_failure(operation);
        match interrupt {
            Interrupt::Deadline(deadline) => {
                warn!(id = operation.id, ?deadline, "Operation deadline exceeded");
                ApiError::DeadlineExceeded {
                    deadline,
                    attempts: operation.attempts(),
                }
            }
            Interrupt::Cancelled => {
                debug!(id = operation.id, "Operation cancelled");
                ApiError::Cancelled {
                    attempts: operation.attempts(),
                }
            }
        }
    }
}

/// Race `fut` against the deadline and the cancellation token.
async fn guard<O>(
    fut: impl Future<Output = O>,
    deadline_at: Option<Instant>,
    deadline: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<O, Interrupt> {
    let expired = async {
        match deadline_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(Interrupt::Cancelled),
        _ = expired => Err(Interrupt::Deadline(deadline.unwrap_or_default())),
        out = fut => Ok(out),
    }
}
