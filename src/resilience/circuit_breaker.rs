//! Circuit Breaker
//!
//! Circuit breaker fed by server-error retries, protecting eBay from retry storms.

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::types::CircuitBreakerConfig;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, limited requests allowed.
    HalfOpen,
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub state_transitions: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    stats: CircuitBreakerStats,
}

/// Circuit breaker shared by every invocation of a client.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                stats: CircuitBreakerStats::default(),
            }),
        }
    }

    /// Admit an attempt, or fail fast while the circuit is open.
    pub fn try_acquire(&self) -> ApiResult<()> {
        let mut inner = self.inner.lock();
        self.refresh_state(&mut inner);
        if inner.state == CircuitState::Open {
            inner.stats.rejected_requests += 1;
            return Err(ApiError::CircuitOpen);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.successful_requests += 1;

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.stats.state_transitions += 1;
                    info!("Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a server error.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.stats.failed_requests += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.stats.state_transitions += 1;
                    warn!(
                        failures = inner.failure_count,
                        "Circuit breaker opened after repeated server errors"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.opened_at = Some(Instant::now());
                inner.stats.state_transitions += 1;
                warn!("Circuit breaker re-opened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh_state(&mut inner);
        inner.state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.inner.lock().stats.clone()
    }

    fn refresh_state(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= self.config.open_duration {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.stats.state_transitions += 1;
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_duration: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_circuit_state() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_and_recovers() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(ApiError::CircuitOpen)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().rejected_requests, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
