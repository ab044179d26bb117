//! Resilience
//!
//! Resilience patterns for robust eBay API calls.
//!
//! This module provides:
//!
//! - **Backoff**: Exponential backoff with proportional jitter
//! - **Classifier**: Error category and retryability verdicts
//! - **Invoker**: Classification-driven retry with per-category recovery
//! - **Circuit Breaker**: Protection against server-error retry storms

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod invoker;

pub use backoff::{next_delay, next_delay_with_sample};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use classifier::{parse_retry_after, ErrorClassifier, UNKNOWN_ERROR_CODE};
pub use invoker::{InvokeContext, RefreshCallback, ResilientInvoker, RetryableOperation};
