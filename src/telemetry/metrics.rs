//! Metrics
//!
//! Retry and error counters shared by the classifier and the invoker.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic retry counters plus a per-error-key breakdown.
///
/// Counters only move forward; [`RetryMetrics::reset`] is the single way back to zero.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    retried_requests: AtomicU64,
    failed_retries: AtomicU64,
    errors_by_code: Mutex<BTreeMap<String, u64>>,
    // successful_retries and the running average move together
    successes: Mutex<SuccessfulRetries>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SuccessfulRetries {
    count: u64,
    average_retry_count: f64,
}

/// Point-in-time view of [`RetryMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub retried_requests: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub errors_by_code: BTreeMap<String, u64>,
    pub average_retry_count: f64,
    /// Failed attempts per request, as a percent. Exceeds 100 when requests
    /// fail on more than one attempt.
    pub error_rate: f64,
    pub retry_rate: f64,
    pub retry_success_rate: f64,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A logical request started (counted once regardless of attempts).
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed attempt was classified under `error_key`.
    pub fn record_error(&self, error_key: &str) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        *self
            .errors_by_code
            .lock()
            .entry(error_key.to_string())
            .or_insert(0) += 1;
    }

    /// A retry was scheduled.
    pub fn record_retry(&self) {
        self.retried_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request succeeded after `retry_count` retries.
    pub fn record_successful_retry(&self, retry_count: u32) {
        let mut successes = self.successes.lock();
        successes.count += 1;
        let n = successes.count as f64;
        successes.average_retry_count =
            (successes.average_retry_count * (n - 1.0) + retry_count as f64) / n;
    }

    /// A request that had been retried still failed.
    pub fn record_failed_retry(&self) {
        self.failed_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let retried_requests = self.retried_requests.load(Ordering::Relaxed);
        let failed_retries = self.failed_retries.load(Ordering::Relaxed);
        let successes = *self.successes.lock();

        MetricsSnapshot {
            total_requests,
            total_errors,
            retried_requests,
            successful_retries: successes.count,
            failed_retries,
            errors_by_code: self.errors_by_code.lock().clone(),
            average_retry_count: successes.average_retry_count,
            error_rate: percent(total_errors, total_requests),
            retry_rate: percent(retried_requests, total_requests),
            retry_success_rate: percent(successes.count, successes.count + failed_retries),
        }
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.retried_requests.store(0, Ordering::Relaxed);
        self.failed_retries.store(0, Ordering::Relaxed);
        self.errors_by_code.lock().clear();
        *self.successes.lock() = SuccessfulRetries::default();
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average_retry_count() {
        let metrics = RetryMetrics::new();
        metrics.record_successful_retry(1);
        metrics.record_successful_retry(3);
        metrics.record_successful_retry(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.successful_retries, 3);
        assert!((snapshot.average_retry_count - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rates() {
        let metrics = RetryMetrics::new();
        for _ in 0..4 {
            metrics.record_request();
        }
        metrics.record_error("503_UNKNOWN_ERROR");
        metrics.record_error("503_UNKNOWN_ERROR");
        metrics.record_retry();
        metrics.record_successful_retry(1);
        metrics.record_failed_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors_by_code.get("503_UNKNOWN_ERROR"), Some(&2));
        assert_eq!(snapshot.error_rate, 50.0);
        assert_eq!(snapshot.retry_rate, 25.0);
        assert_eq!(snapshot.retry_success_rate, 50.0);
    }

    #[test]
    fn test_error_rate_counts_every_failed_attempt() {
        let metrics = RetryMetrics::new();
        metrics.record_request();
        for _ in 0..3 {
            metrics.record_error("503_UNKNOWN_ERROR");
        }

        assert_eq!(metrics.snapshot().error_rate, 300.0);
    }

    #[test]
    fn test_reset_and_empty_rates() {
        let metrics = RetryMetrics::new();
        metrics.record_request();
        metrics.record_error("none_UNKNOWN_ERROR");
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.errors_by_code.is_empty());
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.retry_success_rate, 0.0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(RetryMetrics::new().snapshot()).unwrap();
        assert!(json.get("retrySuccessRate").is_some());
        assert!(json.get("errorsByCode").is_some());
    }
}
