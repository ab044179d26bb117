//! Backoff
//!
//! Exponential backoff with proportional jitter.

use std::time::Duration;

use crate::types::RetryPolicy;

/// Delay before retry number `attempt` (1-based; attempt 1 precedes the second call).
///
/// `min(base * factor^(attempt-1), max)` plus up to `jitter_fraction` of that delay.
/// `attempt` values below 1 are treated as 1.
pub fn next_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    factor: f64,
    jitter_fraction: f64,
) -> Duration {
    next_delay_with_sample(
        attempt,
        base,
        max,
        factor,
        jitter_fraction,
        rand::random::<f64>(),
    )
}

/// [`next_delay`] with the uniform `[0, 1)` sample supplied by the caller.
pub fn next_delay_with_sample(
    attempt: u32,
    base: Duration,
    max: Duration,
    factor: f64,
    jitter_fraction: f64,
    sample: f64,
) -> Duration {
    let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
    let max_ms = max.as_secs_f64() * 1000.0;
    let raw_ms = base.as_secs_f64() * 1000.0 * factor.powi(exponent);
    let delay_ms = if raw_ms.is_finite() {
        raw_ms.min(max_ms)
    } else {
        max_ms
    };
    let jitter_ms = delay_ms * jitter_fraction.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);

    Duration::from_nanos(((delay_ms + jitter_ms).max(0.0) * 1_000_000.0).round() as u64)
}

impl RetryPolicy {
    /// Delay before retry `attempt` using the policy's general-purpose factor.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with_factor(attempt, self.backoff_factor)
    }

    /// Delay before retry `attempt` with a category-specific factor.
    pub fn next_delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        next_delay(
            attempt,
            self.base_delay,
            self.max_delay,
            factor,
            self.jitter_factor,
        )
    }
}
