//! Telemetry
//!
//! Observability for the client.
//!
//! - **Metrics**: retry and error counters with derived rates
//! - **Logging**: `tracing` subscriber setup

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
pub use metrics::{MetricsSnapshot, RetryMetrics};
