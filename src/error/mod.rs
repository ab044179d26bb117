//! Error Types
//!
//! Error taxonomy for the resilient client: raw attempt failures, the classifier's
//! verdict, and the operational errors raised by the token engine.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Auth,
    ServerError,
    BusinessLogic,
    Network,
    Unknown,
}

/// Recovery strategy tag attached to every category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Wait for the server supplied `Retry-After`, else back off steeply.
    HonorRetryAfter,
    /// Refresh the access token once, then retry.
    RefreshToken,
    /// Steep exponential backoff; the circuit breaker is notified.
    SteepBackoff,
    /// Exponential backoff with extra random jitter.
    JitteredBackoff,
    /// Surface immediately.
    None,
}

impl ErrorCategory {
    /// All categories, in classifier pattern order.
    pub const PATTERN_ORDER: [ErrorCategory; 5] = [
        Self::RateLimit,
        Self::Auth,
        Self::ServerError,
        Self::BusinessLogic,
        Self::Network,
    ];

    /// Whether a failure without an HTTP status may be retried.
    ///
    /// Responses with a status are governed by the configured status set instead.
    pub fn is_retry_eligible(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Auth | Self::ServerError | Self::Network
        )
    }

    /// Recovery side effect applied before the next attempt.
    pub fn recovery_strategy(self) -> RecoveryStrategy {
        match self {
            Self::RateLimit => RecoveryStrategy::HonorRetryAfter,
            Self::Auth => RecoveryStrategy::RefreshToken,
            Self::ServerError => RecoveryStrategy::SteepBackoff,
            Self::Network => RecoveryStrategy::JitteredBackoff,
            Self::BusinessLogic | Self::Unknown => RecoveryStrategy::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::ServerError => "server_error",
            Self::BusinessLogic => "business_logic",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    Dns,
    Tls,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionReset => "connection reset",
            Self::ConnectionRefused => "connection refused",
            Self::Timeout => "timeout",
            Self::Dns => "dns failure",
            Self::Tls => "tls",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Failure of a single attempt, before classification.
#[derive(Error, Debug, Clone)]
pub enum RequestError {
    #[error("HTTP {status} response")]
    Http {
        status: u16,
        /// Response headers, keys lowercased.
        headers: HashMap<String, String>,
        body: String,
    },

    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl RequestError {
    /// HTTP error response without headers.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Transport failure.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Application failure described only by its message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// HTTP status, if the failure was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response header lookup (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            Self::Http { headers, .. } => headers
                .get(&name.to_ascii_lowercase())
                .map(String::as_str),
            _ => None,
        }
    }
}

/// Classifier verdict for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub http_status: Option<u16>,
    /// Provider error code, `UNKNOWN_ERROR` when none was found.
    pub code: String,
    pub message: String,
    /// Server supplied `Retry-After`.
    pub retry_after: Option<Duration>,
    /// Attempts made before this error was surfaced.
    pub attempts: u32,
}

impl ClassifiedError {
    /// Key used by the per-code error counter: `<status>_<code>`.
    pub fn error_key(&self) -> String {
        match self.http_status {
            Some(status) => format!("{}_{}", status, self.code),
            None => format!("none_{}", self.code),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error", self.category)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {})", status)?;
        }
        write!(
            f,
            " [{}] after {} attempt(s): {}",
            self.code, self.attempts, self.message
        )
    }
}

impl std::error::Error for ClassifiedError {}

/// Root error type.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Request failed: {0}")]
    Request(#[from] RequestError),

    #[error("{0}")]
    Failed(ClassifiedError),

    #[error("Not authenticated: {reason}")]
    Unauthenticated { reason: String },

    #[error("Token detection timed out after {elapsed:?} ({methods} methods polled)")]
    DetectionTimeout { elapsed: Duration, methods: usize },

    #[error("Operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("Deadline of {deadline:?} exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { deadline: Duration, attempts: u32 },

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

impl ApiError {
    /// Unauthenticated error with a reason.
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::Unauthenticated {
            reason: reason.into(),
        }
    }

    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "API_CONFIG",
            Self::Token(_) => "API_TOKEN",
            Self::Storage(_) => "API_STORAGE",
            Self::Request(_) => "API_REQUEST",
            Self::Failed(_) => "API_FAILED",
            Self::Unauthenticated { .. } => "API_UNAUTHENTICATED",
            Self::DetectionTimeout { .. } => "API_DETECTION_TIMEOUT",
            Self::Cancelled { .. } => "API_CANCELLED",
            Self::DeadlineExceeded { .. } => "API_DEADLINE",
            Self::CircuitOpen => "API_CIRCUIT_OPEN",
        }
    }

    /// Classified category, when the error went through the classifier.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Failed(e) => Some(e.category),
            _ => None,
        }
    }

    /// HTTP status of the final failed attempt.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Failed(e) => e.http_status,
            Self::Request(e) => e.status(),
            _ => None,
        }
    }

    /// Attempts made before the error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed(e) => e.attempts,
            Self::Cancelled { attempts } | Self::DeadlineExceeded { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Check if error requires re-authentication.
    pub fn needs_reauth(&self) -> bool {
        match self {
            Self::Unauthenticated { .. } => true,
            Self::DetectionTimeout { .. } => true,
            Self::Token(TokenError::StateMismatch { .. }) => true,
            Self::Token(TokenError::NoRefreshToken) => true,
            Self::Failed(e) => e.category == ErrorCategory::Auth,
            _ => false,
        }
    }

    /// What the user should be asked to do.
    pub fn user_action(&self) -> UserAction {
        if self.needs_reauth() {
            return UserAction::Reconnect;
        }
        match self {
            Self::Failed(e) => match e.category {
                ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::ServerError => {
                    UserAction::RetryLater
                }
                ErrorCategory::BusinessLogic => UserAction::FixRequest,
                ErrorCategory::Auth => UserAction::Reconnect,
                ErrorCategory::Unknown => UserAction::ContactSupport,
            },
            Self::Cancelled { .. } | Self::DeadlineExceeded { .. } | Self::CircuitOpen => {
                UserAction::RetryLater
            }
            Self::Request(_) => UserAction::RetryLater,
            _ => UserAction::ContactSupport,
        }
    }
}

/// Coarse action a UI layer should offer for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Transient; try again later.
    RetryLater,
    /// The eBay connection must be re-established.
    Reconnect,
    /// The request itself is invalid.
    FixRequest,
    ContactSupport,
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },
}

/// Token-related error.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Invalid token set: {message}")]
    Invalid { message: String },

    #[error("Token expired")]
    Expired,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Token refresh failed: {message}")]
    RefreshFailed { message: String },

    #[error("State parameter mismatch (possible CSRF attack)")]
    StateMismatch { expected: String, received: String },
}

/// Backend storage error.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read from {backend} failed: {message}")]
    ReadFailed { backend: String, message: String },

    #[error("Write to {backend} failed: {message}")]
    WriteFailed { backend: String, message: String },

    #[error("Delete from {backend} failed: {message}")]
    DeleteFailed { backend: String, message: String },

    #[error("Corrupted data in {backend}: {message}")]
    CorruptedData { backend: String, message: String },
}

/// Result type for client operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Get user-friendly error message.
pub fn get_user_message(error: &ApiError) -> String {
    match error.user_action() {
        UserAction::Reconnect => {
            "Your eBay connection has expired. Please reconnect your account.".to_string()
        }
        UserAction::RetryLater => match error.category() {
            Some(ErrorCategory::RateLimit) => {
                "eBay is limiting requests right now. Please wait a moment and try again."
                    .to_string()
            }
            Some(ErrorCategory::Network) => {
                "The request could not reach eBay. Please check your connection and try again."
                    .to_string()
            }
            _ => "eBay is temporarily unavailable. Please try again later.".to_string(),
        },
        UserAction::FixRequest => match error {
            ApiError::Failed(e) => format!("eBay rejected the request: {}", e.message),
            _ => "eBay rejected the request.".to_string(),
        },
        UserAction::ContactSupport => "An unexpected error occurred. Please try again.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(category: ErrorCategory, status: Option<u16>) -> ClassifiedError {
        ClassifiedError {
            category,
            retryable: category.is_retry_eligible(),
            http_status: status,
            code: "UNKNOWN_ERROR".to_string(),
            message: "boom".to_string(),
            retry_after: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_category_eligibility() {
        assert!(ErrorCategory::RateLimit.is_retry_eligible());
        assert!(ErrorCategory::ServerError.is_retry_eligible());
        assert!(ErrorCategory::Network.is_retry_eligible());
        assert!(ErrorCategory::Auth.is_retry_eligible());
        assert!(!ErrorCategory::BusinessLogic.is_retry_eligible());
        assert!(!ErrorCategory::Unknown.is_retry_eligible());
        assert_eq!(
            ErrorCategory::Auth.recovery_strategy(),
            RecoveryStrategy::RefreshToken
        );
    }

    #[test]
    fn test_error_key() {
        assert_eq!(
            classified(ErrorCategory::ServerError, Some(503)).error_key(),
            "503_UNKNOWN_ERROR"
        );
        assert_eq!(
            classified(ErrorCategory::Network, None).error_key(),
            "none_UNKNOWN_ERROR"
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "7".to_string());
        let error = RequestError::Http {
            status: 429,
            headers,
            body: String::new(),
        };
        assert_eq!(error.header("Retry-After"), Some("7"));
        assert_eq!(error.status(), Some(429));
    }

    #[test]
    fn test_user_action() {
        let rate = ApiError::Failed(classified(ErrorCategory::RateLimit, Some(429)));
        assert_eq!(rate.user_action(), UserAction::RetryLater);

        let invalid = ApiError::Failed(classified(ErrorCategory::BusinessLogic, Some(400)));
        assert_eq!(invalid.user_action(), UserAction::FixRequest);

        let unauth = ApiError::unauthenticated("refresh failed");
        assert_eq!(unauth.user_action(), UserAction::Reconnect);
        assert!(get_user_message(&unauth).contains("reconnect"));
    }
}
