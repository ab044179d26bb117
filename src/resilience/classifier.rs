//! Error Classifier
//!
//! Turns a failed attempt into an [`ErrorCategory`] and a retryability verdict.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClassifiedError, ErrorCategory, RequestError, TransportErrorKind};
use crate::telemetry::RetryMetrics;
use crate::types::ClassifierConfig;

/// Code used when neither the response nor the transport supplies one.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "quota",
    "throttl",
    "request limit",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "invalid access token",
    "invalid token",
    "invalid_token",
    "token expired",
    "expired token",
    "invalid_grant",
    "invalid_client",
    "authentication",
    "not authorized",
    "access denied",
    "insufficient permissions",
];

const SERVER_ERROR_PATTERNS: &[&str] = &[
    "internal server error",
    "internal error",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "server error",
    "system error",
    "temporarily unavailable",
];

const BUSINESS_LOGIC_PATTERNS: &[&str] = &[
    "invalid",
    "validation",
    "not found",
    "duplicate",
    "already exists",
    "missing",
    "required",
    "not allowed",
    "bad request",
];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "socket",
    "fetch failed",
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "dns",
    "timed out",
    "timeout",
];

fn patterns_for(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::RateLimit => RATE_LIMIT_PATTERNS,
        ErrorCategory::Auth => AUTH_PATTERNS,
        ErrorCategory::ServerError => SERVER_ERROR_PATTERNS,
        ErrorCategory::BusinessLogic => BUSINESS_LOGIC_PATTERNS,
        ErrorCategory::Network => NETWORK_PATTERNS,
        ErrorCategory::Unknown => &[],
    }
}

/// Classifies attempt failures and counts them per `<status>_<code>` key.
pub struct ErrorClassifier {
    config: ClassifierConfig,
    metrics: Arc<RetryMetrics>,
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig, metrics: Arc<RetryMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify the failure of attempt number `attempts` (1-based).
    pub fn classify(&self, error: &RequestError, attempts: u32) -> ClassifiedError {
        let http_status = error.status();
        let provider = extract_provider_error(error);
        let code = provider
            .code
            .unwrap_or_else(|| UNKNOWN_ERROR_CODE.to_string());
        let message = provider
            .message
            .unwrap_or_else(|| default_message(error));

        let category = http_status
            .and_then(category_for_status)
            .or_else(|| match_patterns(&message, &code))
            .or_else(|| transport_marker(error))
            .unwrap_or(match http_status {
                Some(400..=499) => ErrorCategory::BusinessLogic,
                _ => ErrorCategory::Unknown,
            });

        // a response status is decided by the configured set alone; the
        // category only decides for failures that never got a response
        let retryable = self.config.retryable_error_codes.contains(&code)
            || match http_status {
                Some(status) => self.config.retryable_status_codes.contains(&status),
                None => category.is_retry_eligible(),
            };

        let retry_after = error.header("retry-after").and_then(parse_retry_after);

        let classified = ClassifiedError {
            category,
            retryable,
            http_status,
            code,
            message,
            retry_after,
            attempts,
        };
        self.metrics.record_error(&classified.error_key());
        classified
    }
}

fn category_for_status(status: u16) -> Option<ErrorCategory> {
    match status {
        429 => Some(ErrorCategory::RateLimit),
        401 | 403 => Some(ErrorCategory::Auth),
        408 => Some(ErrorCategory::Network),
        500..=599 => Some(ErrorCategory::ServerError),
        _ => None,
    }
}

fn match_patterns(message: &str, code: &str) -> Option<ErrorCategory> {
    let haystack = format!("{} {}", message, code).to_lowercase();
    ErrorCategory::PATTERN_ORDER
        .into_iter()
        .find(|category| {
            patterns_for(*category)
                .iter()
                .any(|pattern| haystack.contains(pattern))
        })
}

fn transport_marker(error: &RequestError) -> Option<ErrorCategory> {
    match error {
        RequestError::Transport { kind, .. } => match kind {
            TransportErrorKind::ConnectionReset
            | TransportErrorKind::ConnectionRefused
            | TransportErrorKind::Timeout
            | TransportErrorKind::Dns => Some(ErrorCategory::Network),
            TransportErrorKind::Tls | TransportErrorKind::Other => None,
        },
        _ => None,
    }
}

#[derive(Default)]
struct ProviderError {
    code: Option<String>,
    message: Option<String>,
}

/// Pull `code`/`message` out of eBay's `errors[]` envelope, an OAuth error body,
/// or a transport failure.
fn extract_provider_error(error: &RequestError) -> ProviderError {
    match error {
        RequestError::Http { body, .. } => serde_json::from_str::<Value>(body)
            .map(|json| provider_error_from_json(&json))
            .unwrap_or_default(),
        RequestError::Transport { kind, message } => ProviderError {
            code: transport_code(*kind).map(String::from),
            message: Some(message.clone()),
        },
        RequestError::Protocol { message } => ProviderError {
            code: Some("PROTOCOL_ERROR".to_string()),
            message: Some(message.clone()),
        },
        RequestError::Other { message } => ProviderError {
            code: None,
            message: Some(message.clone()),
        },
    }
}

fn provider_error_from_json(json: &Value) -> ProviderError {
    if let Some(first) = json
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
    {
        return ProviderError {
            code: first.get("errorId").and_then(value_to_string),
            message: first
                .get("message")
                .or_else(|| first.get("longMessage"))
                .and_then(value_to_string),
        };
    }

    if let Some(code) = json.get("error").and_then(Value::as_str) {
        return ProviderError {
            code: Some(code.to_string()),
            message: json
                .get("error_description")
                .and_then(value_to_string)
                .or_else(|| Some(code.to_string())),
        };
    }

    ProviderError {
        code: json.get("code").and_then(value_to_string),
        message: json.get("message").and_then(value_to_string),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn transport_code(kind: TransportErrorKind) -> Option<&'static str> {
    match kind {
        TransportErrorKind::ConnectionReset => Some("ECONNRESET"),
        TransportErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        TransportErrorKind::Timeout => Some("ETIMEDOUT"),
        TransportErrorKind::Dns => Some("ENOTFOUND"),
        TransportErrorKind::Tls | TransportErrorKind::Other => None,
    }
}

fn default_message(error: &RequestError) -> String {
    match error {
        RequestError::Http { status, .. } => {
            let reason = match status {
                400 => "Bad Request",
                401 => "Unauthorized",
                403 => "Forbidden",
                404 => "Not Found",
                408 => "Request Timeout",
                409 => "Conflict",
                429 => "Too Many Requests",
                500 => "Internal Server Error",
                502 => "Bad Gateway",
                503 => "Service Unavailable",
                504 => "Gateway Timeout",
                _ => "Unexpected Status",
            };
            format!("HTTP {} {}", status, reason)
        }
        other => other.to_string(),
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    DateTime::parse_from_rfc2822(raw).ok().map(|at| {
        (at.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn classifier() -> (ErrorClassifier, Arc<RetryMetrics>) {
        let metrics = Arc::new(RetryMetrics::new());
        (
            ErrorClassifier::new(ClassifierConfig::default(), metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn test_retryable_statuses() {
        let (classifier, _) = classifier();
        for status in [429, 500, 502, 503, 504] {
            let verdict = classifier.classify(&RequestError::http(status, ""), 1);
            assert!(verdict.retryable, "status {} should be retryable", status);
        }
    }

    #[test]
    fn test_status_outside_configured_set_is_not_retried() {
        let (classifier, _) = classifier();
        for status in [501, 505, 401, 403, 408] {
            let verdict = classifier.classify(&RequestError::http(status, ""), 1);
            assert!(!verdict.retryable, "status {} should not be retryable", status);
        }
        assert_eq!(
            classifier.classify(&RequestError::http(501, ""), 1).category,
            ErrorCategory::ServerError
        );
    }

    #[test]
    fn test_custom_retryable_status_set() {
        let config = ClassifierConfig {
            retryable_status_codes: [429].into_iter().collect(),
            ..ClassifierConfig::default()
        };
        let classifier = ErrorClassifier::new(config, Arc::new(RetryMetrics::new()));

        let unavailable = classifier.classify(&RequestError::http(503, ""), 1);
        assert_eq!(unavailable.category, ErrorCategory::ServerError);
        assert!(!unavailable.retryable);
        assert!(classifier.classify(&RequestError::http(429, ""), 1).retryable);
    }

    #[test]
    fn test_status_categories() {
        let (classifier, _) = classifier();
        let cases = [
            (429, ErrorCategory::RateLimit),
            (401, ErrorCategory::Auth),
            (503, ErrorCategory::ServerError),
            (404, ErrorCategory::BusinessLogic),
        ];
        for (status, category) in cases {
            assert_eq!(
                classifier.classify(&RequestError::http(status, ""), 1).category,
                category
            );
        }
    }

    #[test]
    fn test_ebay_error_envelope() {
        let (classifier, metrics) = classifier();
        let body = r#"{"errors":[{"errorId":25002,"domain":"API_INVENTORY","category":"REQUEST","message":"A user error has occurred. Invalid SKU."}]}"#;

        let verdict = classifier.classify(&RequestError::http(400, body), 1);
        assert_eq!(verdict.code, "25002");
        assert_eq!(verdict.category, ErrorCategory::BusinessLogic);
        assert!(!verdict.retryable);
        assert_eq!(
            metrics.snapshot().errors_by_code.get("400_25002"),
            Some(&1)
        );
    }

    #[test]
    fn test_retryable_error_code_without_retryable_status() {
        let (classifier, _) = classifier();
        let body = r#"{"errors":[{"errorId":10001,"message":"Bad request sent"}]}"#;
        let verdict = classifier.classify(&RequestError::http(400, body), 1);
        assert!(verdict.retryable);
    }

    #[test]
    fn test_oauth_error_body() {
        let (classifier, _) = classifier();
        let body = r#"{"error":"invalid_grant","error_description":"the refresh token is invalid"}"#;
        let verdict = classifier.classify(&RequestError::http(400, body), 1);
        assert_eq!(verdict.code, "invalid_grant");
        assert_eq!(verdict.category, ErrorCategory::Auth);
    }

    #[test]
    fn test_message_patterns_without_status() {
        let (classifier, _) = classifier();
        let rate = classifier.classify(&RequestError::other("Rate limit exceeded for call"), 1);
        assert_eq!(rate.category, ErrorCategory::RateLimit);
        assert!(rate.retryable);

        let invalid = classifier.classify(&RequestError::other("Listing validation failed"), 1);
        assert_eq!(invalid.category, ErrorCategory::BusinessLogic);
        assert!(!invalid.retryable);
    }

    #[test]
    fn test_transport_markers() {
        let (classifier, _) = classifier();
        let verdict = classifier.classify(
            &RequestError::transport(TransportErrorKind::ConnectionReset, "peer went away"),
            2,
        );
        assert_eq!(verdict.category, ErrorCategory::Network);
        assert_eq!(verdict.code, "ECONNRESET");
        assert!(verdict.retryable);
        assert_eq!(verdict.attempts, 2);
        assert_eq!(verdict.error_key(), "none_ECONNRESET");
    }

    #[test]
    fn test_unknown_default() {
        let (classifier, metrics) = classifier();
        let verdict = classifier.classify(&RequestError::other("something odd"), 1);
        assert_eq!(verdict.category, ErrorCategory::Unknown);
        assert!(!verdict.retryable);
        assert_eq!(verdict.code, UNKNOWN_ERROR_CODE);
        assert_eq!(metrics.snapshot().total_errors, 1);
    }

    #[test]
    fn test_retry_after_header() {
        let (classifier, _) = classifier();
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "12".to_string());
        let error = RequestError::Http {
            status: 429,
            headers,
            body: String::new(),
        };
        assert_eq!(
            classifier.classify(&error, 1).retry_after,
            Some(Duration::from_secs(12))
        );
    }

    #[test]
    fn test_parse_retry_after_date_in_past() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
