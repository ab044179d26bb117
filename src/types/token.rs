//! Token Types
//!
//! OAuth token set held by the token store and the refresh endpoint's response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::TokenError;

/// Lifetime assumed when the provider omits `expires_in` (eBay user tokens live two hours).
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(7200);

/// Token response from the OAuth token endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer" or eBay's "User Access Token").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expires in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes, space separated.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// The canonical OAuth token set.
///
/// A set whose access token is empty is treated as absent, never as a valid value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl TokenSet {
    /// Create a validated token set issued now.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        lifetime: Duration,
    ) -> Result<Self, TokenError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + to_chrono(lifetime);
        let tokens = Self {
            access_token: access_token.into(),
            refresh_token,
            issued_at,
            expires_at,
            token_type: default_token_type(),
            scopes: BTreeSet::new(),
        };
        tokens.validate()?;
        Ok(tokens)
    }

    /// Build a token set from an endpoint response received at `issued_at`.
    pub fn from_response(
        response: &TokenResponse,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, TokenError> {
        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        let scopes = response
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        let tokens = Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            issued_at,
            expires_at: issued_at + to_chrono(lifetime),
            token_type: response.token_type.clone(),
            scopes,
        };
        tokens.validate()?;
        Ok(tokens)
    }

    /// Replace scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Check the set's invariants.
    pub fn validate(&self) -> Result<(), TokenError> {
        if self.access_token.trim().is_empty() {
            return Err(TokenError::Invalid {
                message: "access token is empty".to_string(),
            });
        }
        if self.expires_at <= self.issued_at {
            return Err(TokenError::Invalid {
                message: "expires_at must be after issued_at".to_string(),
            });
        }
        Ok(())
    }

    /// Check if token is expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// `expires_at - now <= margin`.
    pub fn is_expiring_soon(&self, margin: Duration) -> bool {
        self.expires_at - Utc::now() <= to_chrono(margin)
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining_lifetime(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or_default()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    /// Format as Authorization header value.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Serialize for a storage backend.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a backend value. A set without an access token decodes as absent.
    pub fn decode(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let tokens: TokenSet = serde_json::from_str(raw)?;
        if tokens.validate().is_err() {
            return Ok(None);
        }
        Ok(Some(tokens))
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .finish()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{
            "access_token": "v^1.1#i^1",
            "token_type": "User Access Token",
            "expires_in": 7200,
            "refresh_token": "v^1.1#r^1",
            "scope": "https://api.ebay.com/oauth/api_scope https://api.ebay.com/oauth/api_scope/sell.inventory"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.expires_in, Some(7200));

        let tokens = TokenSet::from_response(&response, Utc::now()).unwrap();
        assert_eq!(tokens.scopes.len(), 2);
        assert!(tokens.has_refresh_token());
        assert!(!tokens.is_expiring_soon(Duration::from_secs(300)));
    }

    #[test]
    fn test_empty_access_token_is_rejected() {
        let result = TokenSet::new("", None, Duration::from_secs(60));
        assert!(matches!(result, Err(TokenError::Invalid { .. })));
    }

    #[test]
    fn test_expiring_soon() {
        let tokens = TokenSet::new("abc", None, Duration::from_secs(30)).unwrap();
        assert!(tokens.is_expiring_soon(Duration::from_secs(60)));
        assert!(!tokens.is_expiring_soon(Duration::from_secs(10)));
        assert!(!tokens.is_expired());
    }

    #[test]
    fn test_encode_decode() {
        let tokens = TokenSet::new("abc", Some("r".to_string()), Duration::from_secs(3600))
            .unwrap()
            .with_scopes(["sell.inventory"]);
        let raw = tokens.encode().unwrap();
        assert_eq!(TokenSet::decode(&raw).unwrap(), Some(tokens));
    }

    #[test]
    fn test_decode_treats_blank_token_as_absent() {
        let now = Utc::now();
        let raw = serde_json::json!({
            "access_token": "",
            "issued_at": now,
            "expires_at": now + chrono::Duration::seconds(60),
            "token_type": "Bearer"
        })
        .to_string();
        assert_eq!(TokenSet::decode(&raw).unwrap(), None);
        assert_eq!(TokenSet::decode("").unwrap(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let tokens = TokenSet::new("super-secret", None, Duration::from_secs(60)).unwrap();
        let debug = format!("{:?}", tokens);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
