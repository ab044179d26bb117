//! Token Store
//!
//! Single source of truth for the token set, fanned out to every backend.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{BackendKind, TokenBackend};
use crate::error::TokenError;
use crate::types::TokenSet;

/// Outcome of a best-effort fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Backends written, in write order.
    pub written: Vec<BackendKind>,
    pub failed: Vec<(BackendKind, String)>,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Canonical token set plus its backend copies.
///
/// Readers always see a whole [`TokenSet`]; writers are serialized so that
/// backend fan-outs never interleave.
pub struct TokenStore {
    canonical: RwLock<Option<TokenSet>>,
    backends: Vec<Arc<dyn TokenBackend>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl TokenStore {
    /// Backends are written in [`BackendKind`] order regardless of the order given.
    pub fn new(mut backends: Vec<Arc<dyn TokenBackend>>) -> Self {
        backends.sort_by_key(|backend| backend.kind());
        Self {
            canonical: RwLock::new(None),
            backends,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store without backends.
    pub fn in_memory() -> Self {
        Self::new(Vec::new())
    }

    pub fn backends(&self) -> &[Arc<dyn TokenBackend>] {
        &self.backends
    }

    /// Canonical value without consulting backends.
    pub fn current(&self) -> Option<TokenSet> {
        self.canonical.read().clone()
    }

    /// Canonical value, hydrated from the first backend holding one.
    pub async fn get(&self) -> Option<TokenSet> {
        if let Some(tokens) = self.current() {
            return Some(tokens);
        }

        for backend in &self.backends {
            match backend.load().await {
                Ok(Some(tokens)) => {
                    debug!(backend = %backend.kind(), "Hydrated token from backend");
                    let mut canonical = self.canonical.write();
                    // a concurrent set wins over hydration
                    if canonical.is_none() {
                        *canonical = Some(tokens);
                    }
                    return canonical.clone();
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(backend = %backend.kind(), error = %error, "Backend read failed")
                }
            }
        }
        None
    }

    /// Validate `tokens`, make them canonical, and write every backend.
    ///
    /// A failing backend is logged and skipped; the rest are still written.
    pub async fn set(&self, tokens: TokenSet) -> Result<WriteReport, TokenError> {
        tokens.validate()?;
        let _guard = self.write_lock.lock().await;

        *self.canonical.write() = Some(tokens.clone());

        let mut report = WriteReport::default();
        for backend in &self.backends {
            match backend.save(&tokens).await {
                Ok(()) => report.written.push(backend.kind()),
                Err(error) => {
                    warn!(backend = %backend.kind(), error = %error, "Backend write failed");
                    report.failed.push((backend.kind(), error.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Drop the canonical value and remove every backend copy, best-effort.
    pub async fn clear(&self) -> WriteReport {
        let _guard = self.write_lock.lock().await;
        *self.canonical.write() = None;

        let mut report = WriteReport::default();
        for backend in &self.backends {
            match backend.remove().await {
                Ok(()) => report.written.push(backend.kind()),
                Err(error) => {
                    warn!(backend = %backend.kind(), error = %error, "Backend clear failed");
                    report.failed.push((backend.kind(), error.to_string()));
                }
            }
        }
        report
    }

    /// `expires_at - now <= margin`. A missing token counts as expiring.
    pub async fn is_expiring_soon(&self, margin: Duration) -> bool {
        self.get()
            .await
            .map(|tokens| tokens.is_expiring_soon(margin))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::token::backend::{
        GlobalBackend, GlobalSlot, InMemoryKeyValueStore, KeyValueBackend, MarkerBackend,
        MockKeyValueStore, MockTokenBackend,
    };

    fn tokens(access: &str) -> TokenSet {
        TokenSet::new(access, Some("r".to_string()), Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = TokenStore::new(vec![
            Arc::new(KeyValueBackend::durable(Arc::new(InMemoryKeyValueStore::new()))),
            Arc::new(GlobalBackend::new(GlobalSlot::new())),
        ]);
        let t = tokens("abc");
        let report = store.set(t.clone()).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(store.get().await, Some(t));
        assert!(!store.is_expiring_soon(Duration::from_secs(300)).await);
    }

    #[tokio::test]
    async fn test_write_order_is_fixed() {
        let marker = Arc::new(MarkerBackend::new());
        let store = TokenStore::new(vec![
            marker.clone() as Arc<dyn TokenBackend>,
            Arc::new(GlobalBackend::new(GlobalSlot::new())),
            Arc::new(KeyValueBackend::ephemeral(Arc::new(InMemoryKeyValueStore::new()))),
            Arc::new(KeyValueBackend::durable(Arc::new(InMemoryKeyValueStore::new()))),
        ]);
        let report = store.set(tokens("abc")).await.unwrap();
        assert_eq!(
            report.written,
            vec![
                BackendKind::Durable,
                BackendKind::Ephemeral,
                BackendKind::Global,
                BackendKind::Marker
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_backend_does_not_abort_fan_out() {
        let failing = Arc::new(MockKeyValueStore::new());
        failing.set_fail_writes(true);
        let slot = GlobalSlot::new();
        let store = TokenStore::new(vec![
            Arc::new(KeyValueBackend::durable(failing)),
            Arc::new(GlobalBackend::new(slot.clone())),
        ]);

        let t = tokens("abc");
        let report = store.set(t.clone()).await.unwrap();

        assert_eq!(report.written, vec![BackendKind::Global]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(slot.get(), Some(t.clone()));
        assert_eq!(store.current(), Some(t));
    }

    #[tokio::test]
    async fn test_mocked_backend_failure() {
        let mut backend = MockTokenBackend::new();
        backend.expect_kind().return_const(BackendKind::Durable);
        backend.expect_save().times(1).returning(|_| {
            Err(StorageError::WriteFailed {
                backend: "durable".to_string(),
                message: "disk full".to_string(),
            })
        });

        let store = TokenStore::new(vec![Arc::new(backend)]);
        let report = store.set(tokens("abc")).await.unwrap();
        assert_eq!(report.failed[0].0, BackendKind::Durable);
        assert!(report.failed[0].1.contains("disk full"));
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let store = TokenStore::in_memory();
        let mut t = tokens("abc");
        t.access_token = String::new();
        assert!(matches!(store.set(t).await, Err(TokenError::Invalid { .. })));
        assert_eq!(store.get().await, None);
    }

    #[tokio::test]
    async fn test_hydrates_from_backend() {
        let slot = GlobalSlot::new();
        let t = tokens("from-another-window");
        slot.set(Some(t.clone()));

        let store = TokenStore::new(vec![Arc::new(GlobalBackend::new(slot))]);
        assert_eq!(store.current(), None);
        assert_eq!(store.get().await, Some(t));
        assert!(store.current().is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let slot = GlobalSlot::new();
        let store = TokenStore::new(vec![Arc::new(GlobalBackend::new(slot.clone()))]);
        store.set(tokens("abc")).await.unwrap();

        let report = store.clear().await;
        assert!(report.is_complete());
        assert_eq!(store.get().await, None);
        assert_eq!(slot.get(), None);
        assert!(store.is_expiring_soon(Duration::from_secs(1)).await);
    }
}
