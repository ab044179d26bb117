//! Token Backends
//!
//! Storage locations that each hold a copy of the token set.
//!
//! The token store fans every write out to its backends in [`BackendKind`]
//! order; the synchronizer polls them to detect a token issued elsewhere.

use async_trait::async_trait;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::StorageError;
use crate::types::TokenSet;

/// Key under which key-value backends store the encoded token set.
pub const DEFAULT_TOKEN_KEY: &str = "ebay_token";

/// Attribute name of the side-channel marker.
pub const MARKER_ATTRIBUTE: &str = "data-ebay-token";

/// Backend kind. Declaration order is the write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    Durable,
    Ephemeral,
    Global,
    Channel,
    Marker,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Ephemeral => "ephemeral",
            Self::Global => "global",
            Self::Channel => "channel",
            Self::Marker => "marker",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage location holding a copy of the token set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Current value; `None` when the backend holds nothing usable.
    async fn load(&self) -> Result<Option<TokenSet>, StorageError>;

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError>;

    async fn remove(&self) -> Result<(), StorageError>;
}

/// String key-value store (durable or ephemeral).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory key-value store.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Durable key-value store kept as a single JSON object on disk.
pub struct FileKeyValueStore {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: tokio::sync::Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, StorageError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(StorageError::ReadFailed {
                    backend: self.describe(),
                    message: e.to_string(),
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| StorageError::CorruptedData {
            backend: self.describe(),
            message: e.to_string(),
        })
    }

    async fn write_all(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let write_failed = |message: String| StorageError::WriteFailed {
            backend: self.describe(),
            message,
        };
        let raw = serde_json::to_string_pretty(entries).map_err(|e| write_failed(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| write_failed(e.to_string()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| write_failed(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| write_failed(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}

/// Mock key-value store for testing.
#[derive(Default)]
pub struct MockKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_history: Mutex<Vec<(String, String)>>,
}

impl MockKeyValueStore {
    /// Create new mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail.
    pub fn set_fail_reads(&self, fail: bool) -> &Self {
        self.fail_reads.store(fail, Ordering::SeqCst);
        self
    }

    /// Make every subsequent write and remove fail.
    pub fn set_fail_writes(&self, fail: bool) -> &Self {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self
    }

    /// Put a raw value, bypassing failure injection.
    pub fn insert_raw(&self, key: &str, value: &str) -> &Self {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Get successful write history.
    pub fn get_write_history(&self) -> Vec<(String, String)> {
        self.write_history.lock().clone()
    }
}

#[async_trait]
impl KeyValueStore for MockKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::ReadFailed {
                backend: "mock".to_string(),
                message: "injected read failure".to_string(),
            });
        }
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                backend: "mock".to_string(),
                message: "injected write failure".to_string(),
            });
        }
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        self.write_history
            .lock()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed {
                backend: "mock".to_string(),
                message: "injected delete failure".to_string(),
            });
        }
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Backend over a [`KeyValueStore`], as durable or ephemeral storage.
pub struct KeyValueBackend {
    kind: BackendKind,
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl KeyValueBackend {
    pub fn durable(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(BackendKind::Durable, store, DEFAULT_TOKEN_KEY)
    }

    pub fn ephemeral(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(BackendKind::Ephemeral, store, DEFAULT_TOKEN_KEY)
    }

    pub fn with_key(kind: BackendKind, store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            kind,
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl TokenBackend for KeyValueBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn load(&self) -> Result<Option<TokenSet>, StorageError> {
        match self.store.get(&self.key).await? {
            Some(raw) => TokenSet::decode(&raw).map_err(|e| StorageError::CorruptedData {
                backend: self.kind.to_string(),
                message: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        let raw = tokens.encode().map_err(|e| StorageError::WriteFailed {
            backend: self.kind.to_string(),
            message: e.to_string(),
        })?;
        self.store.set(&self.key, &raw).await
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.store.remove(&self.key).await
    }
}

/// Shared in-process token slot. Clones refer to the same slot.
#[derive(Clone, Default)]
pub struct GlobalSlot {
    value: Arc<RwLock<Option<TokenSet>>>,
}

impl GlobalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<TokenSet> {
        self.value.read().clone()
    }

    pub fn set(&self, tokens: Option<TokenSet>) {
        *self.value.write() = tokens;
    }
}

/// In-process global backend.
pub struct GlobalBackend {
    slot: GlobalSlot,
}

impl GlobalBackend {
    pub fn new(slot: GlobalSlot) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl TokenBackend for GlobalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Global
    }

    async fn load(&self) -> Result<Option<TokenSet>, StorageError> {
        Ok(self.slot.get().filter(|t| t.validate().is_ok()))
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        self.slot.set(Some(tokens.clone()));
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.slot.set(None);
        Ok(())
    }
}

/// Cross-window channel: every subscriber sees the latest token set.
pub struct ChannelBackend {
    sender: watch::Sender<Option<TokenSet>>,
}

impl ChannelBackend {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Subscribe to token changes made through this backend.
    pub fn subscribe(&self) -> watch::Receiver<Option<TokenSet>> {
        self.sender.subscribe()
    }

    /// Publish a value as another window would.
    pub fn publish(&self, tokens: Option<TokenSet>) {
        self.sender.send_replace(tokens);
    }
}

impl Default for ChannelBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenBackend for ChannelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Channel
    }

    async fn load(&self) -> Result<Option<TokenSet>, StorageError> {
        Ok(self
            .sender
            .borrow()
            .clone()
            .filter(|t| t.validate().is_ok()))
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        self.publish(Some(tokens.clone()));
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.publish(None);
        Ok(())
    }
}

/// Side-channel marker of the form `data-ebay-token=<base64url(json)>`.
#[derive(Default)]
pub struct MarkerBackend {
    marker: Mutex<Option<String>>,
}

impl MarkerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current marker text, if set.
    pub fn marker(&self) -> Option<String> {
        self.marker.lock().clone()
    }

    /// Overwrite the marker text as an external writer would.
    pub fn set_marker(&self, marker: Option<String>) {
        *self.marker.lock() = marker;
    }

    pub fn render(tokens: &TokenSet) -> Result<String, serde_json::Error> {
        let json = tokens.encode()?;
        Ok(format!(
            "{}={}",
            MARKER_ATTRIBUTE,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
        ))
    }

    pub fn parse(marker: &str) -> Result<Option<TokenSet>, StorageError> {
        let corrupted = |message: String| StorageError::CorruptedData {
            backend: BackendKind::Marker.to_string(),
            message,
        };
        let encoded = marker
            .trim()
            .strip_prefix(MARKER_ATTRIBUTE)
            .and_then(|rest| rest.strip_prefix('='))
            .ok_or_else(|| corrupted(format!("missing {} prefix", MARKER_ATTRIBUTE)))?;
        if encoded.is_empty() {
            return Ok(None);
        }
        let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| corrupted(e.to_string()))?;
        let json = String::from_utf8(json).map_err(|e| corrupted(e.to_string()))?;
        TokenSet::decode(&json).map_err(|e| corrupted(e.to_string()))
    }
}

#[async_trait]
impl TokenBackend for MarkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Marker
    }

    async fn load(&self) -> Result<Option<TokenSet>, StorageError> {
        match self.marker() {
            Some(marker) => Self::parse(&marker),
            None => Ok(None),
        }
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        let marker = Self::render(tokens).map_err(|e| StorageError::WriteFailed {
            backend: BackendKind::Marker.to_string(),
            message: e.to_string(),
        })?;
        self.set_marker(Some(marker));
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.set_marker(None);
        Ok(())
    }
}
