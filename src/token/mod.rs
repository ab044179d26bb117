//! Token Management
//!
//! Token storage, synchronization and lifecycle management.
//!
//! This module provides:
//!
//! - **Backends**: Durable, ephemeral, global, channel and marker token copies
//! - **Token Store**: Canonical token set with best-effort fan-out
//! - **Notifications**: Batched token change events
//! - **Synchronizer**: Quorum-based detection with adaptive polling
//! - **Lifecycle**: Refresh decisions, single-flight refresh, authorization and logout

pub mod backend;
pub mod lifecycle;
pub mod notify;
pub mod store;
pub mod sync;

// Backends
pub use backend::{
    BackendKind, ChannelBackend, FileKeyValueStore, GlobalBackend, GlobalSlot,
    InMemoryKeyValueStore, KeyValueBackend, KeyValueStore, MarkerBackend, MockKeyValueStore,
    TokenBackend, DEFAULT_TOKEN_KEY, MARKER_ATTRIBUTE,
};

// Lifecycle
pub use lifecycle::{HttpTokenRefresher, MockTokenRefresher, TokenLifecycleManager, TokenRefresher};

// Notifications
pub use notify::{NotificationBatcher, TokenEvent, TokenNotification};

// Store and synchronizer
pub use store::{TokenStore, WriteReport};
pub use sync::{DetectionResult, DetectionState, TokenSynchronizer};
