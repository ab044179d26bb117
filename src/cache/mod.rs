//! Response Cache
//!
//! Two-tier (hot/warm) cache for API responses.

pub mod smart;

pub use smart::{content_key, CacheEntry, CacheStats, CacheTier, SmartCache};
