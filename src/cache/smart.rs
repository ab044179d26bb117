//! Smart Cache
//!
//! Two-tier (hot/warm) response cache with TTL expiry and LRU eviction.
//!
//! Both tiers live behind one lock, so an insert, its eviction and any
//! demotion happen atomically with respect to concurrent `get`s.

use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ApiResult;
use crate::types::CacheConfig;

/// Cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Small, short-lived, frequently reused values.
    Hot,
    /// Larger values that are expensive to recompute.
    Warm,
}

/// A cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub inserted_at: Instant,
    pub last_accessed_at: Instant,
    pub ttl: Duration,
    pub tier: CacheTier,
    pub hits: u32,
    pub size_bytes: usize,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache counters and occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub expirations: u64,
    pub hot_entries: usize,
    pub warm_entries: usize,
}

struct Tiers<T> {
    hot: HashMap<String, CacheEntry<T>>,
    warm: HashMap<String, CacheEntry<T>>,
    stats: CacheStats,
}

impl<T> Tiers<T> {
    fn tier_mut(&mut self, tier: CacheTier) -> &mut HashMap<String, CacheEntry<T>> {
        match tier {
            CacheTier::Hot => &mut self.hot,
            CacheTier::Warm => &mut self.warm,
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        self.hot.remove(key).or_else(|| self.warm.remove(key))
    }
}

/// Two-tier cache keyed by string.
pub struct SmartCache<T> {
    config: CacheConfig,
    tiers: Mutex<Tiers<T>>,
}

impl<T> SmartCache<T>
where
    T: Clone + Serialize,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            tiers: Mutex::new(Tiers {
                hot: HashMap::new(),
                warm: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fresh value for `key`. Warm entries hit often enough move to hot.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut tiers = self.tiers.lock();

        let tier = if tiers.hot.contains_key(key) {
            CacheTier::Hot
        } else if tiers.warm.contains_key(key) {
            CacheTier::Warm
        } else {
            tiers.stats.misses += 1;
            return None;
        };

        let expired = tiers
            .tier_mut(tier)
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(true);
        if expired {
            tiers.tier_mut(tier).remove(key);
            tiers.stats.expirations += 1;
            tiers.stats.misses += 1;
            return None;
        }

        let (data, promote) = {
            let threshold = self.config.promotion_threshold;
            let entry = tiers.tier_mut(tier).get_mut(key)?;
            entry.hits = entry.hits.saturating_add(1);
            entry.last_accessed_at = now;
            (
                entry.data.clone(),
                tier == CacheTier::Warm && entry.hits > threshold,
            )
        };
        tiers.stats.hits += 1;

        if promote {
            if let Some(mut entry) = tiers.warm.remove(key) {
                entry.tier = CacheTier::Hot;
                tiers.stats.promotions += 1;
                debug!(key, "Promoted cache entry to hot tier");
                self.insert_hot(&mut tiers, key.to_string(), entry);
            }
        }

        Some(data)
    }

    /// Cache `data`. Without a tier, small values go hot and larger ones warm;
    /// values above `max_item_bytes` are not cached and `false` is returned.
    pub fn set(
        &self,
        key: impl Into<String>,
        data: T,
        tier: Option<CacheTier>,
        ttl: Option<Duration>,
    ) -> bool {
        let key = key.into();
        let size_bytes = serde_json::to_vec(&data).map(|v| v.len()).unwrap_or(usize::MAX);

        let mut tiers = self.tiers.lock();
        tiers.remove(&key);

        if size_bytes > self.config.max_item_bytes {
            debug!(key = %key, size_bytes, "Value too large to cache");
            return false;
        }

        let tier = tier.unwrap_or(if size_bytes <= self.config.hot_item_max_bytes {
            CacheTier::Hot
        } else {
            CacheTier::Warm
        });
        let ttl = ttl.unwrap_or(match tier {
            CacheTier::Hot => self.config.hot_ttl,
            CacheTier::Warm => self.config.warm_ttl,
        });
        let now = Instant::now();
        let entry = CacheEntry {
            data,
            inserted_at: now,
            last_accessed_at: now,
            ttl,
            tier,
            hits: 0,
            size_bytes,
        };

        match tier {
            CacheTier::Hot => self.insert_hot(&mut tiers, key, entry),
            CacheTier::Warm => self.insert_warm(&mut tiers, key, entry),
        }
        true
    }

    /// Return the cached value or fetch, cache and return it.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        tier: Option<CacheTier>,
        ttl: Option<Duration>,
        fetch: F,
    ) -> ApiResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let data = fetch().await?;
        self.set(key, data.clone(), tier, ttl);
        Ok(data)
    }

    /// Remove matching keys from both tiers. `*` matches any run of characters;
    /// a pattern without `*` matches keys containing it.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut tiers = self.tiers.lock();
        let before = tiers.hot.len() + tiers.warm.len();
        tiers.hot.retain(|key, _| !pattern_matches(pattern, key));
        tiers.warm.retain(|key, _| !pattern_matches(pattern, key));
        before - (tiers.hot.len() + tiers.warm.len())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.tiers.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut tiers = self.tiers.lock();
        tiers.hot.clear();
        tiers.warm.clear();
    }

    pub fn len(&self) -> usize {
        let tiers = self.tiers.lock();
        tiers.hot.len() + tiers.warm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tier currently holding `key`, expired or not.
    pub fn tier_of(&self, key: &str) -> Option<CacheTier> {
        let tiers = self.tiers.lock();
        if tiers.hot.contains_key(key) {
            Some(CacheTier::Hot)
        } else if tiers.warm.contains_key(key) {
            Some(CacheTier::Warm)
        } else {
            None
        }
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = self.tiers.lock();
        CacheStats {
            hot_entries: tiers.hot.len(),
            warm_entries: tiers.warm.len(),
            ..tiers.stats.clone()
        }
    }

    /// Drop TTL-expired entries from both tiers.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut tiers = self.tiers.lock();
        let before = tiers.hot.len() + tiers.warm.len();
        tiers.hot.retain(|_, entry| !entry.is_expired(now));
        tiers.warm.retain(|_, entry| !entry.is_expired(now));
        let removed = before - (tiers.hot.len() + tiers.warm.len());
        tiers.stats.expirations += removed as u64;
        removed
    }

    fn insert_hot(&self, tiers: &mut Tiers<T>, key: String, entry: CacheEntry<T>) {
        if tiers.hot.len() >= self.config.hot_capacity.max(1) {
            if let Some(lru) = least_recently_used(&tiers.hot) {
                if let Some(mut demoted) = tiers.hot.remove(&lru) {
                    demoted.tier = CacheTier::Warm;
                    tiers.stats.demotions += 1;
                    debug!(key = %lru, "Demoted cache entry to warm tier");
                    self.insert_warm(tiers, lru, demoted);
                }
            }
        }
        tiers.hot.insert(key, entry);
    }

    fn insert_warm(&self, tiers: &mut Tiers<T>, key: String, entry: CacheEntry<T>) {
        if tiers.warm.len() >= self.config.warm_capacity.max(1) {
            if let Some(lru) = least_recently_used(&tiers.warm) {
                tiers.warm.remove(&lru);
                tiers.stats.evictions += 1;
                debug!(key = %lru, "Evicted cache entry");
            }
        }
        tiers.warm.insert(key, entry);
    }
}

impl<T> SmartCache<T>
where
    T: Clone + Serialize + Send + 'static,
{
    /// Sweep expired entries every `sweep_interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                    None => break,
                }
            }
        })
    }
}

/// `namespace:` followed by the base64url SHA-256 of `value`'s JSON form.
pub fn content_key<V: Serialize + ?Sized>(
    namespace: &str,
    value: &V,
) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&json);
    Ok(format!(
        "{}:{}",
        namespace,
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
    ))
}

fn least_recently_used<T>(tier: &HashMap<String, CacheEntry<T>>) -> Option<String> {
    tier.iter()
        .min_by_key(|(_, entry)| entry.last_accessed_at)
        .map(|(key, _)| key.clone())
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return key.contains(pattern);
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return true,
    };
    if !key.starts_with(first) {
        return false;
    }
    let mut remaining = &key[first.len()..];

    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return remaining.is_empty(),
    };
    for part in middle {
        match remaining.find(part) {
            Some(index) => remaining = &remaining[index + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}
