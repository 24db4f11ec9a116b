//! Resolution Cache
//!
//! Generic TTL cache shared by every connection task. Entries carry their own
//! expiry; a background sweep removes expired entries so memory stays bounded
//! even without read traffic. Sharded via `DashMap`, so there is no global lock.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Default structural TTL (1 day)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default sweep interval (1 hour)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Longest TTL an entry can carry; larger values are clamped (100 years)
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Concurrent key-value cache with per-entry expiration
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Look up a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // Guard released above; re-check so a fresh concurrent insert survives
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Insert (or overwrite) an entry that expires after `ttl`
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: expiry_after(ttl),
        };
        self.entries.insert(key, entry);
    }

    /// Insert with the cache's default TTL
    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the periodic sweep. Runs until the returned handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!("Cache sweep removed {} expired entries", removed);
                }
            }
        })
    }
}

/// `now + ttl`, clamped to [`MAX_TTL`] so it never overflows `Instant`
fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    let ttl = ttl.min(MAX_TTL);
    now.checked_add(ttl).unwrap_or(now + Duration::from_secs(24 * 60 * 60))
}
