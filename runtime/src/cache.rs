//! Write-through cache with versioned entries and broadcast invalidation.
//!
//! Hot-path reads (product, stock quantity) are served from a local
//! key→value map with per-entry TTL. Writes happen after the authoritative
//! store commits and carry the aggregate version: a conditional write never
//! lets an older version overwrite a newer one, which closes the race
//! between a slow reader populating stale data and a writer publishing the
//! fresh mutation.
//!
//! Invalidations are broadcast to peer processes over a bus; each peer
//! evicts locally. The broadcast is best-effort — the TTL is the
//! correctness floor, and a cache failure is never fatal (readers fall
//! through to the store).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Fraction of the TTL below which a hit also requests an async refresh.
const REFRESH_THRESHOLD: f64 = 0.25;

/// One access in this many is sampled into the hot-item counters.
const HOT_SAMPLE_RATE: u32 = 8;

/// Errors from the invalidation bus (never fatal to callers).
#[derive(Error, Debug, Clone)]
#[error("Cache invalidation bus error: {0}")]
pub struct InvalidationError(pub String);

/// An invalidation message broadcast between peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Invalidation {
    /// Evict one key.
    Single {
        /// The key to evict.
        key: String,
    },
    /// Evict several keys.
    Multi {
        /// The keys to evict.
        keys: Vec<String>,
    },
    /// Evict everything.
    All,
}

/// The result of a cache read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheRead<V> {
    /// The key was present and fresh.
    Hit {
        /// The cached value.
        value: V,
        /// Set when remaining TTL dropped below the refresh threshold; the
        /// caller should trigger an asynchronous reload.
        needs_refresh: bool,
    },
    /// The key was absent or expired; load from the authoritative store.
    Miss,
}

struct Entry<V> {
    value: V,
    version: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct HotTracker {
    counters: Mutex<HashMap<String, u64>>,
    sample_tick: AtomicU64,
}

impl HotTracker {
    fn record(&self, key: &str) {
        // Sampled counting keeps the tracker off the hot path.
        let tick = self.sample_tick.fetch_add(1, Ordering::Relaxed);
        if tick % u64::from(HOT_SAMPLE_RATE) != 0 {
            return;
        }
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *counters.entry(key.to_string()).or_insert(0) += 1;
    }

    fn drain_hot(&self, min_samples: u64) -> Vec<String> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let hot = counters
            .iter()
            .filter(|(_, count)| **count >= min_samples)
            .map(|(key, _)| key.clone())
            .collect();
        counters.clear();
        hot
    }
}

/// A named TTL cache with version-stamped conditional writes.
pub struct Cache<V> {
    name: String,
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry<V>>>,
    hot: HotTracker,
}

impl<V: Clone> Cache<V> {
    /// Create a cache with the given name (for logs/metrics) and TTL.
    #[must_use]
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            entries: RwLock::new(HashMap::new()),
            hot: HotTracker::default(),
        }
    }

    /// The cache's configured TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read a key. Expired entries read as [`CacheRead::Miss`]; hits with
    /// less than a quarter of their TTL left set `needs_refresh`.
    pub fn get(&self, key: &str) -> CacheRead<V> {
        self.hot.record(key);
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(entry) = entries.get(key) else {
            metrics::counter!("cache.miss", "cache" => self.name.clone()).increment(1);
            return CacheRead::Miss;
        };

        let now = Instant::now();
        if entry.expires_at <= now {
            metrics::counter!("cache.miss", "cache" => self.name.clone()).increment(1);
            return CacheRead::Miss;
        }

        let remaining = entry.expires_at - now;
        let needs_refresh = remaining.as_secs_f64() < self.ttl.as_secs_f64() * REFRESH_THRESHOLD;
        metrics::counter!("cache.hit", "cache" => self.name.clone()).increment(1);
        CacheRead::Hit {
            value: entry.value.clone(),
            needs_refresh,
        }
    }

    /// Write-through after an authoritative mutation. The write is
    /// conditional on the version stamp: an entry already carrying a newer
    /// version is left alone. Returns whether the write landed.
    pub fn put_versioned(&self, key: &str, value: V, version: u64) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(existing) = entries.get(key) {
            if existing.version > version {
                tracing::debug!(
                    cache = %self.name,
                    key,
                    existing = existing.version,
                    incoming = version,
                    "Skipping stale cache write"
                );
                metrics::counter!("cache.stale_write", "cache" => self.name.clone()).increment(1);
                return false;
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: Instant::now() + self.ttl,
            },
        );
        true
    }

    /// Evict a single key locally.
    pub fn evict(&self, key: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(key);
    }

    /// Apply a peer invalidation message.
    pub fn apply(&self, invalidation: &Invalidation) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match invalidation {
            Invalidation::Single { key } => {
                entries.remove(key);
            },
            Invalidation::Multi { keys } => {
                for key in keys {
                    entries.remove(key);
                }
            },
            Invalidation::All => entries.clear(),
        }
        metrics::counter!("cache.invalidation", "cache" => self.name.clone()).increment(1);
    }

    /// Pre-populate entries at process start (cache warming).
    pub fn warm(&self, items: Vec<(String, V, u64)>) {
        let count = items.len();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        for (key, value, version) in items {
            entries.insert(
                key,
                Entry {
                    value,
                    version,
                    expires_at: now + self.ttl,
                },
            );
        }
        tracing::info!(cache = %self.name, count, "Cache warmed");
    }

    /// Maintenance pass: drop expired entries and extend the TTL of keys
    /// the sampler saw often since the last pass. Returns the hot keys so
    /// the caller can prefetch them on the next boot.
    pub fn maintain(&self, min_hot_samples: u64) -> Vec<String> {
        let hot = self.hot.drain_hot(min_hot_samples);
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Extend first so a busy key is not purged the instant it expires.
        for key in &hot {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = now + self.ttl + self.ttl / 2;
            }
        }

        entries.retain(|_, entry| entry.expires_at > now);

        if !hot.is_empty() {
            tracing::debug!(cache = %self.name, hot = hot.len(), "Extended TTL for hot keys");
        }
        hot
    }

    /// Number of live (possibly expired, not yet purged) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The cache key for a product aggregate.
#[must_use]
pub fn product_key(product_id: &ordermesh_core::ids::ProductId) -> String {
    format!("product:{product_id}")
}

/// The cache key for a product's stock counters.
#[must_use]
pub fn stock_key(product_id: &ordermesh_core::ids::ProductId) -> String {
    format!("stock:{product_id}")
}

/// In-process invalidation bus over a tokio broadcast channel. Peers in
/// other processes plug a broker-backed implementation into the same
/// shape.
pub struct InvalidationBus {
    sender: broadcast::Sender<Invalidation>,
}

impl InvalidationBus {
    /// Create a bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast an invalidation to every subscribed peer. Best-effort: a
    /// bus with no listeners is not an error.
    pub fn broadcast(&self, invalidation: Invalidation) {
        if let Err(e) = self.sender.send(invalidation) {
            // No receivers; correctness falls back to TTL expiry.
            tracing::debug!(error = %e, "Invalidation broadcast had no listeners");
        }
    }

    /// Subscribe for invalidation messages.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.sender.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Periodic cache upkeep, registered on the scheduler: purges expired
/// entries and extends the TTL of keys the sampler saw often.
pub struct CacheMaintenance<V> {
    cache: std::sync::Arc<Cache<V>>,
    min_hot_samples: u64,
}

impl<V: Clone + Send + Sync> CacheMaintenance<V> {
    /// Create a maintenance job over a cache.
    #[must_use]
    pub const fn new(cache: std::sync::Arc<Cache<V>>, min_hot_samples: u64) -> Self {
        Self {
            cache,
            min_hot_samples,
        }
    }
}

impl<V: Clone + Send + Sync> crate::scheduler::Job for CacheMaintenance<V> {
    fn run(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + '_>>
    {
        Box::pin(async move {
            let hot = self.cache.maintain(self.min_hot_samples);
            if !hot.is_empty() {
                tracing::debug!(hot = hot.len(), "Cache maintenance extended hot keys");
            }
            Ok(())
        })
    }
}

/// Spawn a task applying bus invalidations to a cache until the bus
/// closes. Lagged receivers clear the whole cache — cheaper than tracking
/// which messages were missed.
pub fn spawn_invalidation_listener<V: Clone + Send + Sync + 'static>(
    cache: std::sync::Arc<Cache<V>>,
    mut receiver: broadcast::Receiver<Invalidation>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(invalidation) => cache.apply(&invalidation),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Invalidation listener lagged, clearing cache");
                    cache.apply(&Invalidation::All);
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn miss_then_hit() {
        let cache: Cache<u64> = Cache::new("stock", Duration::from_secs(300));
        assert_eq!(cache.get("stock:p1"), CacheRead::Miss);

        cache.put_versioned("stock:p1", 42, 1);
        assert!(matches!(
            cache.get("stock:p1"),
            CacheRead::Hit { value: 42, needs_refresh: false }
        ));
    }

    #[test]
    fn stale_version_never_overwrites_newer() {
        let cache: Cache<u64> = Cache::new("stock", Duration::from_secs(300));
        assert!(cache.put_versioned("stock:p1", 10, 5));

        // A write stamped with an older aggregate version loses.
        assert!(!cache.put_versioned("stock:p1", 99, 3));
        assert!(matches!(
            cache.get("stock:p1"),
            CacheRead::Hit { value: 10, .. }
        ));

        // A newer version wins.
        assert!(cache.put_versioned("stock:p1", 7, 6));
        assert!(matches!(
            cache.get("stock:p1"),
            CacheRead::Hit { value: 7, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_read_as_miss() {
        let cache: Cache<u64> = Cache::new("stock", Duration::from_secs(10));
        cache.put_versioned("stock:p1", 42, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("stock:p1"), CacheRead::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn near_expiry_hit_requests_refresh() {
        let cache: Cache<u64> = Cache::new("stock", Duration::from_secs(100));
        cache.put_versioned("stock:p1", 42, 1);

        // 80 of 100 seconds gone: remaining 20% < 25% threshold.
        tokio::time::advance(Duration::from_secs(80)).await;
        assert!(matches!(
            cache.get("stock:p1"),
            CacheRead::Hit { value: 42, needs_refresh: true }
        ));
    }

    #[test]
    fn invalidation_messages_evict() {
        let cache: Cache<u64> = Cache::new("product", Duration::from_secs(300));
        cache.put_versioned("product:a", 1, 1);
        cache.put_versioned("product:b", 2, 1);
        cache.put_versioned("product:c", 3, 1);

        cache.apply(&Invalidation::Single {
            key: "product:a".to_string(),
        });
        assert_eq!(cache.get("product:a"), CacheRead::Miss);

        cache.apply(&Invalidation::Multi {
            keys: vec!["product:b".to_string()],
        });
        assert_eq!(cache.get("product:b"), CacheRead::Miss);

        cache.apply(&Invalidation::All);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn bus_delivers_to_listener() {
        let cache: Arc<Cache<u64>> = Arc::new(Cache::new("product", Duration::from_secs(300)));
        cache.put_versioned("product:a", 1, 1);

        let bus = InvalidationBus::default();
        let listener = spawn_invalidation_listener(Arc::clone(&cache), bus.subscribe());

        bus.broadcast(Invalidation::Single {
            key: "product:a".to_string(),
        });

        // Give the listener a tick to process.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("product:a"), CacheRead::Miss);

        drop(bus);
        listener.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn maintain_purges_expired_and_extends_hot() {
        let cache: Cache<u64> = Cache::new("stock", Duration::from_secs(100));
        cache.put_versioned("hot", 1, 1);
        cache.put_versioned("cold", 2, 1);

        // Every HOT_SAMPLE_RATE-th access is sampled; hammer the hot key.
        for _ in 0..64 {
            let _ = cache.get("hot");
        }

        tokio::time::advance(Duration::from_secs(101)).await;
        let hot = cache.maintain(1);

        assert_eq!(hot, vec!["hot".to_string()]);
        // Cold expired and was purged; hot was extended past its expiry.
        assert_eq!(cache.get("cold"), CacheRead::Miss);
        assert!(matches!(cache.get("hot"), CacheRead::Hit { value: 1, .. }));
    }

    #[test]
    fn warm_populates_entries() {
        let cache: Cache<u64> = Cache::new("product", Duration::from_secs(300));
        cache.warm(vec![
            ("product:a".to_string(), 1, 4),
            ("product:b".to_string(), 2, 9),
        ]);

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.get("product:a"), CacheRead::Hit { value: 1, .. }));
        // Warmed versions participate in conditional writes.
        assert!(!cache.put_versioned("product:b", 0, 8));
    }

    #[test]
    fn invalidation_wire_shape() {
        let json = serde_json::to_value(Invalidation::Multi {
            keys: vec!["stock:p1".to_string()],
        })
        .unwrap();
        assert_eq!(json["kind"], "MULTI");

        let all: Invalidation = serde_json::from_value(serde_json::json!({"kind": "ALL"})).unwrap();
        assert_eq!(all, Invalidation::All);
    }
}
