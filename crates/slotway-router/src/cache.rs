//! Short-TTL caches for routing.
//!
//! `TtlCache` is a sharded concurrent map whose entries expire after a fixed
//! time-to-live. Reads never block each other; writes hold one shard briefly.
//! Expired entries are dropped lazily on read and by `purge_expired`.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use slotway_state::Slot;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Concurrent key/value cache with a fixed time-to-live.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get a live entry. Expired entries are removed and reported as misses.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entry = self.entries.get(key)?;
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
        }
        let ttl = self.ttl;
        self.entries
            .remove_if(key, |_, e| e.inserted_at.elapsed() >= ttl);
        None
    }

    /// Insert or replace an entry, restarting its TTL.
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove one entry.
    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Remove every entry whose key matches `predicate`. Returns the count removed.
    pub fn remove_matching(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !predicate(k));
        before.saturating_sub(self.entries.len())
    }

    /// Drop all expired entries. Returns the count removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries, including ones that expired but were not purged yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Key of a sticky-session entry: `(deployment_id, session_id)`.
pub type SessionKey = (String, String);

/// The two caches consulted on the routing hot path.
///
/// Both are invalidated together, per deployment, whenever slot state changes.
pub struct RouteCaches {
    /// deployment_id → slots, ordered by label.
    pub slots: TtlCache<String, Arc<Vec<Slot>>>,
    /// (deployment_id, session_id) → slot label.
    pub sessions: TtlCache<SessionKey, String>,
}

impl RouteCaches {
    pub fn new(slot_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            slots: TtlCache::new(slot_ttl),
            sessions: TtlCache::new(session_ttl),
        }
    }

    /// Drop everything cached for one deployment.
    pub fn invalidate(&self, deployment_id: &str) -> usize {
        self.slots.remove(&deployment_id.to_string());
        self.sessions.remove_matching(|(dep, _)| dep == deployment_id)
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.slots.clear();
        self.sessions.clear();
    }
}

impl Default for RouteCaches {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}
