//! In-process counter store.
//!
//! Mirrors the Redis semantics the engine relies on (atomic increment,
//! expiry on first increment, overwrite-on-set) for tests and single-node
//! deployments. Expired entries are dropped when touched, and a full sweep
//! runs every [`SWEEP_INTERVAL`] increments so per-window keys that are never
//! read again do not pile up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{ttl_secs, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Increments between sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    /// Expiry as milliseconds since the Unix epoch.
    expires_at_ms: u64,
}

impl Slot {
    fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// A counter store held entirely in process memory.
pub struct InMemoryCounterStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    increments: AtomicU64,
}

impl InMemoryCounterStore {
    /// Create a store that expires entries against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires entries against the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            increments: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().as_millis() as u64
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.now_ms() + ttl_secs(ttl) * 1000
    }

    /// Current value of a live counter, without incrementing it.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = self.now_ms();
        self.slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value)
    }

    /// Remaining time to live of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.now_ms();
        self.slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| Duration::from_millis(slot.expires_at_ms - now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.now_ms();
        self.slots.iter().filter(|s| s.is_live(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Drop every key.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_with_ttl(
        &self,
        key: &str,
        ttl_if_first: Duration,
    ) -> Result<i64, StoreError> {
        let now = self.now_ms();
        let value = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_live(now) {
                    slot.value += 1;
                } else {
                    *slot = Slot {
                        value: 1,
                        expires_at_ms: self.expiry(ttl_if_first),
                    };
                }
                slot.value
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: 1,
                    expires_at_ms: self.expiry(ttl_if_first),
                });
                1
            }
        };

        trace!(key = %key, value, "Incremented in-memory counter");

        // The entry guard is released above; retain needs every shard lock.
        if (self.increments.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = self.slots.len(), "Swept expired counters");
            }
        }
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.now_ms();
        let live = self.slots.get(key).map(|s| s.is_live(now)).unwrap_or(false);
        if !live {
            self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        }
        Ok(live)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        Ok(self.ttl(key))
    }

    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: 1,
                expires_at_ms: self.expiry(ttl),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(secs: u64) -> (InMemoryCounterStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(secs)));
        (InMemoryCounterStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_increment_creates_and_counts() {
        let (store, _) = store_at(1_000);

        for expected in 1..=3 {
            let value = store
                .increment_with_ttl("k", Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(value, expected);
        }
        assert_eq!(store.get("k"), Some(3));
    }

    #[tokio::test]
    async fn test_ttl_only_set_on_first_increment() {
        let (store, clock) = store_at(1_000);

        store.increment_with_ttl("k", Duration::from_secs(2)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        store.increment_with_ttl("k", Duration::from_secs(60)).await.unwrap();

        // The second increment must not have extended the expiry.
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k"), None);
        let value = store.increment_with_ttl("k", Duration::from_secs(2)).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_set_with_ttl_and_exists() {
        let (store, clock) = store_at(1_000);

        assert!(!store.exists("blocked").await.unwrap());
        store.set_with_ttl("blocked", Duration::from_secs(10)).await.unwrap();
        assert!(store.exists("blocked").await.unwrap());

        clock.advance(Duration::from_secs(9));
        assert!(store.exists("blocked").await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(!store.exists("blocked").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_with_ttl_resets_expiry() {
        let (store, clock) = store_at(1_000);

        store.set_with_ttl("blocked", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(8));
        store.set_with_ttl("blocked", Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.ttl("blocked"), Some(Duration::from_secs(10)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryCounterStore::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store
                        .increment_with_ttl("shared", Duration::from_secs(60))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("shared"), Some(400));
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _) = store_at(1_000);
        store.increment_with_ttl("a", Duration::from_secs(2)).await.unwrap();
        store.set_with_ttl("b", Duration::from_secs(2)).await.unwrap();
        assert_eq!(store.len(), 2);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_ping_and_exists_blocking() {
        let store = InMemoryCounterStore::new();
        tokio_test::assert_ok!(tokio_test::block_on(store.ping()));
        assert!(tokio_test::block_on(store.exists("missing")).is_ok());
    }

    #[tokio::test]
    async fn test_expired_windows_are_swept() {
        let (store, clock) = store_at(1_000);

        // One per-second key and one per-minute key each second for an hour.
        for second in 0..3_600u64 {
            store
                .increment_with_ttl(&format!("rps:{}", 1_000 + second), Duration::from_secs(2))
                .await
                .unwrap();
            store
                .increment_with_ttl(&format!("ipm:{}", (1_000 + second) / 60), Duration::from_secs(60))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        assert!(store.len() <= 4);
        assert!(
            store.slots.len() <= SWEEP_INTERVAL as usize + 4,
            "stored {} entries",
            store.slots.len()
        );
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_keys() {
        let (store, clock) = store_at(1_000);
        store.increment_with_ttl("short", Duration::from_secs(1)).await.unwrap();
        store.set_with_ttl("long", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.slots.len(), 1);
        assert!(store.exists("long").await.unwrap());
    }

    #[tokio::test]
    async fn test_remaining_ttl() {
        let (store, clock) = store_at(1_000);
        assert_eq!(store.remaining_ttl("block").await.unwrap(), None);

        store.set_with_ttl("block", Duration::from_secs(300)).await.unwrap();
        clock.advance(Duration::from_millis(100_500));
        assert_eq!(
            store.remaining_ttl("block").await.unwrap(),
            Some(Duration::from_millis(199_500))
        );
    }
}
