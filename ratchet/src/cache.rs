//! Bounded, TTL-governed cache of message keys for out-of-order decryption
//! (§4.7). The cache is the sole legitimate location for exposed message-key
//! bytes outside of an in-flight AEAD call.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Outcome of [`SkippedKeyCache::consume`]: absent, present-but-aged-out, or
/// present and fresh. Kept distinct from a plain `Option` so callers can map
/// "never skipped" to `DuplicateMessage` and "skipped then expired" to
/// `DecryptFailed` (§8 scenario 4).
pub enum ConsumeResult {
    NotFound,
    Expired,
    Found([u8; 32]),
}

/// Composite key: a DH step's thumbprint plus the chain counter within it.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SkippedKeyId {
    pub step_id: String,
    pub counter: u32,
}

struct Entry {
    key: [u8; 32],
    inserted_at: Duration,
}

/// A monotonic clock abstraction so TTL expiry (§8 scenario 4) is testable
/// without sleeping in unit tests. `SystemClock` is what `Session` uses by
/// default; tests may supply a manually-advanced clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// `store`/`consume`/`has`/`purgeExpired`/`purgeForStep` of §4.7.
pub struct SkippedKeyCache {
    entries: HashMap<SkippedKeyId, Entry>,
    max_skipped_keys: usize,
    ttl: Duration,
}

impl SkippedKeyCache {
    pub fn new(max_skipped_keys: usize, ttl: Duration) -> Self {
        SkippedKeyCache {
            entries: HashMap::new(),
            max_skipped_keys,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, step_id: &str, counter: u32) -> bool {
        self.entries.contains_key(&SkippedKeyId {
            step_id: step_id.to_string(),
            counter,
        })
    }

    /// Removes the entry and returns its key, if present and not expired.
    pub fn consume(&mut self, step_id: &str, counter: u32, clock: &dyn Clock) -> ConsumeResult {
        let id = SkippedKeyId {
            step_id: step_id.to_string(),
            counter,
        };
        match self.entries.get(&id) {
            None => ConsumeResult::NotFound,
            Some(entry) if clock.now().saturating_sub(entry.inserted_at) > self.ttl => {
                warn!("skipped key for step {step_id} counter {counter} expired before use");
                self.entries.remove(&id);
                ConsumeResult::Expired
            }
            Some(_) => ConsumeResult::Found(self.entries.remove(&id).unwrap().key),
        }
    }

    /// If at capacity, first purges expired entries; if still at capacity,
    /// evicts the entry with the smallest insertion timestamp. `max_per_step`
    /// additionally bounds how many keys a single chain may hold, evicting
    /// that chain's own oldest entry first when it would be exceeded.
    pub fn store(
        &mut self,
        step_id: &str,
        counter: u32,
        key: [u8; 32],
        clock: &dyn Clock,
        max_per_step: usize,
    ) -> Result<(), CacheError> {
        let now = clock.now();
        if self.count_for_step(step_id) >= max_per_step {
            if let Some(oldest) = self
                .entries
                .iter()
                .filter(|(id, _)| id.step_id == step_id)
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| id.clone())
            {
                warn!("per-step skipped-key cache at capacity for {step_id}, evicting oldest entry");
                self.entries.remove(&oldest);
            }
        }
        if self.entries.len() >= self.max_skipped_keys {
            self.purge_expired(now);
        }
        if self.entries.len() >= self.max_skipped_keys {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| id.clone())
            {
                warn!("skipped-key cache at capacity, evicting oldest entry {oldest:?}");
                self.entries.remove(&oldest);
            }
        }
        if self.entries.len() >= self.max_skipped_keys {
            return Err(CacheError::Exhausted);
        }
        self.entries.insert(
            SkippedKeyId {
                step_id: step_id.to_string(),
                counter,
            },
            Entry {
                key,
                inserted_at: now,
            },
        );
        Ok(())
    }

    pub fn purge_expired(&mut self, now: Duration) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_sub(e.inserted_at) <= ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            warn!("purged {evicted} expired skipped key(s)");
        }
    }

    pub fn purge_for_step(&mut self, step_id: &str) {
        self.entries.retain(|id, _| id.step_id != step_id);
    }

    pub fn count_for_step(&self, step_id: &str) -> usize {
        self.entries.keys().filter(|id| id.step_id == step_id).count()
    }

    /// A persistable snapshot, for [`crate::session::Session::serialize`].
    /// Timestamps are recorded relative to `clock`'s current reading so
    /// `from_snapshot` can rebase them onto a freshly started clock.
    pub fn snapshot(&self, clock: &dyn Clock) -> CacheSnapshot {
        let now = clock.now();
        CacheSnapshot {
            entries: self
                .entries
                .iter()
                .map(|(id, e)| SkippedEntrySnapshot {
                    step_id: id.step_id.clone(),
                    counter: id.counter,
                    key: e.key,
                    age_millis: now.saturating_sub(e.inserted_at).as_millis() as u64,
                })
                .collect(),
            max_skipped_keys: self.max_skipped_keys,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    pub fn from_snapshot(snapshot: CacheSnapshot, clock: &dyn Clock) -> Self {
        let now = clock.now();
        let mut entries = HashMap::new();
        for e in snapshot.entries {
            entries.insert(
                SkippedKeyId {
                    step_id: e.step_id,
                    counter: e.counter,
                },
                Entry {
                    key: e.key,
                    inserted_at: now.saturating_sub(Duration::from_millis(e.age_millis)),
                },
            );
        }
        SkippedKeyCache {
            entries,
            max_skipped_keys: snapshot.max_skipped_keys,
            ttl: Duration::from_secs(snapshot.ttl_secs),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedEntrySnapshot {
    pub step_id: String,
    pub counter: u32,
    pub key: [u8; 32],
    pub age_millis: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: Vec<SkippedEntrySnapshot>,
    pub max_skipped_keys: usize,
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualClock(std::sync::atomic::AtomicU64);
    impl ManualClock {
        fn new(d: Duration) -> Self {
            ManualClock(std::sync::atomic::AtomicU64::new(d.as_millis() as u64))
        }
        fn set(&self, d: Duration) {
            self.0.store(d.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
        }
    }
    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            Duration::from_millis(self.0.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    #[test]
    fn store_consume_roundtrip() {
        let mut cache = SkippedKeyCache::new(10, Duration::from_secs(7 * 24 * 3600));
        let clock = SystemClock::new();
        cache.store("abc", 1, [9u8; 32], &clock, 1000).unwrap();
        assert!(cache.has("abc", 1));
        match cache.consume("abc", 1, &clock) {
            ConsumeResult::Found(key) => assert_eq!(key, [9u8; 32]),
            _ => panic!("expected a fresh entry"),
        }
        assert!(!cache.has("abc", 1));
    }

    #[test]
    fn overflow_evicts_oldest_timestamp() {
        let mut cache = SkippedKeyCache::new(2, Duration::from_secs(3600));
        let clock = ManualClock::new(Duration::from_secs(0));
        cache.store("a", 1, [1u8; 32], &clock, 1000).unwrap();
        clock.set(Duration::from_secs(1));
        cache.store("a", 2, [2u8; 32], &clock, 1000).unwrap();
        clock.set(Duration::from_secs(2));
        cache.store("a", 3, [3u8; 32], &clock, 1000).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(!cache.has("a", 1));
        assert!(cache.has("a", 2));
        assert!(cache.has("a", 3));
    }

    #[test]
    fn expired_entries_are_purged_before_overflow_eviction() {
        let mut cache = SkippedKeyCache::new(1, Duration::from_millis(1));
        let clock = ManualClock::new(Duration::from_secs(0));
        cache.store("a", 1, [1u8; 32], &clock, 1000).unwrap();
        clock.set(Duration::from_millis(10));
        cache.store("a", 2, [2u8; 32], &clock, 1000).unwrap();
        assert!(!cache.has("a", 1));
        assert!(cache.has("a", 2));
    }

    #[test]
    fn purge_for_step_removes_only_that_step() {
        let mut cache = SkippedKeyCache::new(10, Duration::from_secs(3600));
        let clock = SystemClock::new();
        cache.store("a", 1, [1u8; 32], &clock, 1000).unwrap();
        cache.store("b", 1, [2u8; 32], &clock, 1000).unwrap();
        cache.purge_for_step("a");
        assert!(!cache.has("a", 1));
        assert!(cache.has("b", 1));
    }

    #[test]
    fn consume_rejects_an_expired_entry() {
        let mut cache = SkippedKeyCache::new(10, Duration::from_millis(1));
        let clock = ManualClock::new(Duration::from_secs(0));
        cache.store("a", 1, [1u8; 32], &clock, 1000).unwrap();
        clock.set(Duration::from_millis(10));
        assert!(matches!(cache.consume("a", 1, &clock), ConsumeResult::Expired));
        assert!(!cache.has("a", 1));
    }

    #[test]
    fn per_step_bound_evicts_within_that_step_only() {
        let mut cache = SkippedKeyCache::new(1000, Duration::from_secs(3600));
        let clock = ManualClock::new(Duration::from_secs(0));
        cache.store("a", 1, [1u8; 32], &clock, 2).unwrap();
        clock.set(Duration::from_secs(1));
        cache.store("a", 2, [2u8; 32], &clock, 2).unwrap();
        clock.set(Duration::from_secs(2));
        cache.store("b", 1, [3u8; 32], &clock, 2).unwrap();
        clock.set(Duration::from_secs(3));
        cache.store("a", 3, [4u8; 32], &clock, 2).unwrap();
        assert!(!cache.has("a", 1));
        assert!(cache.has("a", 2));
        assert!(cache.has("a", 3));
        assert!(cache.has("b", 1));
    }
}
