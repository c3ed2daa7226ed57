//! # In-Memory Store
//!
//! Provide the backing store for the ephemeral instance: sharded locking,
//! string and hash values, TTL-aware lookups.
//!
//! ## Usage
//!
//! - Use `MemoryStore::new()` for a default sharded store.
//! - Call `purge_expired` periodically for active TTL cleanup; reads already
//!   hide expired entries lazily.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Typed Values**: Strings and hashes share one keyspace; using a key
//!    with the wrong kind of operation is an error, as in Redis.
//! 3. **TTL Fast Path**: Expiration is checked on access for O(1) reads.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryStore
//!   └── shards: Vec<Shard>
//!         └── Shard
//!               └── inner: RwLock<HashMap<Bytes, Entry>>
//!                     └── Entry { value: Str | Hash, expires_at }
//! ```

use std::hash::{BuildHasher, Hasher};
use std::time::{Duration, Instant};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;

use mkv_common::TtlStatus;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Errors raised by store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The key holds a value of another kind.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
enum StoredValue {
    Str(Bytes),
    Hash(HashMap<Bytes, Bytes>),
}

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    /// Returns true when the entry has expired at `now`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

type ShardMap = HashMap<Bytes, Entry, RandomState>;

#[derive(Debug)]
struct Shard {
    inner: RwLock<ShardMap>,
}

/// Sharded in-memory keyspace.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    hash_state: RandomState,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store with a shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a store with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            })
            .collect();

        MemoryStore {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    /// Returns a string value, `None` when missing or expired.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        match live_entry(&mut inner, key, now) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Inserts or replaces a string value.
    ///
    /// Replaces values of any kind and resets the TTL to `ttl`.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut inner = self.shard_for(&key).inner.write();
        inner.insert(
            key,
            Entry {
                value: StoredValue::Str(value),
                expires_at,
            },
        );
    }

    /// Deletes a key. Returns true when a live entry was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        match inner.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Returns true when a live entry exists for `key`.
    pub fn exists(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        live_entry(&mut inner, key, now).is_some()
    }

    /// Returns TTL state for a key (missing, no-expiry, or remaining time).
    pub fn ttl(&self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        match live_entry(&mut inner, key, now) {
            None => TtlStatus::Missing,
            Some(entry) => match entry.expires_at {
                None => TtlStatus::NoExpiry,
                Some(deadline) => TtlStatus::ExpiresIn(deadline - now),
            },
        }
    }

    /// Writes hash fields, creating the hash when missing.
    ///
    /// Fields not present in `fields` are left untouched. Returns the number
    /// of fields that did not exist before.
    pub fn hset(&self, key: Bytes, fields: Vec<(Bytes, Bytes)>) -> StoreResult<usize> {
        let now = Instant::now();
        let mut inner = self.shard_for(&key).inner.write();
        if live_entry(&mut inner, &key, now).is_none() {
            inner.insert(
                key.clone(),
                Entry {
                    value: StoredValue::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }

        let Some(entry) = inner.get_mut(&key) else {
            return Ok(0);
        };
        let StoredValue::Hash(hash) = &mut entry.value else {
            return Err(StoreError::WrongType);
        };

        let mut created = 0;
        for (field, value) in fields {
            if hash.insert(field, value).is_none() {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Returns every field of a hash; empty when the key is missing.
    pub fn hgetall(&self, key: &[u8]) -> StoreResult<Vec<(Bytes, Bytes)>> {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();
        match live_entry(&mut inner, key, now) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(hash
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan and is intended for a periodic background sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            let before = inner.len();
            inner.retain(|_, entry| !entry.is_expired(now));
            removed += before - inner.len();
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.inner.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes a key to its owning shard index.
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }
}

/// Looks up `key`, dropping the entry first if it has expired.
fn live_entry<'a>(inner: &'a mut ShardMap, key: &[u8], now: Instant) -> Option<&'a Entry> {
    let expired = inner.get(key)?.is_expired(now);
    if expired {
        inner.remove(key);
        return None;
    }
    inner.get(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(data: &str) -> Bytes {
        Bytes::copy_from_slice(data.as_bytes())
    }

    #[test]
    fn set_get_roundtrip() {
        let store = MemoryStore::with_shard_count(4);
        store.set(b("alpha"), b("value"), None);
        assert_eq!(store.get(b"alpha").unwrap(), Some(b("value")));
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[test]
    fn expire_hides_value() {
        let store = MemoryStore::with_shard_count(2);
        store.set(b("alpha"), b("value"), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get(b"alpha").unwrap(), None);
        assert!(!store.exists(b"alpha"));
    }

    #[test]
    fn ttl_reports_missing_or_expiry() {
        let store = MemoryStore::with_shard_count(2);
        assert_eq!(store.ttl(b"missing"), TtlStatus::Missing);

        store.set(b("plain"), b("v"), None);
        assert_eq!(store.ttl(b"plain"), TtlStatus::NoExpiry);

        store.set(b("temp"), b("v"), Some(Duration::from_secs(6)));
        match store.ttl(b"temp") {
            TtlStatus::ExpiresIn(remaining) => {
                assert!(remaining <= Duration::from_secs(6));
                assert!(remaining > Duration::from_secs(5));
            }
            other => panic!("unexpected ttl: {other:?}"),
        }
    }

    #[test]
    fn set_clears_previous_ttl() {
        let store = MemoryStore::with_shard_count(1);
        store.set(b("k"), b("v1"), Some(Duration::from_secs(60)));
        store.set(b("k"), b("v2"), None);
        assert_eq!(store.ttl(b"k"), TtlStatus::NoExpiry);
    }

    #[test]
    fn hset_merges_fields() {
        let store = MemoryStore::with_shard_count(2);
        let created = store
            .hset(b("user:1"), vec![(b("name"), b("Alice")), (b("role"), b("admin"))])
            .unwrap();
        assert_eq!(created, 2);

        let created = store.hset(b("user:1"), vec![(b("role"), b("superadmin"))]).unwrap();
        assert_eq!(created, 0);

        let mut fields = store.hgetall(b"user:1").unwrap();
        fields.sort();
        assert_eq!(
            fields,
            vec![(b("name"), b("Alice")), (b("role"), b("superadmin"))]
        );
    }

    #[test]
    fn hgetall_missing_is_empty() {
        let store = MemoryStore::with_shard_count(2);
        assert!(store.hgetall(b"nobody").unwrap().is_empty());
    }

    #[test]
    fn wrong_type_is_rejected() {
        let store = MemoryStore::with_shard_count(2);
        store.set(b("text"), b("v"), None);
        assert_eq!(
            store.hset(b("text"), vec![(b("f"), b("v"))]),
            Err(StoreError::WrongType)
        );
        assert_eq!(store.hgetall(b"text"), Err(StoreError::WrongType));

        store.hset(b("hash"), vec![(b("f"), b("v"))]).unwrap();
        assert_eq!(store.get(b"hash"), Err(StoreError::WrongType));
    }

    #[test]
    fn purge_expired_removes_entries() {
        let store = MemoryStore::with_shard_count(2);
        store.set(b("alpha"), b("value"), Some(Duration::from_millis(5)));
        store.set(b("beta"), b("value"), None);
        let removed = store.purge_expired(Instant::now() + Duration::from_millis(10));
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_reports_live_entries() {
        let store = MemoryStore::with_shard_count(2);
        store.set(b("alpha"), b("value"), None);
        assert!(store.delete(b"alpha"));
        assert!(!store.delete(b"alpha"));
    }
}
