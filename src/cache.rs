//! Decision cache
//!
//! Memoizes `(identity, operation, resource)` verdicts with a TTL, bounded
//! LRU capacity and snapshot-version invalidation. The cache is split into
//! independently locked shards so lookups for different keys rarely contend.

use crate::config::{CacheConfig, Operation};
use crate::engine::Verdict;
use crate::identity::IdentityKey;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache key: canonical identity, operation and resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    identity: IdentityKey,
    operation: Operation,
    resource: Box<str>,
}

impl CacheKey {
    pub fn new(identity: IdentityKey, operation: Operation, resource: &str) -> Self {
        Self {
            identity,
            operation,
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: Verdict,
    version: u64,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, active_version: u64, now: Instant) -> bool {
        self.version == active_version && now <= self.expires_at
    }

    /// Can never be served again: older than the active snapshot, or expired
    fn is_dead(&self, active_version: u64, now: Instant) -> bool {
        self.version < active_version || now > self.expires_at
    }
}

struct Shard {
    /// Newest snapshot version written to this shard
    epoch: u64,
    entries: LruCache<CacheKey, CacheEntry>,
}

/// Sharded TTL + LRU decision cache
pub struct DecisionCache {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
    enabled: bool,
    capacity: usize,
}

impl DecisionCache {
    /// Create a cache from configuration
    pub fn new(config: &CacheConfig) -> Self {
        if !config.enabled || config.max_entries == 0 {
            return Self::disabled();
        }

        let shard_count = config.shards.clamp(1, config.max_entries);
        let per_shard = config.max_entries.div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    epoch: 0,
                    entries: LruCache::new(per_shard),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            enabled: true,
            capacity: per_shard.get() * shard_count,
        }
    }

    /// Cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            shards: Vec::new().into_boxed_slice(),
            hasher: RandomState::new(),
            enabled: false,
            capacity: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Total entry capacity across shards
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shard(&self, key: &CacheKey) -> Option<&Mutex<Shard>> {
        if self.shards.is_empty() {
            return None;
        }
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        Some(&self.shards[idx])
    }

    /// Cached verdict, if computed against `active_version` and not expired
    pub fn get(&self, key: &CacheKey, active_version: u64) -> Option<Verdict> {
        self.get_at(key, active_version, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, active_version: u64, now: Instant) -> Option<Verdict> {
        let mut shard = self.shard(key)?.lock();

        match shard.entries.get(key) {
            Some(entry) if entry.is_valid(active_version, now) => return Some(entry.verdict.clone()),
            Some(entry) if entry.is_dead(active_version, now) => {}
            // Computed against a snapshot newer than the caller's
            _ => return None,
        }

        shard.entries.pop(key);
        None
    }

    /// Store a verdict computed against snapshot `version`
    pub fn put(&self, key: CacheKey, verdict: Verdict, version: u64, ttl: Duration) {
        self.put_at(key, verdict, version, ttl, Instant::now());
    }

    pub fn put_at(&self, key: CacheKey, verdict: Verdict, version: u64, ttl: Duration, now: Instant) {
        let Some(shard) = self.shard(&key) else {
            return;
        };
        let mut shard = shard.lock();

        if version < shard.epoch {
            // Computed against a snapshot that has since been replaced
            return;
        }
        if version > shard.epoch {
            if !shard.entries.is_empty() {
                debug!(
                    dropped = shard.entries.len(),
                    old_version = shard.epoch,
                    new_version = version,
                    "Invalidating decisions from previous snapshot"
                );
            }
            shard.entries.clear();
            shard.epoch = version;
        }

        shard.entries.put(
            key,
            CacheEntry {
                verdict,
                version,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop every entry computed against a version older than `version`
    pub fn retire_before(&self, version: u64) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            if shard.epoch < version {
                shard.entries.clear();
                shard.epoch = version;
            }
        }
    }

    /// Remove expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let expired: Vec<CacheKey> = shard
                .entries
                .iter()
                .filter(|(_, entry)| now > entry.expires_at)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                shard.entries.pop(key);
            }
            removed += expired.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
