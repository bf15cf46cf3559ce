// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shared Secret Cache
//!
//! Memoizes agreed secrets keyed by (server key id, peer public key) so that
//! clients calling encrypted routes at high frequency pay for the asymmetric
//! computation once.
//!
//! - **Single flight**: each key owns a slot with a `OnceCell`; concurrent
//!   callers for the same key wait on the same computation
//! - **Idle expiry**: entries not accessed within the idle window are treated
//!   as absent and dropped on the next sweep
//! - **Size bound**: inserting past `max_entries` evicts expired entries, then
//!   the least recently used ones
//! - **Flush**: key rotation calls [`invalidate_all`](SharedSecretCache::invalidate_all)

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

use super::error::CryptoError;
use super::key_pair::KeyId;

/// Default maximum number of cached secrets
pub const DEFAULT_MAX_ENTRIES: usize = 1 << 20;

/// Default idle window after which an unused secret is dropped
pub const DEFAULT_TIME_TO_IDLE: Duration = Duration::from_secs(30);

/// Agreed secret bytes, shared between cache and callers and zeroed when the
/// last reference goes away
#[derive(Clone)]
pub struct SharedSecret(Arc<Zeroizing<Vec<u8>>>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Zeroizing<Vec<u8>>> for SharedSecret {
    fn from(bytes: Zeroizing<Vec<u8>>) -> Self {
        SharedSecret(Arc::new(bytes))
    }
}

impl From<Vec<u8>> for SharedSecret {
    fn from(bytes: Vec<u8>) -> Self {
        SharedSecret(Arc::new(Zeroizing::new(bytes)))
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED; {}])", self.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    key_id: KeyId,
    peer_public_key: String,
}

struct Slot {
    value: OnceCell<SharedSecret>,
    last_access_ms: AtomicU64,
}

impl Slot {
    fn new(now_ms: u64) -> Self {
        Self {
            value: OnceCell::new(),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn idle_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_access_ms.load(Ordering::Relaxed))
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Bounded, idle-expiring, single-flight cache of agreed secrets
pub struct SharedSecretCache {
    entries: DashMap<CacheKey, Arc<Slot>>,
    max_entries: usize,
    time_to_idle_ms: u64,
    epoch: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SharedSecretCache {
    pub fn new(max_entries: usize, time_to_idle: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            time_to_idle_ms: time_to_idle.as_millis().max(1) as u64,
            epoch: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn is_expired(&self, slot: &Slot, now_ms: u64) -> bool {
        slot.idle_for(now_ms) >= self.time_to_idle_ms
    }

    /// Return the cached secret for `(key_id, peer_public_key)`, computing it
    /// with `compute` on a miss.
    ///
    /// Concurrent callers for the same key run `compute` at most once; the
    /// others block until it finishes and share the result. A failed
    /// computation is not cached.
    pub fn get_or_compute<S, F>(
        &self,
        key_id: KeyId,
        peer_public_key: &str,
        compute: F,
    ) -> Result<SharedSecret, CryptoError>
    where
        S: Into<SharedSecret>,
        F: FnOnce() -> Result<S, CryptoError>,
    {
        let now = self.now_ms();
        let key = CacheKey {
            key_id,
            peer_public_key: peer_public_key.to_string(),
        };
        let (slot, inserted) = self.slot_for(key, now);
        if inserted && self.entries.len() > self.max_entries {
            self.evict_overflow();
        }

        slot.touch(now);
        if let Some(secret) = slot.value.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(secret.clone());
        }

        let secret = slot.value.get_or_try_init(|| {
            self.misses.fetch_add(1, Ordering::Relaxed);
            compute().map(Into::into)
        })?;
        Ok(secret.clone())
    }

    /// Find or create the slot for `key`, replacing it if it has expired
    fn slot_for(&self, key: CacheKey, now_ms: u64) -> (Arc<Slot>, bool) {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now_ms) {
                    let fresh = Arc::new(Slot::new(now_ms));
                    occupied.insert(fresh.clone());
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    (fresh, false)
                } else {
                    (occupied.get().clone(), false)
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(Slot::new(now_ms));
                vacant.insert(fresh.clone());
                (fresh, true)
            }
        }
    }

    /// Bring the cache back under its bound: expired entries first, then the
    /// least recently used down to 7/8 of capacity so the sweep amortizes.
    fn evict_overflow(&self) {
        let removed_idle = self.purge_expired();
        let len = self.entries.len();
        if len <= self.max_entries {
            return;
        }

        let target = self.max_entries - self.max_entries / 8;
        let mut by_age: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().last_access_ms.load(Ordering::Relaxed),
                )
            })
            .collect();
        by_age.sort_unstable_by_key(|(_, last_access)| *last_access);

        let excess = len.saturating_sub(target);
        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        self.evictions.fetch_add(excess as u64, Ordering::Relaxed);
        debug!(
            "Shared secret cache over capacity: dropped {} idle and {} least recently used entries",
            removed_idle, excess
        );
    }

    /// Drop every entry idle for longer than the idle window
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !self.is_expired(slot, now));
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every cached secret
    pub fn invalidate_all(&self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!("🗑️  Shared secret cache flushed (count: {})", count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl Default for SharedSecretCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TIME_TO_IDLE)
    }
}
