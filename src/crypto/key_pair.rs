// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Server Key Pair Management
//!
//! Owns the server's asymmetric key pairs for the configured curve. A new
//! pair is generated on every rotation; the most recent pairs stay resolvable
//! for a short retention window (two by default: current and previous) so a
//! client that fetched the public key just before a rotation can still
//! complete its exchange.
//!
//! ## Concurrency
//!
//! - The current key id is an `AtomicU64`, read without locking
//! - The retention window is an LRU map behind a `RwLock`; request threads only
//!   take the read lock and `peek` (no recency update), `rotate()` is the only writer
//! - Rotations are serialised by a dedicated mutex
//!
//! Private keys never leave this module except to [`SecretExchange`](super::SecretExchange).

use chrono::{DateTime, TimeZone, Utc};
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use super::agreement::{AgreementAlgorithm, KeyAgreement, PrivateKey};
use super::encoding::fingerprint;
use super::error::CryptoError;
use super::secret_cache::SharedSecretCache;

/// Default number of key pairs kept resolvable (current + previous)
pub const DEFAULT_RETAINED_KEY_PAIRS: usize = 2;

/// Identifier of a server key pair: its creation time in Unix milliseconds,
/// bumped when two pairs are created within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

impl KeyId {
    fn next_after(previous: u64) -> Self {
        let now = Utc::now().timestamp_millis().max(1) as u64;
        KeyId(now.max(previous + 1))
    }

    /// Creation time in Unix milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeyId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(id) if id > 0 => Ok(KeyId(id)),
            _ => Err(CryptoError::UnknownServerKey {
                key_id: s.to_string(),
            }),
        }
    }
}

/// One generation of the server's key pair
pub struct ServerKeyPair {
    key_id: KeyId,
    created_at: DateTime<Utc>,
    public_key: Vec<u8>,
    private_key: PrivateKey,
}

impl ServerKeyPair {
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// SubjectPublicKeyInfo DER of the public key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .field("public_key", &fingerprint(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Owner of the current server key pair and its retention window
pub struct KeyPairManager {
    agreement: Arc<dyn KeyAgreement>,
    current: AtomicU64,
    retained: RwLock<LruCache<KeyId, Arc<ServerKeyPair>>>,
    rotation_lock: Mutex<()>,
    secret_cache: Arc<SharedSecretCache>,
}

impl KeyPairManager {
    /// Create an empty manager. No key is available until [`rotate`](Self::rotate) succeeds.
    pub fn new(
        agreement: Arc<dyn KeyAgreement>,
        retained_key_pairs: usize,
        secret_cache: Arc<SharedSecretCache>,
    ) -> Self {
        let capacity = NonZeroUsize::new(retained_key_pairs).unwrap_or(NonZeroUsize::MIN);
        Self {
            agreement,
            current: AtomicU64::new(0),
            retained: RwLock::new(LruCache::new(capacity)),
            rotation_lock: Mutex::new(()),
            secret_cache,
        }
    }

    /// Create a manager and generate its first key pair
    pub fn initialized(
        agreement: Arc<dyn KeyAgreement>,
        retained_key_pairs: usize,
        secret_cache: Arc<SharedSecretCache>,
    ) -> Result<Self, CryptoError> {
        let manager = Self::new(agreement, retained_key_pairs, secret_cache);
        manager.rotate()?;
        Ok(manager)
    }

    pub fn algorithm(&self) -> AgreementAlgorithm {
        self.agreement.algorithm()
    }

    /// Id of the current key pair, if one has been generated
    pub fn current_key_id(&self) -> Option<KeyId> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            id => Some(KeyId(id)),
        }
    }

    /// Current key id and SubjectPublicKeyInfo DER public key
    pub fn current_public_key(&self) -> Result<(KeyId, Vec<u8>), CryptoError> {
        let key_id = self.current_key_id().ok_or(CryptoError::NoKeyAvailable)?;
        let key_pair = self.lookup(key_id).ok_or(CryptoError::NoKeyAvailable)?;
        Ok((key_id, key_pair.public_key().to_vec()))
    }

    /// Whether `key_id` is still inside the retention window
    pub fn contains(&self, key_id: KeyId) -> bool {
        self.lookup(key_id).is_some()
    }

    /// Retained key ids, newest first
    pub fn retained_key_ids(&self) -> Vec<KeyId> {
        let retained = self.retained.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<KeyId> = retained.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    pub(crate) fn private_key_for(&self, key_id: KeyId) -> Result<PrivateKey, CryptoError> {
        self.lookup(key_id)
            .map(|pair| pair.private_key().clone())
            .ok_or_else(|| CryptoError::UnknownServerKey {
                key_id: key_id.to_string(),
            })
    }

    fn lookup(&self, key_id: KeyId) -> Option<Arc<ServerKeyPair>> {
        let retained = self.retained.read().unwrap_or_else(PoisonError::into_inner);
        retained.peek(&key_id).cloned()
    }

    /// Generate a new key pair and make it current.
    ///
    /// The shared-secret cache is flushed before the new pair is inserted,
    /// so no cached secret can outlive the pair it was derived from. On
    /// failure nothing changes and the existing pairs stay valid.
    pub fn rotate(&self) -> Result<KeyId, CryptoError> {
        let _guard = self
            .rotation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let generated = self.agreement.generate_key_pair()?;
        let key_id = KeyId::next_after(self.current.load(Ordering::Acquire));
        let created_at = Utc
            .timestamp_millis_opt(key_id.as_millis() as i64)
            .single()
            .unwrap_or_else(Utc::now);
        let (public_key, private_key) = generated.into_parts();
        let key_pair = Arc::new(ServerKeyPair {
            key_id,
            created_at,
            public_key,
            private_key,
        });
        let public_fingerprint = fingerprint(key_pair.public_key());

        self.secret_cache.invalidate_all();
        let evicted = {
            let mut retained = self.retained.write().unwrap_or_else(PoisonError::into_inner);
            retained.push(key_id, key_pair)
        };
        self.current.store(key_id.as_millis(), Ordering::Release);

        if let Some((evicted_id, _)) = evicted {
            debug!("🗑️  Server key pair {} left the retention window", evicted_id);
        }
        info!(
            "🔑 Rotated server key pair: key_id={} curve={} public_key={}",
            key_id,
            self.agreement.algorithm(),
            public_fingerprint
        );
        Ok(key_id)
    }
}
