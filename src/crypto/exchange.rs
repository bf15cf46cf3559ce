// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Secret Exchange
//!
//! Ties the key pair manager, the shared-secret cache and the curve strategy
//! together. This is the only component the HTTP layer talks to:
//!
//! 1. Clients fetch [`public_key_info`](SecretExchange::public_key_info) over a plain route
//! 2. They agree a secret locally and send their own public key with the server key id
//! 3. [`shared_secret`](SecretExchange::shared_secret) derives (or recalls) the same secret
//!
//! ## Example
//!
//! ```no_run
//! use fabstir_http_cipher::crypto::{AgreementAlgorithm, SecretExchange};
//!
//! let exchange = SecretExchange::builder()
//!     .algorithm(AgreementAlgorithm::X25519)
//!     .build()?;
//! let info = exchange.public_key_info()?;
//! println!("key {} -> {}", info.key_id, info.public_key);
//! # Ok::<(), fabstir_http_cipher::crypto::CryptoError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::agreement::{AgreementAlgorithm, KeyAgreement};
use super::encoding::{decode_b64url, encode_b64url};
use super::error::CryptoError;
use super::key_pair::{KeyId, KeyPairManager, DEFAULT_RETAINED_KEY_PAIRS};
use super::rotation::RotationTask;
use super::secret_cache::{SharedSecret, SharedSecretCache, DEFAULT_MAX_ENTRIES, DEFAULT_TIME_TO_IDLE};

/// Published server key: what clients need to start an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
    /// Id to send back in `X-Server-Key-ID`
    pub key_id: String,
    /// Base64url SubjectPublicKeyInfo DER
    pub public_key: String,
}

/// Counters describing exchange activity
#[derive(Debug, Default)]
pub struct ExchangeStats {
    lookups: AtomicU64,
    computations: AtomicU64,
    rotations: AtomicU64,
    failed_rotations: AtomicU64,
}

/// Point-in-time copy of [`ExchangeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExchangeStatsSnapshot {
    pub lookups: u64,
    pub computations: u64,
    pub cache_hits: u64,
    pub rotations: u64,
    pub failed_rotations: u64,
    pub cached_secrets: usize,
}

impl ExchangeStats {
    pub(crate) fn record_rotation(&self, succeeded: bool) {
        if succeeded {
            self.rotations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_rotations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Builder for [`SecretExchange`]
pub struct SecretExchangeBuilder {
    agreement: Option<Arc<dyn KeyAgreement>>,
    algorithm: AgreementAlgorithm,
    retained_key_pairs: usize,
    cache_max_entries: usize,
    cache_time_to_idle: Duration,
}

impl SecretExchangeBuilder {
    /// Curve used for server key pairs (default: SM2)
    pub fn algorithm(mut self, algorithm: AgreementAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Use a custom agreement strategy instead of a built-in curve
    pub fn agreement(mut self, agreement: Arc<dyn KeyAgreement>) -> Self {
        self.agreement = Some(agreement);
        self
    }

    pub fn retained_key_pairs(mut self, count: usize) -> Self {
        self.retained_key_pairs = count;
        self
    }

    pub fn cache_max_entries(mut self, max_entries: usize) -> Self {
        self.cache_max_entries = max_entries;
        self
    }

    pub fn cache_time_to_idle(mut self, idle: Duration) -> Self {
        self.cache_time_to_idle = idle;
        self
    }

    /// Build the exchange and generate the first server key pair.
    ///
    /// Fails if the first key pair cannot be generated: without it no
    /// encrypted route can ever succeed.
    pub fn build(self) -> Result<SecretExchange, CryptoError> {
        let agreement = self
            .agreement
            .unwrap_or_else(|| self.algorithm.strategy());
        let cache = Arc::new(SharedSecretCache::new(
            self.cache_max_entries,
            self.cache_time_to_idle,
        ));
        let key_pairs = Arc::new(KeyPairManager::initialized(
            agreement.clone(),
            self.retained_key_pairs,
            cache.clone(),
        )?);

        let stats = ExchangeStats::default();
        stats.record_rotation(true);
        Ok(SecretExchange {
            agreement,
            key_pairs,
            cache,
            cache_time_to_idle: self.cache_time_to_idle,
            stats,
        })
    }
}

/// Server side of the key agreement
pub struct SecretExchange {
    agreement: Arc<dyn KeyAgreement>,
    key_pairs: Arc<KeyPairManager>,
    cache: Arc<SharedSecretCache>,
    cache_time_to_idle: Duration,
    stats: ExchangeStats,
}

impl SecretExchange {
    pub fn builder() -> SecretExchangeBuilder {
        SecretExchangeBuilder {
            agreement: None,
            algorithm: AgreementAlgorithm::Sm2,
            retained_key_pairs: DEFAULT_RETAINED_KEY_PAIRS,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            cache_time_to_idle: DEFAULT_TIME_TO_IDLE,
        }
    }

    pub fn algorithm(&self) -> AgreementAlgorithm {
        self.agreement.algorithm()
    }

    /// Current key id and base64url public key
    pub fn public_key_info(&self) -> Result<PublicKeyInfo, CryptoError> {
        let (key_id, public_key) = self.key_pairs.current_public_key()?;
        Ok(PublicKeyInfo {
            key_id: key_id.to_string(),
            public_key: encode_b64url(&public_key),
        })
    }

    /// Shared secret between the server key `server_key_id` and the peer's
    /// base64url public key, served from cache when possible.
    ///
    /// # Errors
    ///
    /// - `InvalidPeerKey` if the peer key is blank, not base64url, or not a valid point
    /// - `UnknownServerKey` if `server_key_id` is outside the retention window
    pub fn shared_secret(
        &self,
        peer_public_key_b64: &str,
        server_key_id: &str,
    ) -> Result<SharedSecret, CryptoError> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let peer_public_key_b64 = peer_public_key_b64.trim();
        if peer_public_key_b64.is_empty() {
            return Err(CryptoError::invalid_peer_key("public key is blank"));
        }
        let key_id: KeyId = server_key_id.parse()?;
        // Checked before the cache so an evicted key id can never be served
        let private_key = self.key_pairs.private_key_for(key_id)?;

        self.cache.get_or_compute(key_id, peer_public_key_b64, || {
            self.stats.computations.fetch_add(1, Ordering::Relaxed);
            let peer_public_key = decode_b64url(peer_public_key_b64)?;
            let secret = self.agreement.agree(&private_key, &peer_public_key)?;
            debug!(
                "Derived shared secret for server key {} ({} bytes)",
                key_id,
                secret.len()
            );
            Ok(secret)
        })
    }

    /// Rotate the server key pair now
    pub fn rotate(&self) -> Result<KeyId, CryptoError> {
        let result = self.key_pairs.rotate();
        self.stats.record_rotation(result.is_ok());
        result
    }

    /// Start the background rotation schedule. Idle cache entries are swept
    /// on the same task once per idle window.
    pub fn spawn_rotation(self: &Arc<Self>, interval: Duration) -> RotationTask {
        RotationTask::spawn(self.clone(), interval, self.cache_time_to_idle)
    }

    pub fn key_pairs(&self) -> &KeyPairManager {
        &self.key_pairs
    }

    pub fn cache(&self) -> &SharedSecretCache {
        &self.cache
    }

    pub fn stats(&self) -> ExchangeStatsSnapshot {
        let cache = self.cache.stats();
        ExchangeStatsSnapshot {
            lookups: self.stats.lookups.load(Ordering::Relaxed),
            computations: self.stats.computations.load(Ordering::Relaxed),
            cache_hits: cache.hits,
            rotations: self.stats.rotations.load(Ordering::Relaxed),
            failed_rotations: self.stats.failed_rotations.load(Ordering::Relaxed),
            cached_secrets: cache.entries,
        }
    }
}
