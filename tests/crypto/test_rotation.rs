// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Key rotation and the retention window
//!
//! Verifies that:
//! - rotate() publishes a new key id and public key
//! - The previous key id stays resolvable for one more rotation
//! - A key id two rotations old is rejected with UnknownServerKey
//! - Every rotation flushes the shared secret cache
//! - The background task rotates on schedule and stops on shutdown
//! - A failed rotation keeps the current key pair and is counted

use fabstir_http_cipher::crypto::{
    agreement::{AgreementKeyPair, PrivateKey, X25519Agreement},
    AgreementAlgorithm, ClientSession, CryptoError, KeyAgreement, SecretExchange,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// X25519 whose key generation can be switched off
#[derive(Default)]
struct FlakyAgreement {
    failing: AtomicBool,
}

impl KeyAgreement for FlakyAgreement {
    fn algorithm(&self) -> AgreementAlgorithm {
        AgreementAlgorithm::X25519
    }

    fn generate_key_pair(&self) -> Result<AgreementKeyPair, CryptoError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CryptoError::KeyGeneration {
                reason: "entropy source unavailable".to_string(),
            });
        }
        X25519Agreement.generate_key_pair()
    }

    fn agree(
        &self,
        private_key: &PrivateKey,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        X25519Agreement.agree(private_key, peer_public_key)
    }
}

fn flaky_exchange() -> (Arc<SecretExchange>, Arc<FlakyAgreement>) {
    let agreement = Arc::new(FlakyAgreement::default());
    let exchange = SecretExchange::builder()
        .agreement(agreement.clone())
        .build()
        .unwrap();
    (Arc::new(exchange), agreement)
}

fn exchange() -> SecretExchange {
    SecretExchange::builder()
        .algorithm(AgreementAlgorithm::X25519)
        .build()
        .unwrap()
}

#[test]
fn test_rotate_publishes_new_key() {
    let exchange = exchange();
    let before = exchange.public_key_info().unwrap();

    exchange.rotate().unwrap();
    let after = exchange.public_key_info().unwrap();

    assert_ne!(after.key_id, before.key_id);
    assert_ne!(after.public_key, before.public_key);
    assert!(after.key_id.parse::<u64>().unwrap() > before.key_id.parse::<u64>().unwrap());
}

#[test]
fn test_grace_period_covers_exactly_one_rotation() {
    let exchange = exchange();
    let oldest = exchange.public_key_info().unwrap();
    let client = ClientSession::establish(AgreementAlgorithm::X25519, &oldest).unwrap();

    // One rotation later the client can still finish its exchange
    exchange.rotate().unwrap();
    let secret = exchange
        .shared_secret(client.public_key_b64(), &oldest.key_id)
        .unwrap();
    assert_eq!(secret.as_bytes(), client.shared_secret());

    // Two rotations later the key pair is gone
    exchange.rotate().unwrap();
    let err = exchange
        .shared_secret(client.public_key_b64(), &oldest.key_id)
        .unwrap_err();
    assert_eq!(
        err,
        CryptoError::UnknownServerKey {
            key_id: oldest.key_id.clone()
        }
    );
    assert!(err.is_client_error());
}

#[test]
fn test_rotation_flushes_cached_secrets() {
    let exchange = exchange();
    let info = exchange.public_key_info().unwrap();
    let client = ClientSession::establish(AgreementAlgorithm::X25519, &info).unwrap();

    exchange.shared_secret(client.public_key_b64(), &info.key_id).unwrap();
    assert_eq!(exchange.stats().cached_secrets, 1);

    exchange.rotate().unwrap();
    assert_eq!(exchange.stats().cached_secrets, 0);

    // Previous key still works, but the secret is recomputed
    exchange.shared_secret(client.public_key_b64(), &info.key_id).unwrap();
    assert_eq!(exchange.stats().computations, 2);
}

#[test]
fn test_larger_retention_window() {
    let exchange = SecretExchange::builder()
        .algorithm(AgreementAlgorithm::X25519)
        .retained_key_pairs(4)
        .build()
        .unwrap();
    let first = exchange.key_pairs().current_key_id().unwrap();
    for _ in 0..3 {
        exchange.rotate().unwrap();
    }
    assert!(exchange.key_pairs().contains(first));
    exchange.rotate().unwrap();
    assert!(!exchange.key_pairs().contains(first));
    assert_eq!(exchange.key_pairs().retained_key_ids().len(), 4);
}

#[tokio::test]
async fn test_background_rotation_and_shutdown() {
    let exchange = Arc::new(exchange());
    let initial = exchange.public_key_info().unwrap().key_id;

    let task = exchange.spawn_rotation(Duration::from_millis(25));
    tokio::time::sleep(Duration::from_millis(150)).await;
    task.shutdown().await;

    let rotated = exchange.public_key_info().unwrap().key_id;
    assert_ne!(rotated, initial);
    assert!(exchange.stats().rotations >= 3);
    assert_eq!(exchange.stats().failed_rotations, 0);

    tokio::time::sleep(Duration::from_millis(75)).await;
    assert_eq!(exchange.public_key_info().unwrap().key_id, rotated);
}

#[test]
fn test_failed_rotation_keeps_current_key() {
    let (exchange, agreement) = flaky_exchange();
    let before = exchange.public_key_info().unwrap();
    let client = ClientSession::establish(AgreementAlgorithm::X25519, &before).unwrap();

    agreement.failing.store(true, Ordering::SeqCst);
    let err = exchange.rotate().unwrap_err();
    assert!(matches!(err, CryptoError::KeyGeneration { .. }));

    assert_eq!(exchange.public_key_info().unwrap(), before);
    let secret = exchange
        .shared_secret(client.public_key_b64(), &before.key_id)
        .unwrap();
    assert_eq!(secret.as_bytes(), client.shared_secret());

    let stats = exchange.stats();
    assert_eq!(stats.failed_rotations, 1);
    assert_eq!(stats.rotations, 1);

    // Recovers once key generation works again
    agreement.failing.store(false, Ordering::SeqCst);
    exchange.rotate().unwrap();
    assert_ne!(exchange.public_key_info().unwrap().key_id, before.key_id);
}

#[tokio::test]
async fn test_background_task_survives_failed_rotations() {
    let (exchange, agreement) = flaky_exchange();
    let before = exchange.public_key_info().unwrap();
    agreement.failing.store(true, Ordering::SeqCst);

    let task = exchange.spawn_rotation(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(task.is_running());
    assert!(exchange.stats().failed_rotations >= 2);
    assert_eq!(exchange.public_key_info().unwrap(), before);

    // Next tick succeeds
    agreement.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_ne!(exchange.public_key_info().unwrap().key_id, before.key_id);

    task.shutdown().await;
}
