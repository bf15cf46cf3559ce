// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Shared secret cache under concurrent load

use fabstir_http_cipher::crypto::{CryptoError, KeyId, SharedSecretCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn key_id() -> KeyId {
    "1700000000000".parse().unwrap()
}

#[test]
fn test_concurrent_lookups_compute_once() {
    let cache = Arc::new(SharedSecretCache::new(1024, Duration::from_secs(30)));
    let computations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(32));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let cache = cache.clone();
            let computations = computations.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute(key_id(), "peer-a", || {
                        computations.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(vec![0xabu8; 32])
                    })
                    .unwrap()
            })
        })
        .collect();

    let secrets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    assert!(secrets.iter().all(|s| s.as_bytes() == [0xabu8; 32]));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_distinct_peers_compute_independently() {
    let cache = SharedSecretCache::new(1024, Duration::from_secs(30));
    let computations = AtomicUsize::new(0);

    for peer in ["peer-a", "peer-b", "peer-a", "peer-c", "peer-b"] {
        cache
            .get_or_compute(key_id(), peer, || {
                computations.fetch_add(1, Ordering::SeqCst);
                Ok(peer.as_bytes().to_vec())
            })
            .unwrap();
    }
    assert_eq!(computations.load(Ordering::SeqCst), 3);
    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 3);
}

#[test]
fn test_failed_computation_is_retried() {
    let cache = SharedSecretCache::new(16, Duration::from_secs(30));
    let err = cache
        .get_or_compute(key_id(), "peer", || -> Result<Vec<u8>, CryptoError> {
            Err(CryptoError::KeyGeneration {
                reason: "transient".to_string(),
            })
        })
        .unwrap_err();
    assert!(matches!(err, CryptoError::KeyGeneration { .. }));

    let secret = cache
        .get_or_compute(key_id(), "peer", || Ok(vec![1u8; 32]))
        .unwrap();
    assert_eq!(secret.as_bytes(), [1u8; 32]);
}

#[test]
fn test_idle_entries_are_purged() {
    let cache = SharedSecretCache::new(16, Duration::from_millis(20));
    cache
        .get_or_compute(key_id(), "peer", || Ok(vec![1u8; 32]))
        .unwrap();
    assert_eq!(cache.len(), 1);

    thread::sleep(Duration::from_millis(60));
    assert_eq!(cache.purge_expired(), 1);
    assert!(cache.is_empty());
}
