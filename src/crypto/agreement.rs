// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Key Agreement Strategies
//!
//! Key agreement is defined abstractly as "given a private key and a peer
//! public key, produce a shared secret byte string". Each supported curve is
//! one [`KeyAgreement`] implementation, selected by configuration through
//! [`AgreementAlgorithm`].
//!
//! ## Supported curves
//!
//! - **sm2**: ECDH over sm2p256v1 (default)
//! - **x25519**: Diffie-Hellman over Curve25519
//! - **secp256k1**: ECDH over secp256k1
//!
//! ## Encodings
//!
//! Public keys are produced as X.509 SubjectPublicKeyInfo DER. Peer keys are
//! accepted as SubjectPublicKeyInfo DER or as the bare point (SEC1 for the
//! Weierstrass curves, 32 raw bytes for X25519). The shared secret is the raw
//! agreed value: the x-coordinate for the Weierstrass curves, the Montgomery
//! u-coordinate for X25519. No KDF is applied here.

use elliptic_curve::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::error::CryptoError;

/// Attempts at drawing a valid scalar before giving up
const MAX_SCALAR_ATTEMPTS: usize = 8;

/// DER prefix of an X25519 SubjectPublicKeyInfo (OID 1.3.101.110)
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// X25519 key length in bytes
pub const X25519_KEY_LEN: usize = 32;

/// Curve selected for server key pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgreementAlgorithm {
    Sm2,
    X25519,
    Secp256k1,
}

impl AgreementAlgorithm {
    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        match self {
            AgreementAlgorithm::Sm2 => "sm2",
            AgreementAlgorithm::X25519 => "x25519",
            AgreementAlgorithm::Secp256k1 => "secp256k1",
        }
    }

    /// Build the strategy implementing this curve
    pub fn strategy(&self) -> Arc<dyn KeyAgreement> {
        match self {
            AgreementAlgorithm::Sm2 => Arc::new(Sm2Agreement),
            AgreementAlgorithm::X25519 => Arc::new(X25519Agreement),
            AgreementAlgorithm::Secp256k1 => Arc::new(Secp256k1Agreement),
        }
    }
}

impl fmt::Display for AgreementAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgreementAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sm2" | "sm2p256v1" => Ok(AgreementAlgorithm::Sm2),
            "x25519" => Ok(AgreementAlgorithm::X25519),
            "secp256k1" | "k256" => Ok(AgreementAlgorithm::Secp256k1),
            _ => Err(CryptoError::UnsupportedAlgorithm {
                name: s.to_string(),
            }),
        }
    }
}

/// Raw private scalar. Zeroed on drop and redacted from `Debug`.
#[derive(Clone)]
pub struct PrivateKey(Zeroizing<Vec<u8>>);

impl PrivateKey {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        PrivateKey(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// Freshly generated key pair, public half already SPKI-encoded
#[derive(Debug, Clone)]
pub struct AgreementKeyPair {
    public_key: Vec<u8>,
    private_key: PrivateKey,
}

impl AgreementKeyPair {
    /// SubjectPublicKeyInfo DER of the public key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, PrivateKey) {
        (self.public_key, self.private_key)
    }
}

/// A key agreement primitive over one curve
pub trait KeyAgreement: Send + Sync {
    /// Which curve this strategy implements
    fn algorithm(&self) -> AgreementAlgorithm;

    /// Generate a new key pair from the OS entropy source
    fn generate_key_pair(&self) -> Result<AgreementKeyPair, CryptoError>;

    /// Compute the shared secret between `private_key` and the peer's public key
    fn agree(
        &self,
        private_key: &PrivateKey,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Draw 32 random bytes until `parse` accepts them as a scalar
fn random_secret<K>(parse: impl Fn(&[u8]) -> Option<K>) -> Result<K, CryptoError> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    for _ in 0..MAX_SCALAR_ATTEMPTS {
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| CryptoError::key_generation(format!("entropy source failed: {}", e)))?;
        if let Some(key) = parse(&bytes[..]) {
            return Ok(key);
        }
    }
    Err(CryptoError::key_generation(
        "no valid scalar after repeated attempts",
    ))
}

fn spki_error(e: impl fmt::Display) -> CryptoError {
    CryptoError::key_generation(format!("SubjectPublicKeyInfo encoding failed: {}", e))
}

/// ECDH over the SM2 recommended curve (sm2p256v1)
#[derive(Debug, Default, Clone, Copy)]
pub struct Sm2Agreement;

impl KeyAgreement for Sm2Agreement {
    fn algorithm(&self) -> AgreementAlgorithm {
        AgreementAlgorithm::Sm2
    }

    fn generate_key_pair(&self) -> Result<AgreementKeyPair, CryptoError> {
        let secret = random_secret(|bytes| sm2::SecretKey::from_slice(bytes).ok())?;
        let public_key = secret
            .public_key()
            .to_public_key_der()
            .map_err(spki_error)?
            .as_bytes()
            .to_vec();
        Ok(AgreementKeyPair {
            public_key,
            private_key: PrivateKey::from_bytes(secret.to_bytes().to_vec()),
        })
    }

    fn agree(
        &self,
        private_key: &PrivateKey,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let secret = sm2::SecretKey::from_slice(private_key.as_bytes())
            .map_err(|_| CryptoError::key_generation("stored SM2 private key is invalid"))?;
        let peer = sm2::PublicKey::from_public_key_der(peer_public_key)
            .or_else(|_| sm2::PublicKey::from_sec1_bytes(peer_public_key))
            .map_err(|_| CryptoError::invalid_peer_key("not an SM2 public key"))?;

        let shared = elliptic_curve::ecdh::diffie_hellman(
            secret.to_nonzero_scalar(),
            peer.as_affine(),
        );
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

/// ECDH over secp256k1
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Agreement;

impl KeyAgreement for Secp256k1Agreement {
    fn algorithm(&self) -> AgreementAlgorithm {
        AgreementAlgorithm::Secp256k1
    }

    fn generate_key_pair(&self) -> Result<AgreementKeyPair, CryptoError> {
        let secret = random_secret(|bytes| k256::SecretKey::from_slice(bytes).ok())?;
        let public_key = secret
            .public_key()
            .to_public_key_der()
            .map_err(spki_error)?
            .as_bytes()
            .to_vec();
        Ok(AgreementKeyPair {
            public_key,
            private_key: PrivateKey::from_bytes(secret.to_bytes().to_vec()),
        })
    }

    fn agree(
        &self,
        private_key: &PrivateKey,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let secret = k256::SecretKey::from_slice(private_key.as_bytes())
            .map_err(|_| CryptoError::key_generation("stored secp256k1 private key is invalid"))?;
        // Supports SPKI DER as well as compressed (33 bytes) and uncompressed (65 bytes) points
        let peer = k256::PublicKey::from_public_key_der(peer_public_key)
            .or_else(|_| k256::PublicKey::from_sec1_bytes(peer_public_key))
            .map_err(|_| CryptoError::invalid_peer_key("not a secp256k1 public key"))?;

        let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

/// Diffie-Hellman over Curve25519
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519Agreement;

impl X25519Agreement {
    fn encode_public(public: &x25519_dalek::PublicKey) -> Vec<u8> {
        let mut der = Vec::with_capacity(X25519_SPKI_PREFIX.len() + X25519_KEY_LEN);
        der.extend_from_slice(&X25519_SPKI_PREFIX);
        der.extend_from_slice(public.as_bytes());
        der
    }

    fn decode_public(bytes: &[u8]) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let raw = match bytes.len() {
            X25519_KEY_LEN => bytes,
            n if n == X25519_SPKI_PREFIX.len() + X25519_KEY_LEN
                && bytes.starts_with(&X25519_SPKI_PREFIX) =>
            {
                &bytes[X25519_SPKI_PREFIX.len()..]
            }
            n => {
                return Err(CryptoError::invalid_peer_key(format!(
                    "expected 32-byte X25519 key or 44-byte SubjectPublicKeyInfo, got {} bytes",
                    n
                )))
            }
        };
        let mut point = [0u8; X25519_KEY_LEN];
        point.copy_from_slice(raw);
        Ok(x25519_dalek::PublicKey::from(point))
    }
}

impl KeyAgreement for X25519Agreement {
    fn algorithm(&self) -> AgreementAlgorithm {
        AgreementAlgorithm::X25519
    }

    fn generate_key_pair(&self) -> Result<AgreementKeyPair, CryptoError> {
        let secret = random_secret(|bytes| {
            let mut scalar = [0u8; X25519_KEY_LEN];
            scalar.copy_from_slice(bytes);
            Some(x25519_dalek::StaticSecret::from(scalar))
        })?;
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(AgreementKeyPair {
            public_key: Self::encode_public(&public),
            private_key: PrivateKey::from_bytes(secret.to_bytes().to_vec()),
        })
    }

    fn agree(
        &self,
        private_key: &PrivateKey,
        peer_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let scalar: [u8; X25519_KEY_LEN] = private_key
            .as_bytes()
            .try_into()
            .map_err(|_| CryptoError::key_generation("stored X25519 private key is invalid"))?;
        let secret = x25519_dalek::StaticSecret::from(scalar);
        let peer = Self::decode_public(peer_public_key)?;

        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::invalid_peer_key("low-order X25519 point"));
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}
