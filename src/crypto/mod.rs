// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Body Encryption Core
//!
//! Key agreement, key rotation and streaming body ciphers used by the HTTP
//! cipher middleware:
//!
//! - **Agreement**: pluggable ECDH strategies (SM2, X25519, secp256k1)
//! - **Key pairs**: rotating server key pairs with a two-generation retention window
//! - **Secret cache**: single-flight memoization of agreed secrets
//! - **Exchange**: the server-side entry point combining the three
//! - **Ciphers**: SM4/AES CBC with PKCS#7, fed chunk by chunk
//! - **Streams**: async and blocking adapters that never buffer a whole body
//!
//! ## Security Considerations
//!
//! - Private keys and agreed secrets live in zeroizing buffers and are never logged
//! - A rotation flushes every cached secret before the new key is published
//! - Key ids outside the retention window are rejected even if a stale cache entry exists
//!
//! ## Protocol Flow
//!
//! 1. Client fetches the current `{keyId, publicKey}` from the node
//! 2. Client generates an ephemeral key pair and agrees a secret locally
//! 3. Client sends `X-Server-Key-ID`, `X-Key` and `X-Nonce` with an encrypted body
//! 4. Node derives (or recalls) the same secret and wraps request/response bodies

pub mod agreement;
pub mod cipher;
pub mod client;
pub mod encoding;
pub mod error;
pub mod exchange;
pub mod key_pair;
pub mod rotation;
pub mod secret_cache;
pub mod stream;

pub use agreement::{AgreementAlgorithm, KeyAgreement};
pub use cipher::{
    BodyCipher, CbcCipherFactory, CipherFactory, CipherMode, KeyNormalization, SymmetricAlgorithm,
};
pub use client::ClientSession;
pub use encoding::{decode_b64url, encode_b64url};
pub use error::CryptoError;
pub use exchange::{ExchangeStatsSnapshot, PublicKeyInfo, SecretExchange};
pub use key_pair::{KeyId, KeyPairManager};
pub use rotation::RotationTask;
pub use secret_cache::{SharedSecret, SharedSecretCache};
pub use stream::{CipherReader, CipherStream, CipherWriter};
