// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Client half of the exchange
//!
//! Generates an ephemeral key pair, agrees a secret against the server's
//! published key and produces the request headers and body ciphers. Used by
//! Rust SDK callers and by the integration tests.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::agreement::AgreementAlgorithm;
use super::cipher::{BodyCipher, CbcCipherFactory, CipherFactory, CipherMode, BLOCK_SIZE};
use super::encoding::{decode_b64url, encode_b64url};
use super::error::CryptoError;
use super::exchange::PublicKeyInfo;
use crate::api::headers::{X_KEY, X_NONCE, X_SERVER_KEY_ID};

/// One client session against one server key
pub struct ClientSession {
    server_key_id: String,
    public_key_b64: String,
    shared_secret: Zeroizing<Vec<u8>>,
    factory: Arc<dyn CipherFactory>,
}

impl ClientSession {
    /// Agree a secret with the server key in `server`
    pub fn establish(
        algorithm: AgreementAlgorithm,
        server: &PublicKeyInfo,
    ) -> Result<Self, CryptoError> {
        let agreement = algorithm.strategy();
        let key_pair = agreement.generate_key_pair()?;
        let server_public_key = decode_b64url(&server.public_key)?;
        let shared_secret = agreement.agree(key_pair.private_key(), &server_public_key)?;

        Ok(Self {
            server_key_id: server.key_id.clone(),
            public_key_b64: encode_b64url(key_pair.public_key()),
            shared_secret,
            factory: Arc::new(CbcCipherFactory::default()),
        })
    }

    /// Use a different body cipher (must match the server's)
    pub fn with_cipher_factory(mut self, factory: Arc<dyn CipherFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn server_key_id(&self) -> &str {
        &self.server_key_id
    }

    /// Value for `X-Key`
    pub fn public_key_b64(&self) -> &str {
        &self.public_key_b64
    }

    pub fn shared_secret(&self) -> &[u8] {
        &self.shared_secret
    }

    /// Fresh random IV
    pub fn new_nonce() -> Result<[u8; BLOCK_SIZE], CryptoError> {
        let mut iv = [0u8; BLOCK_SIZE];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| CryptoError::key_generation(format!("entropy source failed: {}", e)))?;
        Ok(iv)
    }

    /// The three exchange headers for a request using `iv`
    pub fn headers(&self, iv: &[u8]) -> [(&'static str, String); 3] {
        [
            (X_SERVER_KEY_ID, self.server_key_id.clone()),
            (X_KEY, self.public_key_b64.clone()),
            (X_NONCE, encode_b64url(iv)),
        ]
    }

    pub fn cipher(&self, mode: CipherMode, iv: &[u8]) -> Result<BodyCipher, CryptoError> {
        self.factory.create_cipher(mode, &self.shared_secret, iv)
    }

    /// Encrypt a whole request body
    pub fn encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        one_shot(self.cipher(CipherMode::Encrypt, iv)?, plaintext)
    }

    /// Decrypt a whole response body
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        one_shot(self.cipher(CipherMode::Decrypt, iv)?, ciphertext)
    }
}

fn one_shot(mut cipher: BodyCipher, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = cipher.update(input)?;
    out.extend(cipher.finish()?);
    Ok(out)
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("server_key_id", &self.server_key_id)
            .field("public_key", &self.public_key_b64)
            .finish_non_exhaustive()
    }
}
