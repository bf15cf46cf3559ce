// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Symmetric Body Ciphers
//!
//! Builds incremental CBC ciphers from an agreed shared secret and a
//! client-supplied IV. All algorithms use a 16-byte block and PKCS#7 padding.
//!
//! **Key/IV normalisation**: the agreed secret is 32 bytes for every curve we
//! support, which rarely equals the symmetric key size. By default the secret
//! is truncated or zero-padded to the key length ([`KeyNormalization::Truncate`]).
//! [`KeyNormalization::HkdfSha256`] derives the key with HKDF-SHA256 instead,
//! keeping all of the secret's entropy. The IV is always truncated or
//! zero-padded to the block size.
//!
//! A [`BodyCipher`] is fed with [`update`](BodyCipher::update) as body chunks
//! arrive and closed with [`finish`](BodyCipher::finish), which emits the
//! padding block (encrypt) or checks and strips it (decrypt). It never holds
//! more than one block plus the current chunk.

use aes::{Aes128, Aes256};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use sha2::Sha256;
use sm4::Sm4;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use super::error::CryptoError;

/// Block size shared by SM4 and AES
pub const BLOCK_SIZE: usize = 16;

/// HKDF `info` label for body keys
const HKDF_INFO: &[u8] = b"fabstir-http-cipher body key";

/// Direction of a cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

/// Supported `<cipher>/<mode>/<padding>` combinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymmetricAlgorithm {
    #[default]
    Sm4Cbc,
    Aes128Cbc,
    Aes256Cbc,
}

impl SymmetricAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            SymmetricAlgorithm::Sm4Cbc => "SM4/CBC/PKCS7Padding",
            SymmetricAlgorithm::Aes128Cbc => "AES/CBC/PKCS7Padding",
            SymmetricAlgorithm::Aes256Cbc => "AES-256/CBC/PKCS7Padding",
        }
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            SymmetricAlgorithm::Sm4Cbc | SymmetricAlgorithm::Aes128Cbc => 16,
            SymmetricAlgorithm::Aes256Cbc => 32,
        }
    }

    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
}

impl fmt::Display for SymmetricAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SymmetricAlgorithm {
    type Err = CryptoError;

    /// Accepts the transformation name, case-insensitively. `PKCS5Padding`
    /// is treated as `PKCS7Padding` (identical for 16-byte blocks).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || CryptoError::UnsupportedAlgorithm {
            name: s.to_string(),
        };

        let parts: Vec<String> = s
            .trim()
            .split('/')
            .map(|part| part.trim().to_ascii_uppercase())
            .collect();
        let [cipher, mode, padding] = parts.as_slice() else {
            return Err(unsupported());
        };
        if mode.as_str() != "CBC" || !matches!(padding.as_str(), "PKCS7PADDING" | "PKCS5PADDING") {
            return Err(unsupported());
        }
        match cipher.as_str() {
            "SM4" => Ok(SymmetricAlgorithm::Sm4Cbc),
            "AES" | "AES-128" | "AES128" => Ok(SymmetricAlgorithm::Aes128Cbc),
            "AES-256" | "AES256" => Ok(SymmetricAlgorithm::Aes256Cbc),
            _ => Err(unsupported()),
        }
    }
}

/// How the raw shared secret becomes a symmetric key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyNormalization {
    /// Truncate or zero-pad to the key length
    #[default]
    Truncate,
    /// HKDF-SHA256 with no salt
    HkdfSha256,
}

impl KeyNormalization {
    pub fn name(&self) -> &'static str {
        match self {
            KeyNormalization::Truncate => "truncate",
            KeyNormalization::HkdfSha256 => "hkdf-sha256",
        }
    }

    /// Derive a key of `len` bytes from `secret`
    pub fn derive_key(&self, secret: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            KeyNormalization::Truncate => Ok(normalize(secret, len)),
            KeyNormalization::HkdfSha256 => {
                let hkdf = Hkdf::<Sha256>::new(None, secret);
                let mut key = Zeroizing::new(vec![0u8; len]);
                hkdf.expand(HKDF_INFO, &mut key)
                    .map_err(|e| CryptoError::key_generation(format!("HKDF expand failed: {}", e)))?;
                Ok(key)
            }
        }
    }
}

impl fmt::Display for KeyNormalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyNormalization {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" | "zero-pad" => Ok(KeyNormalization::Truncate),
            "hkdf-sha256" | "hkdf" => Ok(KeyNormalization::HkdfSha256),
            _ => Err(CryptoError::UnsupportedAlgorithm {
                name: s.to_string(),
            }),
        }
    }
}

/// Truncate `input` to `len` bytes, or zero-extend it when shorter
pub fn normalize(input: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    let n = input.len().min(len);
    out[..n].copy_from_slice(&input[..n]);
    out
}

/// Creates ciphers for request and response bodies
pub trait CipherFactory: Send + Sync {
    fn algorithm(&self) -> SymmetricAlgorithm;

    /// Build a cipher for `mode` from the raw shared secret and raw IV
    fn create_cipher(
        &self,
        mode: CipherMode,
        secret: &[u8],
        iv: &[u8],
    ) -> Result<BodyCipher, CryptoError>;
}

/// [`CipherFactory`] for the CBC algorithms
#[derive(Debug, Clone, Copy, Default)]
pub struct CbcCipherFactory {
    algorithm: SymmetricAlgorithm,
    normalization: KeyNormalization,
}

impl CbcCipherFactory {
    pub fn new(algorithm: SymmetricAlgorithm) -> Self {
        Self {
            algorithm,
            normalization: KeyNormalization::default(),
        }
    }

    /// Factory for a transformation name such as `SM4/CBC/PKCS7Padding`
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        Ok(Self::new(name.parse()?))
    }

    pub fn with_normalization(mut self, normalization: KeyNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn normalization(&self) -> KeyNormalization {
        self.normalization
    }
}

impl CipherFactory for CbcCipherFactory {
    fn algorithm(&self) -> SymmetricAlgorithm {
        self.algorithm
    }

    fn create_cipher(
        &self,
        mode: CipherMode,
        secret: &[u8],
        iv: &[u8],
    ) -> Result<BodyCipher, CryptoError> {
        let key = self
            .normalization
            .derive_key(secret, self.algorithm.key_len())?;
        let iv = normalize(iv, BLOCK_SIZE);
        let engine = BlockEngine::new(self.algorithm, mode, &key, &iv)?;
        Ok(BodyCipher::new(mode, engine))
    }
}

enum BlockEngine {
    Sm4Encrypt(cbc::Encryptor<Sm4>),
    Sm4Decrypt(cbc::Decryptor<Sm4>),
    Aes128Encrypt(cbc::Encryptor<Aes128>),
    Aes128Decrypt(cbc::Decryptor<Aes128>),
    Aes256Encrypt(cbc::Encryptor<Aes256>),
    Aes256Decrypt(cbc::Decryptor<Aes256>),
}

macro_rules! encrypt_blocks {
    ($cipher:expr, $data:expr) => {
        for block in $data.chunks_exact_mut(BLOCK_SIZE) {
            $cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    };
}

macro_rules! decrypt_blocks {
    ($cipher:expr, $data:expr) => {
        for block in $data.chunks_exact_mut(BLOCK_SIZE) {
            $cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    };
}

impl BlockEngine {
    fn new(
        algorithm: SymmetricAlgorithm,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Self, CryptoError> {
        let invalid = |e: cbc::cipher::InvalidLength| {
            CryptoError::cipher_io(format!("{} key/IV rejected: {}", algorithm, e))
        };
        let engine = match (algorithm, mode) {
            (SymmetricAlgorithm::Sm4Cbc, CipherMode::Encrypt) => {
                BlockEngine::Sm4Encrypt(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (SymmetricAlgorithm::Sm4Cbc, CipherMode::Decrypt) => {
                BlockEngine::Sm4Decrypt(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (SymmetricAlgorithm::Aes128Cbc, CipherMode::Encrypt) => BlockEngine::Aes128Encrypt(
                cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
            (SymmetricAlgorithm::Aes128Cbc, CipherMode::Decrypt) => BlockEngine::Aes128Decrypt(
                cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
            (SymmetricAlgorithm::Aes256Cbc, CipherMode::Encrypt) => BlockEngine::Aes256Encrypt(
                cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
            (SymmetricAlgorithm::Aes256Cbc, CipherMode::Decrypt) => BlockEngine::Aes256Decrypt(
                cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
        };
        Ok(engine)
    }

    /// Transform whole blocks in place. `data.len()` must be a multiple of the block size.
    fn process(&mut self, data: &mut [u8]) {
        match self {
            BlockEngine::Sm4Encrypt(c) => encrypt_blocks!(c, data),
            BlockEngine::Sm4Decrypt(c) => decrypt_blocks!(c, data),
            BlockEngine::Aes128Encrypt(c) => encrypt_blocks!(c, data),
            BlockEngine::Aes128Decrypt(c) => decrypt_blocks!(c, data),
            BlockEngine::Aes256Encrypt(c) => encrypt_blocks!(c, data),
            BlockEngine::Aes256Decrypt(c) => decrypt_blocks!(c, data),
        }
    }
}

/// Incremental cipher for one request or response body.
///
/// Decryption of an empty body yields an empty body; any other ciphertext
/// must be a whole number of blocks with valid PKCS#7 padding.
pub struct BodyCipher {
    mode: CipherMode,
    engine: BlockEngine,
    pending: Zeroizing<Vec<u8>>,
    seen_input: bool,
    finished: bool,
}

impl BodyCipher {
    fn new(mode: CipherMode, engine: BlockEngine) -> Self {
        Self {
            mode,
            engine,
            pending: Zeroizing::new(Vec::with_capacity(BLOCK_SIZE * 2)),
            seen_input: false,
            finished: false,
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Transform the next chunk. Output may lag input by up to one block.
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Err(CryptoError::cipher_io("cipher already finalized"));
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }
        self.seen_input = true;
        self.pending.extend_from_slice(input);

        let mut ready = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        // Keep the last block back when decrypting: it may carry the padding
        if self.mode == CipherMode::Decrypt && ready == self.pending.len() {
            ready = ready.saturating_sub(BLOCK_SIZE);
        }
        if ready == 0 {
            return Ok(Vec::new());
        }

        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        self.engine.process(&mut out);
        Ok(out)
    }

    /// Emit the final block. Runs once; later calls return an empty buffer.
    pub fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        match self.mode {
            CipherMode::Encrypt => {
                let pad = BLOCK_SIZE - self.pending.len() % BLOCK_SIZE;
                let mut out: Vec<u8> = self.pending.drain(..).collect();
                out.resize(out.len() + pad, pad as u8);
                self.engine.process(&mut out);
                Ok(out)
            }
            CipherMode::Decrypt => {
                if !self.seen_input {
                    return Ok(Vec::new());
                }
                if self.pending.len() != BLOCK_SIZE {
                    self.pending.clear();
                    return Err(CryptoError::cipher_io(
                        "ciphertext length is not a multiple of the block size",
                    ));
                }
                let mut out: Vec<u8> = self.pending.drain(..).collect();
                self.engine.process(&mut out);
                let pad = out[BLOCK_SIZE - 1] as usize;
                let valid = (1..=BLOCK_SIZE).contains(&pad)
                    && out[BLOCK_SIZE - pad..].iter().all(|&b| b as usize == pad);
                if !valid {
                    return Err(CryptoError::cipher_io("bad padding"));
                }
                out.truncate(BLOCK_SIZE - pad);
                Ok(out)
            }
        }
    }
}

impl fmt::Debug for BodyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyCipher")
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
