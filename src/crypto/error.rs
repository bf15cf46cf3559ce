// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Crypto Error Types
//!
//! One error type covers the whole body-encryption path: key agreement,
//! key rotation, cipher construction and the streaming transform.
//!
//! ## Classification
//!
//! - **Client-caused** (recoverable, HTTP 400): `InvalidPeerKey`,
//!   `UnknownServerKey`, `MissingExchangeHeaders`, `InvalidNonce`,
//!   `InvalidRequestBody`
//! - **Server-side**: `NoKeyAvailable` (startup), `UnsupportedAlgorithm`
//!   (configuration), `KeyGeneration` (entropy/provider), `CipherIo`
//!   (streaming transform)
//!
//! Errors never carry key material. Reasons are short human-readable
//! strings meant for logs, not for the client.

use std::io;
use thiserror::Error;

/// Error type for key agreement and body encryption
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No server key pair has been generated yet
    #[error("No server key pair available")]
    NoKeyAvailable,

    /// The peer public key could not be decoded or is not a valid curve point
    #[error("Invalid peer public key: {reason}")]
    InvalidPeerKey {
        /// Specific failure reason
        reason: String,
    },

    /// The requested server key id is outside the retention window
    #[error("Unknown server key id: {key_id}")]
    UnknownServerKey {
        /// Key id as sent by the client
        key_id: String,
    },

    /// A route requiring encryption was called without the exchange headers
    #[error("Missing key exchange headers: {}", missing.join(", "))]
    MissingExchangeHeaders {
        /// Names of the headers that were absent
        missing: Vec<&'static str>,
    },

    /// The IV header could not be decoded
    #[error("Invalid nonce: {reason}")]
    InvalidNonce {
        /// Specific failure reason
        reason: String,
    },

    /// The requested algorithm (or mode/algorithm pairing) is not registered
    #[error("Unsupported algorithm: {name}")]
    UnsupportedAlgorithm {
        /// Name as configured
        name: String,
    },

    /// Key pair generation failed (entropy source or invalid scalar)
    #[error("Key generation failed: {reason}")]
    KeyGeneration {
        /// Specific failure reason
        reason: String,
    },

    /// The client's encrypted request body did not decrypt
    #[error("Invalid request body: {reason}")]
    InvalidRequestBody {
        /// Specific failure reason
        reason: String,
    },

    /// The streaming transform failed (I/O error, truncated ciphertext, bad padding)
    #[error("Cipher stream failed: {reason}")]
    CipherIo {
        /// Specific failure reason
        reason: String,
    },
}

impl CryptoError {
    pub(crate) fn invalid_peer_key(reason: impl Into<String>) -> Self {
        CryptoError::InvalidPeerKey {
            reason: reason.into(),
        }
    }

    pub(crate) fn key_generation(reason: impl Into<String>) -> Self {
        CryptoError::KeyGeneration {
            reason: reason.into(),
        }
    }

    pub(crate) fn cipher_io(reason: impl Into<String>) -> Self {
        CryptoError::CipherIo {
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by the client's request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CryptoError::InvalidPeerKey { .. }
                | CryptoError::UnknownServerKey { .. }
                | CryptoError::MissingExchangeHeaders { .. }
                | CryptoError::InvalidNonce { .. }
                | CryptoError::InvalidRequestBody { .. }
        )
    }

    /// HTTP status the error maps to when a request is aborted
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() {
            400
        } else {
            500
        }
    }
}

impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::invalid_peer_key(format!("base64url decode error: {}", err))
    }
}
