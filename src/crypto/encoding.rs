// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Base64url codec for exchange headers and published keys.
//!
//! Keys are published padded; decoding accepts both padded and unpadded
//! input since browser clients commonly strip the `=` suffix.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    DecodeError, Engine,
};
use sha2::{Digest, Sha256};

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as padded base64url
pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_LENIENT.encode(bytes)
}

/// Decode base64url, with or without padding
pub fn decode_b64url(value: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_LENIENT.decode(value.trim())
}

/// Short, log-safe fingerprint of a public key (first 8 bytes of SHA-256, hex)
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}
