// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Node configuration
//!
//! Defaults, overlaid by a TOML file (`[cipher]` table) and then by
//! `HTTP_CIPHER_*` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::{AgreementAlgorithm, KeyNormalization, SymmetricAlgorithm};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub listen_addr: String,
    /// `sm2`, `x25519` or `secp256k1`
    pub agreement: String,
    /// Transformation name, e.g. `SM4/CBC/PKCS7Padding`
    pub cipher: String,
    /// `truncate` or `hkdf-sha256`
    pub key_normalization: String,
    pub rotation_interval_secs: u64,
    pub retained_key_pairs: usize,
    pub secret_cache_max_entries: usize,
    pub secret_cache_idle_secs: u64,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            agreement: "sm2".to_string(),
            cipher: "SM4/CBC/PKCS7Padding".to_string(),
            key_normalization: "truncate".to_string(),
            rotation_interval_secs: 5 * 60 * 60,
            retained_key_pairs: 2,
            secret_cache_max_entries: 1 << 20,
            secret_cache_idle_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cipher: CipherConfig,
}

impl CipherConfig {
    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read the `[cipher]` table of a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;
        Ok(file.cipher)
    }

    /// Overlay `HTTP_CIPHER_*` environment variables; unparsable numbers are ignored
    pub fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|value| !value.trim().is_empty())
        }
        fn number<T: FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|value| value.trim().parse().ok())
        }

        if let Some(value) = var("HTTP_CIPHER_LISTEN_ADDR") {
            self.listen_addr = value;
        }
        if let Some(value) = var("HTTP_CIPHER_AGREEMENT") {
            self.agreement = value;
        }
        if let Some(value) = var("HTTP_CIPHER_ALGORITHM") {
            self.cipher = value;
        }
        if let Some(value) = var("HTTP_CIPHER_KEY_NORMALIZATION") {
            self.key_normalization = value;
        }
        if let Some(value) = number("HTTP_CIPHER_ROTATION_SECS") {
            self.rotation_interval_secs = value;
        }
        if let Some(value) = number("HTTP_CIPHER_RETAINED_KEYS") {
            self.retained_key_pairs = value;
        }
        if let Some(value) = number("HTTP_CIPHER_CACHE_MAX_ENTRIES") {
            self.secret_cache_max_entries = value;
        }
        if let Some(value) = number("HTTP_CIPHER_CACHE_IDLE_SECS") {
            self.secret_cache_idle_secs = value;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.socket_addr()?;
        self.agreement_algorithm().map_err(|e| e.to_string())?;
        self.symmetric_algorithm().map_err(|e| e.to_string())?;
        self.normalization().map_err(|e| e.to_string())?;

        if self.rotation_interval_secs == 0 {
            return Err("rotation_interval_secs must be greater than 0".to_string());
        }
        if self.retained_key_pairs == 0 {
            return Err("retained_key_pairs must be at least 1".to_string());
        }
        if self.secret_cache_max_entries == 0 {
            return Err("secret_cache_max_entries must be greater than 0".to_string());
        }
        if self.secret_cache_idle_secs == 0 {
            return Err("secret_cache_idle_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        self.listen_addr
            .parse()
            .map_err(|e| format!("Invalid listen_addr '{}': {}", self.listen_addr, e))
    }

    pub fn agreement_algorithm(&self) -> Result<AgreementAlgorithm, crate::crypto::CryptoError> {
        self.agreement.parse()
    }

    pub fn symmetric_algorithm(&self) -> Result<SymmetricAlgorithm, crate::crypto::CryptoError> {
        self.cipher.parse()
    }

    pub fn normalization(&self) -> Result<KeyNormalization, crate::crypto::CryptoError> {
        self.key_normalization.parse()
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn secret_cache_idle(&self) -> Duration {
        Duration::from_secs(self.secret_cache_idle_secs)
    }
}
