// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::CipherConfig;
use crate::crypto::{CbcCipherFactory, SecretExchange};

/// HTTP body-encryption node
#[derive(Parser, Debug)]
#[command(name = "http-cipher-node")]
#[command(version)]
#[command(about = "Serves routes with key-agreement based body encryption", long_about = None)]
pub struct Cli {
    /// TOML file with a [cipher] table
    #[arg(long, env = "HTTP_CIPHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Key agreement curve: sm2, x25519 or secp256k1
    #[arg(long)]
    pub agreement: Option<String>,

    /// Body cipher, e.g. SM4/CBC/PKCS7Padding
    #[arg(long)]
    pub cipher: Option<String>,
}

impl Cli {
    /// Defaults, then the config file, then env vars, then flags
    pub fn load_config(&self) -> Result<CipherConfig> {
        let mut config = match &self.config {
            Some(path) => CipherConfig::from_file(path)?,
            None => CipherConfig::default(),
        };
        config.apply_env();

        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if let Some(agreement) = &self.agreement {
            config.agreement = agreement.clone();
        }
        if let Some(cipher) = &self.cipher {
            config.cipher = cipher.clone();
        }

        config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

/// Build the exchange and cipher factory described by `config`
pub fn build_components(config: &CipherConfig) -> Result<(Arc<SecretExchange>, CbcCipherFactory)> {
    let exchange = SecretExchange::builder()
        .algorithm(config.agreement_algorithm()?)
        .retained_key_pairs(config.retained_key_pairs)
        .cache_max_entries(config.secret_cache_max_entries)
        .cache_time_to_idle(config.secret_cache_idle())
        .build()?;
    let factory = CbcCipherFactory::new(config.symmetric_algorithm()?)
        .with_normalization(config.normalization()?);
    Ok((Arc::new(exchange), factory))
}
