// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod api;
pub mod cli;
pub mod config;
pub mod crypto;

// Re-export main types
pub use api::{create_app, AppState, CipherLayer, EncryptionPolicy, RoutePolicies};
pub use config::CipherConfig;
pub use crypto::{
    AgreementAlgorithm, CbcCipherFactory, ClientSession, CryptoError, SecretExchange,
    SymmetricAlgorithm,
};
