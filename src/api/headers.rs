// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Key-exchange request headers. Values are base64url unless noted.

/// Id of the server key pair the client agreed against (decimal, not base64)
pub const X_SERVER_KEY_ID: &str = "X-Server-Key-ID";

/// Client's ephemeral public key
pub const X_KEY: &str = "X-Key";

/// IV for the body cipher
pub const X_NONCE: &str = "X-Nonce";

/// All three, in the order they are reported when missing
pub const EXCHANGE_HEADERS: [&str; 3] = [X_SERVER_KEY_ID, X_KEY, X_NONCE];
