// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod handlers;
pub mod headers;
pub mod http_server;
pub mod middleware;
pub mod policy;
pub mod result;

pub use handlers::{Greeting, HealthResponse, IngestReceipt};
pub use http_server::{create_app, default_policies, start_server, with_cipher_layer, AppState};
pub use middleware::{CipherLayer, CipherService, MiddlewareStats, MiddlewareStatsSnapshot};
pub use policy::{EncryptionPolicy, PolicyResolver, RoutePolicies, StaticPolicy};
pub use result::{ApiResult, FailureWriter, JsonFailureWriter, ResultCode};
