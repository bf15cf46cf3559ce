// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use axum::{
    body::Bytes,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing::error;

use super::http_server::AppState;
use super::result::{ApiResult, FailureWriter, JsonFailureWriter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub agreement: String,
    pub cipher: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub retained_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub received_fields: usize,
    pub received_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Greeting {
    pub message: String,
    pub server_time: String,
}

/// `GET /security/public-key`: current `{keyId, publicKey}` in the envelope
pub async fn public_key_handler(State(state): State<AppState>) -> Response {
    match state.exchange.public_key_info() {
        Ok(info) => ApiResult::ok(info).into_response(),
        Err(e) => {
            error!("❌ No server key to publish: {}", e);
            JsonFailureWriter.write_failure(&e)
        }
    }
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let key_pairs = state.exchange.key_pairs();
    let key_id = key_pairs.current_key_id();
    Json(HealthResponse {
        status: if key_id.is_some() { "healthy" } else { "degraded" }.to_string(),
        agreement: state.exchange.algorithm().to_string(),
        cipher: state.factory.algorithm().to_string(),
        key_id: key_id.map(|id| id.to_string()),
        retained_keys: key_pairs.retained_key_ids().len(),
    })
}

/// Prometheus text exposition of exchange and middleware counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let exchange = state.exchange.stats();
    let middleware = state.middleware_stats.snapshot();

    let mut body = String::new();
    let mut counter = |name: &str, help: &str, value: u64| {
        let _ = writeln!(body, "# HELP {} {}", name, help);
        let _ = writeln!(body, "# TYPE {} counter", name);
        let _ = writeln!(body, "{} {}", name, value);
    };
    counter(
        "http_cipher_secret_lookups_total",
        "Shared secret lookups",
        exchange.lookups,
    );
    counter(
        "http_cipher_secret_computations_total",
        "Key agreement computations",
        exchange.computations,
    );
    counter(
        "http_cipher_secret_cache_hits_total",
        "Shared secret cache hits",
        exchange.cache_hits,
    );
    counter(
        "http_cipher_key_rotations_total",
        "Successful key rotations",
        exchange.rotations,
    );
    counter(
        "http_cipher_key_rotation_failures_total",
        "Failed key rotations",
        exchange.failed_rotations,
    );
    counter(
        "http_cipher_requests_passthrough_total",
        "Requests forwarded without encryption",
        middleware.passthrough,
    );
    counter(
        "http_cipher_requests_wrapped_total",
        "Requests with encrypted bodies",
        middleware.wrapped,
    );
    counter(
        "http_cipher_requests_aborted_total",
        "Requests aborted by the cipher layer",
        middleware.aborted,
    );
    let _ = writeln!(body, "# HELP http_cipher_cached_secrets Cached shared secrets");
    let _ = writeln!(body, "# TYPE http_cipher_cached_secrets gauge");
    let _ = writeln!(body, "http_cipher_cached_secrets {}", exchange.cached_secrets);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// `POST /demo/echo`: returns the (decrypted) request body as is
pub async fn echo_handler(body: Bytes) -> Bytes {
    body
}

/// `POST /demo/ingest`: accepts an encrypted JSON document, answers in plaintext
pub async fn ingest_handler(Json(document): Json<serde_json::Value>) -> ApiResult<IngestReceipt> {
    let received_fields = document.as_object().map(|fields| fields.len()).unwrap_or(0);
    ApiResult::ok(IngestReceipt {
        received_fields,
        received_at: Utc::now().to_rfc3339(),
    })
}

/// `GET /demo/greeting`: plaintext request, encrypted answer
pub async fn greeting_handler() -> ApiResult<Greeting> {
    ApiResult::ok(Greeting {
        message: "hello from the cipher node".to_string(),
        server_time: Utc::now().to_rfc3339(),
    })
}
