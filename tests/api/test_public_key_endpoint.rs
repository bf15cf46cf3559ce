// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Public key publication and health endpoints

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use fabstir_http_cipher::{
    api::{create_app, ApiResult, AppState, HealthResponse},
    crypto::{
        decode_b64url, AgreementAlgorithm, CbcCipherFactory, ClientSession, PublicKeyInfo,
        SecretExchange,
    },
};
use std::sync::Arc;
use tower::util::ServiceExt;

fn setup_state(algorithm: AgreementAlgorithm) -> AppState {
    let exchange = SecretExchange::builder()
        .algorithm(algorithm)
        .build()
        .expect("exchange should initialize");
    AppState::new(Arc::new(exchange), Arc::new(CbcCipherFactory::default()))
}

async fn fetch_public_key(state: &AppState) -> ApiResult<PublicKeyInfo> {
    let response = create_app(state.clone())
        .oneshot(
            Request::get("/security/public-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_public_key_endpoint_returns_current_key() {
    let state = setup_state(AgreementAlgorithm::Sm2);
    let result = fetch_public_key(&state).await;

    assert_eq!(result.code, 2000);
    assert_eq!(result.message, "ok");
    let info = result.payload.expect("payload should carry the key");
    assert_eq!(info, state.exchange.public_key_info().unwrap());
    // SubjectPublicKeyInfo DER for an uncompressed P-256 sized point
    assert_eq!(decode_b64url(&info.public_key).unwrap()[0], 0x30);
}

#[tokio::test]
async fn test_public_key_uses_camel_case_fields() {
    let state = setup_state(AgreementAlgorithm::X25519);
    let response = create_app(state.clone())
        .oneshot(
            Request::get("/security/public-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(value["payload"]["keyId"].is_string());
    assert!(value["payload"]["publicKey"].is_string());
}

#[tokio::test]
async fn test_published_key_follows_rotation() {
    let state = setup_state(AgreementAlgorithm::X25519);
    let before = fetch_public_key(&state).await.payload.unwrap();

    state.exchange.rotate().unwrap();
    let after = fetch_public_key(&state).await.payload.unwrap();
    assert_ne!(before.key_id, after.key_id);

    // A client bootstrapping from the endpoint agrees with the server
    let client = ClientSession::establish(AgreementAlgorithm::X25519, &after).unwrap();
    let secret = state
        .exchange
        .shared_secret(client.public_key_b64(), &after.key_id)
        .unwrap();
    assert_eq!(secret.as_bytes(), client.shared_secret());
}

#[tokio::test]
async fn test_health_reports_algorithms() {
    let state = setup_state(AgreementAlgorithm::Secp256k1);
    let response = create_app(state.clone())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.agreement, "secp256k1");
    assert_eq!(health.cipher, "SM4/CBC/PKCS7Padding");
    assert_eq!(health.retained_keys, 1);
}
