// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Cipher middleware behaviour through the router
//!
//! These tests verify that:
//! - Routes without a policy bypass header parsing and the key exchange
//! - Missing exchange headers abort with a 400 envelope before the handler runs
//! - Encrypted request and response bodies round trip through the demo routes
//! - Content-Length is dropped on transformed bodies
//! - A single route can opt in with a StaticPolicy route layer

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header, Method, Request, StatusCode},
    routing::post,
    Router,
};
use fabstir_http_cipher::{
    api::{
        create_app, headers::{X_KEY, X_NONCE, X_SERVER_KEY_ID}, with_cipher_layer, ApiResult,
        AppState, CipherLayer, EncryptionPolicy, IngestReceipt, RoutePolicies, StaticPolicy,
        Greeting,
    },
    crypto::{AgreementAlgorithm, CbcCipherFactory, ClientSession, SecretExchange},
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::util::ServiceExt; // for `oneshot`

/// Helper: state with an SM2 exchange and the default SM4 factory
fn setup_state() -> AppState {
    let exchange = SecretExchange::builder()
        .algorithm(AgreementAlgorithm::Sm2)
        .build()
        .expect("exchange should initialize");
    AppState::new(Arc::new(exchange), Arc::new(CbcCipherFactory::default()))
}

fn client_for(state: &AppState) -> ClientSession {
    let info = state.exchange.public_key_info().unwrap();
    ClientSession::establish(AgreementAlgorithm::Sm2, &info).unwrap()
}

fn encrypted_request(
    method: Method,
    uri: &str,
    client: &ClientSession,
    iv: &[u8],
    body: Body,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in client.headers(iv) {
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap()
}

async fn body_bytes(body: Body) -> Bytes {
    to_bytes(body, usize::MAX).await.unwrap()
}

/// Router with a decrypt-only upload route whose handler counts invocations
fn spy_router(state: &AppState, calls: Arc<AtomicUsize>) -> Router {
    let router = Router::new().route(
        "/upload",
        post(move |_body: Bytes| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                "stored"
            }
        }),
    );
    with_cipher_layer(router, state)
}

#[tokio::test]
async fn test_missing_nonce_aborts_before_handler() {
    let state = setup_state().with_policies(
        RoutePolicies::new().route(Method::POST, "/upload", EncryptionPolicy::decrypt_only()),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let app = spy_router(&state, calls.clone());
    let client = client_for(&state);

    let request = Request::post("/upload")
        .header(X_SERVER_KEY_ID, client.server_key_id())
        .header(X_KEY, client.public_key_b64())
        .body(Body::from("ciphertext"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope: Value = serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(
        envelope,
        json!({"code": 40000, "message": "bad request", "payload": null})
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must not run");
    assert_eq!(state.middleware_stats.snapshot().aborted, 1);
    // Header validation happens before any key exchange work
    assert_eq!(state.exchange.stats().lookups, 0);
}

#[tokio::test]
async fn test_unknown_server_key_aborts_with_400() {
    let state = setup_state().with_policies(
        RoutePolicies::new().route(Method::POST, "/upload", EncryptionPolicy::decrypt_only()),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let app = spy_router(&state, calls.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let request = Request::post("/upload")
        .header(X_SERVER_KEY_ID, "42")
        .header(X_KEY, client.public_key_b64())
        .header(X_NONCE, fabstir_http_cipher::crypto::encode_b64url(&iv))
        .body(Body::from(client.encrypt(&iv, b"data").unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_undecryptable_body_gets_failure_envelope() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let ciphertext = client.encrypt(&iv, &[0x42u8; 100]).unwrap();
    let request = encrypted_request(
        Method::POST,
        "/demo/echo",
        &client,
        &iv,
        Body::from(ciphertext[..ciphertext.len() - 3].to_vec()),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_bytes(response.into_body()).await;
    // Plaintext envelope, no cipher detail
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        envelope,
        json!({"code": 40000, "message": "bad request", "payload": null})
    );
    assert!(!String::from_utf8_lossy(&body).contains("block size"));

    let stats = state.middleware_stats.snapshot();
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.wrapped, 0);
}

#[tokio::test]
async fn test_tampered_padding_gets_failure_envelope() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let mut ciphertext = client.encrypt(&iv, b"sixteen byte msg").unwrap();
    // Corrupting the second-to-last block garbles the padding block
    let idx = ciphertext.len() - 17;
    ciphertext[idx] ^= 0x01;
    let request = encrypted_request(
        Method::POST,
        "/demo/echo",
        &client,
        &iv,
        Body::from(ciphertext),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope: ApiResult<()> =
        serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(envelope.code, 40000);
    assert!(envelope.payload.is_none());
}

#[tokio::test]
async fn test_unprotected_route_bypasses_exchange() {
    let state = setup_state();
    let app = create_app(state.clone());

    let request = Request::get("/health")
        .header(X_SERVER_KEY_ID, "garbage")
        .header(X_KEY, "garbage")
        .header(X_NONCE, "garbage")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let stats = state.exchange.stats();
    assert_eq!(stats.lookups, 0);
    assert_eq!(stats.computations, 0);
    assert!(state.exchange.cache().is_empty());
    assert_eq!(state.middleware_stats.snapshot().passthrough, 1);
}

#[tokio::test]
async fn test_echo_round_trip() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let plaintext = json!({"message": "top secret", "items": [1, 2, 3]}).to_string();
    let ciphertext = client.encrypt(&iv, plaintext.as_bytes()).unwrap();
    let request = encrypted_request(
        Method::POST,
        "/demo/echo",
        &client,
        &iv,
        Body::from(ciphertext.clone()),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    let sealed = body_bytes(response.into_body()).await;
    assert_eq!(sealed.len() % 16, 0);
    assert_eq!(client.decrypt(&iv, &sealed).unwrap(), plaintext.as_bytes());
    assert_eq!(state.middleware_stats.snapshot().wrapped, 1);
}

#[tokio::test]
async fn test_empty_body_round_trip() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let request = encrypted_request(
        Method::POST,
        "/demo/echo",
        &client,
        &iv,
        Body::from(client.encrypt(&iv, b"").unwrap()),
    );
    let response = app.oneshot(request).await.unwrap();

    let sealed = body_bytes(response.into_body()).await;
    assert_eq!(sealed.len(), 16);
    assert!(client.decrypt(&iv, &sealed).unwrap().is_empty());
}

#[tokio::test]
async fn test_decrypt_only_route_answers_in_plaintext() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let document = json!({"name": "alice", "age": 30, "tags": []}).to_string();
    let mut request = encrypted_request(
        Method::POST,
        "/demo/ingest",
        &client,
        &iv,
        Body::from(client.encrypt(&iv, document.as_bytes()).unwrap()),
    );
    request.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let receipt: ApiResult<IngestReceipt> =
        serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(receipt.code, 2000);
    assert_eq!(receipt.payload.unwrap().received_fields, 3);
}

#[tokio::test]
async fn test_encrypt_only_route_seals_response() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let request = encrypted_request(Method::GET, "/demo/greeting", &client, &iv, Body::empty());
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let sealed = body_bytes(response.into_body()).await;
    assert!(serde_json::from_slice::<Value>(&sealed).is_err(), "body must not be plaintext");

    let greeting: ApiResult<Greeting> =
        serde_json::from_slice(&client.decrypt(&iv, &sealed).unwrap()).unwrap();
    assert_eq!(greeting.message, "ok");
    assert!(greeting.payload.is_some());
}

#[tokio::test]
async fn test_previous_key_survives_one_rotation() {
    let state = setup_state();
    let app = create_app(state.clone());
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    state.exchange.rotate().unwrap();
    let request = encrypted_request(
        Method::POST,
        "/demo/echo",
        &client,
        &iv,
        Body::from(client.encrypt(&iv, b"still valid").unwrap()),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sealed = body_bytes(response.into_body()).await;
    assert_eq!(client.decrypt(&iv, &sealed).unwrap(), b"still valid");

    state.exchange.rotate().unwrap();
    let request = encrypted_request(
        Method::POST,
        "/demo/echo",
        &client,
        &iv,
        Body::from(client.encrypt(&iv, b"too late").unwrap()),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_static_policy_route_layer() {
    let state = setup_state().with_policies(RoutePolicies::new());
    let layer = CipherLayer::new(
        state.exchange.clone(),
        state.factory.clone(),
        Arc::new(StaticPolicy(EncryptionPolicy::both())),
    );
    let app = Router::new()
        .route("/sealed", post(|body: Bytes| async move { body }))
        .route_layer(layer)
        .route("/open", post(|body: Bytes| async move { body }));
    let client = client_for(&state);
    let iv = ClientSession::new_nonce().unwrap();

    let request = encrypted_request(
        Method::POST,
        "/sealed",
        &client,
        &iv,
        Body::from(client.encrypt(&iv, b"ping").unwrap()),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    let sealed = body_bytes(response.into_body()).await;
    assert_eq!(client.decrypt(&iv, &sealed).unwrap(), b"ping");

    let response = app
        .oneshot(Request::post("/open").body(Body::from("ping")).unwrap())
        .await
        .unwrap();
    assert_eq!(body_bytes(response.into_body()).await, Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn test_metrics_report_middleware_outcomes() {
    let state = setup_state();
    let app = create_app(state.clone());

    let request = Request::post("/demo/echo").body(Body::from("no headers")).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response.into_body()).await.to_vec()).unwrap();
    assert!(text.contains("http_cipher_requests_aborted_total 1"));
    assert!(text.contains("http_cipher_key_rotations_total 1"));
    assert!(text.contains("# TYPE http_cipher_cached_secrets gauge"));
}
