// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{
    echo_handler, greeting_handler, health_handler, ingest_handler, metrics_handler,
    public_key_handler,
};
use super::middleware::{CipherLayer, MiddlewareStats};
use super::policy::{EncryptionPolicy, RoutePolicies};
use crate::crypto::{CipherFactory, SecretExchange};

/// Route serving the current server public key
pub const PUBLIC_KEY_ROUTE: &str = "/security/public-key";

#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<SecretExchange>,
    pub factory: Arc<dyn CipherFactory>,
    pub policies: Arc<RoutePolicies>,
    pub middleware_stats: Arc<MiddlewareStats>,
}

impl AppState {
    pub fn new(exchange: Arc<SecretExchange>, factory: Arc<dyn CipherFactory>) -> Self {
        Self {
            exchange,
            factory,
            policies: Arc::new(default_policies()),
            middleware_stats: Arc::new(MiddlewareStats::default()),
        }
    }

    pub fn with_policies(mut self, policies: RoutePolicies) -> Self {
        self.policies = Arc::new(policies);
        self
    }
}

/// Policies for the built-in demo routes
pub fn default_policies() -> RoutePolicies {
    RoutePolicies::new()
        .route(Method::POST, "/demo/echo", EncryptionPolicy::both())
        .route(Method::POST, "/demo/ingest", EncryptionPolicy::decrypt_only())
        .route(Method::GET, "/demo/greeting", EncryptionPolicy::encrypt_only())
}

/// Built-in routes wrapped in the cipher layer
pub fn create_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(PUBLIC_KEY_ROUTE, get(public_key_handler))
        .route("/demo/echo", post(echo_handler))
        .route("/demo/ingest", post(ingest_handler))
        .route("/demo/greeting", get(greeting_handler))
        .with_state(state.clone());
    with_cipher_layer(router, &state)
}

/// Apply the cipher layer (and tracing/CORS) to any router, resolving
/// policies from `state.policies`
pub fn with_cipher_layer(router: Router, state: &AppState) -> Router {
    let cipher = CipherLayer::new(
        state.exchange.clone(),
        state.factory.clone(),
        state.policies.clone(),
    )
    .with_stats(state.middleware_stats.clone());

    router
        .layer(cipher)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve `app` on `addr` until `shutdown` resolves
pub async fn start_server<F>(addr: SocketAddr, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🚀 HTTP cipher node listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
