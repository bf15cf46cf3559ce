// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::Result;
use clap::Parser;
use fabstir_http_cipher::{
    api::{create_app, start_server, AppState},
    cli::{build_components, Cli},
};
use std::{env, sync::Arc};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    tracing::info!("🚀 Starting HTTP cipher node v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "🔐 Agreement: {} | Cipher: {} | Key normalization: {}",
        config.agreement,
        config.cipher,
        config.key_normalization
    );

    let (exchange, factory) = build_components(&config)?;
    let rotation = exchange.spawn_rotation(config.rotation_interval());

    let state = AppState::new(exchange.clone(), Arc::new(factory));
    let app = create_app(state);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("🛑 Shutdown signal received");
    };

    let served = start_server(config.socket_addr().map_err(anyhow::Error::msg)?, app, shutdown).await;

    rotation.shutdown().await;
    let stats = exchange.stats();
    tracing::info!(
        "👋 Node stopped: {} lookups, {} agreements, {} rotations",
        stats.lookups,
        stats.computations,
        stats.rotations
    );
    served
}
