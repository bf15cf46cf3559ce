// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Background key rotation.
//!
//! One tokio task per exchange. It rotates the server key pair with a fixed
//! delay between attempts and sweeps idle shared-secret cache entries. A
//! failed rotation is logged and retried on the next tick; the pairs already
//! in the retention window stay valid meanwhile.
//!
//! The task is owned by a [`RotationTask`] handle: `shutdown()` cancels it and
//! waits for it to finish, dropping the handle cancels it without waiting.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::exchange::SecretExchange;

/// Handle to the running rotation task
pub struct RotationTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RotationTask {
    /// Spawn the rotation loop on the current tokio runtime
    pub fn spawn(
        exchange: Arc<SecretExchange>,
        rotation_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            exchange,
            rotation_interval,
            sweep_interval,
            cancel.clone(),
        ));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the task and wait for it to stop
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Key rotation task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RotationTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    exchange: Arc<SecretExchange>,
    rotation_interval: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        "🔄 Key rotation scheduled every {}s (curve: {})",
        rotation_interval.as_secs(),
        exchange.algorithm()
    );

    let sweep_interval = sweep_interval.max(Duration::from_millis(1));
    let mut sweep = interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Fixed delay: the next rotation is scheduled after the previous one completed
    let rotation = sleep(rotation_interval);
    tokio::pin!(rotation);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("🛑 Key rotation task stopped");
                break;
            }
            _ = &mut rotation => {
                match exchange.rotate() {
                    Ok(key_id) => debug!("Scheduled rotation produced key {}", key_id),
                    Err(e) => error!(
                        "❌ Scheduled key rotation failed, keeping current key pair: {}",
                        e
                    ),
                }
                rotation.as_mut().reset(Instant::now() + rotation_interval);
            }
            _ = sweep.tick() => {
                let removed = exchange.cache().purge_expired();
                if removed > 0 {
                    debug!("Swept {} idle shared secrets", removed);
                }
            }
        }
    }
}
