// src/server/spawner.rs

//! Spawns the primary role's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::tasks::background::BackgroundLoop;
use anyhow::Result;
use tracing::info;

pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let background = BackgroundLoop::new(ctx.state.clone());
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        background.run(shutdown_rx).await;
        Ok(())
    });

    let metrics_config = {
        let guard = ctx
            .state
            .locks
            .acquire(LockRequest {
                config: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        guard.config.get().config.metrics.clone()
    };
    if metrics_config.enabled {
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_config.port, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
