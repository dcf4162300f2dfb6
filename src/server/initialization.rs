// src/server/initialization.rs

//! Primary-role initialization: configuration and state reconciliation,
//! first heartbeat, listener binding.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::persistence::heartbeat;
use crate::core::readconfig;
use crate::core::state::ControllerState;
use crate::core::state::ops::epoch_now;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Brings the controller into the primary role: reconcile configuration
/// and saved state, write the first heartbeat, then open the listener.
/// Heartbeat-before-listener is the ordering that makes promotion safe:
/// no write RPC can be accepted until our claim is on the shared
/// filesystem.
pub async fn setup(
    state: &Arc<ControllerState>,
    recovery: u8,
    config_override: Option<Config>,
) -> Result<ServerContext> {
    readconfig::reconfigure(state, recovery, config_override)
        .await
        .context("configuration / state reconciliation failed")?;

    let (dir, port, stale_after) = {
        let guard = state
            .locks
            .acquire(LockRequest {
                config: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        let c = &guard.config.get().config;
        (
            PathBuf::from(&c.state_save_location),
            c.port,
            c.msg_timeout,
        )
    };

    heartbeat::write_heartbeat(&dir, state.backup_inx as u16, epoch_now())
        .context("cannot write the initial heartbeat")?;
    state.assume_control();
    state.clear_shutdown();

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("cannot bind controller port {port}"))?;
    info!(port, "controller listening");

    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(ServerContext {
        state: state.clone(),
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        stale_after,
    })
}
