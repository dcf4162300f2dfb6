// src/server/mod.rs

//! The controller's top-level run loop: role selection, the primary
//! accept loop, and the standby watch, cycling between them as control
//! moves around the cluster.

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

use crate::config::Config;
use crate::core::failover::{StandbyOutcome, standby};
use crate::core::lifecycle::signals::{self, LogReloadHandle};
use crate::core::state::ControllerState;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Runs the controller until an orderly exit. Returns whether the final
/// exit should abort with a core dump (SIGABRT path).
pub async fn run(
    config: Config,
    config_path: String,
    recovery: u8,
    log_reload: Option<LogReloadHandle>,
) -> Result<bool> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let backup_inx = config.backup_index_of(&hostname).ok_or_else(|| {
        anyhow!("host '{hostname}' is not listed in control_hosts; refusing to start")
    })?;
    info!(%hostname, backup_inx, "controller identity resolved");

    let port = config.port;
    let state = ControllerState::initialize(config.clone(), config_path, backup_inx, hostname)
        .context("state initialization failed")?;
    info!(run_id = %state.run_id, "controller state initialized");

    // One signal task for the life of the process.
    tokio::spawn(signals::run_signal_task(state.clone(), log_reload));

    let mut config_override = Some(config);
    let mut recovery = recovery;
    let mut start_primary = backup_inx == 0;

    loop {
        if start_primary {
            let mut ctx =
                initialization::setup(&state, recovery, config_override.take()).await?;
            spawner::spawn_all(&mut ctx).await?;
            connection_loop::run(ctx).await;

            if state.resume_backup.swap(false, Ordering::SeqCst) {
                info!("resuming in standby mode after relinquishing control");
                state.clear_shutdown();
                start_primary = false;
                continue;
            }
            break;
        }

        // Standby role: answer the whitelist, watch the primary.
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("cannot bind controller port {port} in standby"))?;
        let listener_task = tokio::spawn(crate::core::failover::listener::run_listener(
            state.clone(),
            listener,
        ));
        let outcome = standby::run_standby(state.clone()).await;
        state.shutdown_notify.notify_waiters();
        let _ = listener_task.await;

        match outcome {
            StandbyOutcome::TakeOver => {
                // Promotion re-reads everything from the shared state.
                recovery = 2;
                config_override = None;
                start_primary = true;
            }
            StandbyOutcome::Shutdown => break,
        }
    }

    let dump_core = state.dump_core.load(Ordering::SeqCst);
    if dump_core {
        error!("exiting with core dump as requested by SIGABRT");
    }
    info!("controller exit");
    Ok(dump_core)
}
