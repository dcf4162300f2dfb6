// src/core/failover/standby.rs

//! The standby loop: watch the acting primary, take over when it dies.
//!
//! Liveness is judged three ways, in order: `control-status` pings to every
//! higher-priority control host, the shared-filesystem heartbeat as a
//! tiebreaker when the network looks dead, and deference to any live peer
//! with a lower backup index. Takeover happens only when all three agree
//! the cluster is headless — unless `takeover-now` was requested, which
//! skips the heartbeat dwell.

use crate::core::failover::client::PeerClient;
use crate::core::failover::{StandbyOutcome, TAKEOVER_NOW};
use crate::core::locks::{LockMode, LockRequest};
use crate::core::persistence::heartbeat;
use crate::core::protocol::message::Body;
use crate::core::state::ControllerState;
use crate::core::state::ops::epoch_now;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};

/// Settle time before the first ping round, so a freshly started primary
/// can bring its listener up.
const STARTUP_GRACE: Duration = Duration::from_secs(5);

struct StandbyConfig {
    peers: Vec<String>,
    controller_timeout: i64,
    msg_timeout: Duration,
    state_save_location: String,
}

async fn snapshot_config(state: &Arc<ControllerState>) -> StandbyConfig {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let c = &guard.config.get().config;
    StandbyConfig {
        peers: c
            .control_hosts
            .iter()
            .take(state.backup_inx)
            .map(|h| format!("{h}:{}", c.port))
            .collect(),
        controller_timeout: c.controller_timeout.as_secs().max(1) as i64,
        msg_timeout: c.msg_timeout,
        state_save_location: c.state_save_location.clone(),
    }
}

/// Runs the standby watch until this controller should promote or exit.
pub async fn run_standby(state: Arc<ControllerState>) -> StandbyOutcome {
    info!(
        backup_inx = state.backup_inx,
        "controller running in standby mode"
    );
    TAKEOVER_NOW.store(false, Ordering::SeqCst);
    tokio::time::sleep(STARTUP_GRACE).await;

    let mut last_ping: i64 = 0;
    let mut last_primary_alive = epoch_now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = state.shutdown_notify.notified() => {}
        }
        if state.is_shutdown() {
            return StandbyOutcome::Shutdown;
        }
        let now = epoch_now();
        let cfg = snapshot_config(&state).await;
        let takeover_now = TAKEOVER_NOW.load(Ordering::SeqCst);

        if !takeover_now && now - last_ping < cfg.controller_timeout / 3 {
            continue;
        }
        last_ping = now;

        match ping_peers(&state, &cfg).await {
            PeerVerdict::HigherPriorityAlive => {
                last_primary_alive = now;
                continue;
            }
            PeerVerdict::AllSilent => {}
        }

        if takeover_now {
            warn!("takeover-now: primary silent, promoting immediately");
            break;
        }

        // No peer answered: consult the heartbeat file before concluding
        // the cluster is headless.
        let dir = PathBuf::from(&cfg.state_save_location);
        if let Some(hb) = heartbeat::read_heartbeat(&dir) {
            if (hb.server_inx as usize) < state.backup_inx
                && now - hb.timestamp < cfg.controller_timeout
            {
                // Somebody higher-priority is still saving state; the
                // network between us is the problem, not the primary.
                last_primary_alive = now;
                continue;
            }
        }

        if now - last_primary_alive >= cfg.controller_timeout {
            error!(
                silent_secs = now - last_primary_alive,
                "no higher-priority controller responding and heartbeat is stale; taking over"
            );
            break;
        }
    }

    // Tell every higher-priority peer to stand down before promoting;
    // half the message timeout bounds each attempt so a dead peer cannot
    // stall the handover.
    let cfg = snapshot_config(&state).await;
    let deadline = cfg.msg_timeout / 2;
    for (inx, addr) in cfg.peers.iter().enumerate() {
        let cred = match state.backends.auth.sign(0, 0) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "cannot sign peer credential");
                break;
            }
        };
        match PeerClient::connect(addr, cred, deadline).await {
            Ok(mut client) => match client.send_simple(Body::Control, deadline).await {
                Ok(_) => info!(peer = %addr, "peer acknowledged control handover"),
                Err(e) => warn!(peer = %addr, error = %e, "peer did not acknowledge handover"),
            },
            Err(_) => {
                info!(peer_inx = inx, peer = %addr, "peer unreachable during handover");
            }
        }
    }
    StandbyOutcome::TakeOver
}

enum PeerVerdict {
    /// At least one higher-priority controller answered.
    HigherPriorityAlive,
    AllSilent,
}

/// Pings every higher-priority control host in parallel.
async fn ping_peers(state: &Arc<ControllerState>, cfg: &StandbyConfig) -> PeerVerdict {
    let mut tasks = Vec::new();
    for addr in cfg.peers.iter().cloned() {
        let cred = state.backends.auth.sign(0, 0).unwrap_or_default();
        let timeout = cfg.msg_timeout;
        tasks.push(tokio::spawn(async move {
            let mut client = PeerClient::connect(&addr, cred, timeout).await.ok()?;
            client.control_status(timeout).await.ok()
        }));
    }
    let mut alive = false;
    for task in tasks {
        if let Ok(Some(status)) = task.await {
            // Any answer proves the host is up; a non-zero control time
            // proves it is acting primary.
            if status.control_time != 0 || (status.backup_inx as usize) < state.backup_inx {
                alive = true;
            }
        }
    }
    if alive {
        PeerVerdict::HigherPriorityAlive
    } else {
        PeerVerdict::AllSilent
    }
}
