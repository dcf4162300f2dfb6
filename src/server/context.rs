// src/server/context.rs

use crate::core::state::ControllerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds everything the primary-role main loop needs.
pub struct ServerContext {
    pub state: Arc<ControllerState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    /// Connections older than this when a worker picks them up are
    /// discarded unprocessed.
    pub stale_after: Duration,
}
