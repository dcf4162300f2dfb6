// src/connection/handler.rs

//! The per-request worker.
//!
//! Each accepted connection is handed to one of these: receive a single
//! framed message, authenticate and dispatch it, send one reply, close.
//! A connection that waited longer than the message timeout before a
//! worker picked it up is discarded unprocessed — the client gave up on
//! it long ago.

use crate::core::ControllerError;
use crate::core::metrics;
use crate::core::protocol::MessageCodec;
use crate::core::rpc;
use crate::core::state::ControllerState;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Tracks the active-worker gauge across every exit path.
struct ActiveWorker;

impl ActiveWorker {
    fn enter() -> Self {
        metrics::SERVER_THREADS_ACTIVE.inc();
        ActiveWorker
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        metrics::SERVER_THREADS_ACTIVE.dec();
    }
}

pub struct ConnectionHandler {
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ControllerState>,
    accepted_at: Instant,
    stale_after: Duration,
    /// Returned to the acceptor's semaphore on drop.
    _permit: OwnedSemaphorePermit,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ControllerState>,
        accepted_at: Instant,
        stale_after: Duration,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            stream,
            addr,
            state,
            accepted_at,
            stale_after,
            _permit: permit,
        }
    }

    pub async fn run(self) -> Result<(), ControllerError> {
        let _active = ActiveWorker::enter();

        if self.accepted_at.elapsed() > self.stale_after {
            metrics::RPC_STALE_DISCARDED_TOTAL.inc();
            warn!(peer = %self.addr, "discarding stale connection");
            return Ok(());
        }

        let mut framed = Framed::new(self.stream, MessageCodec);
        let Some(request) = framed.next().await else {
            debug!(peer = %self.addr, "connection closed before a request arrived");
            return Ok(());
        };
        let request = match request {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %self.addr, error = %e, "undecodable request");
                return Err(e);
            }
        };

        let reply = rpc::dispatch(&self.state, request).await;
        framed.send(reply).await?;
        Ok(())
    }
}
