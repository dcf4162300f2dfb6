// src/server/connection_loop.rs

//! The primary-role accept loop and its graceful shutdown sequence.
//!
//! Back-pressure is a semaphore of worker permits: the acceptor takes a
//! permit *before* calling `accept`, so once `MAX_SERVER_THREADS` workers
//! are in flight the kernel queue absorbs the burst and nothing new is
//! admitted. When shutdown is requested the acceptor stops spawning
//! within one accept cycle; the background loop then drains workers,
//! saves state and exits.

use super::context::ServerContext;
use crate::connection::ConnectionHandler;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Upper bound on waiting for background tasks after shutdown; covers the
/// background loop's own worker-drain window plus the final state save.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(mut ctx: ServerContext) {
    let mut client_tasks = JoinSet::new();

    loop {
        if ctx.state.is_shutdown() {
            break;
        }

        // Hold a worker permit before accepting; this is the concurrency
        // bound on per-request workers.
        let permit = tokio::select! {
            biased;
            _ = ctx.state.shutdown_notify.notified() => continue,
            permit = ctx.state.server_threads.clone().acquire_owned() => {
                permit.expect("worker semaphore is never closed")
            }
        };

        tokio::select! {
            biased;
            _ = ctx.state.shutdown_notify.notified() => {
                drop(permit);
                continue;
            }
            Some(res) = ctx.background_tasks.join_next() => {
                drop(permit);
                match res {
                    Ok(Ok(())) => info!("a background task completed"),
                    Ok(Err(e)) => {
                        error!(error = %e, "background task failed; shutting down");
                        ctx.state.request_shutdown();
                    }
                    Err(e) => {
                        error!(error = %e, "background task panicked; shutting down");
                        ctx.state.request_shutdown();
                    }
                }
            }
            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        let handler = ConnectionHandler::new(
                            socket,
                            addr,
                            ctx.state.clone(),
                            Instant::now(),
                            ctx.stale_after,
                            permit,
                        );
                        client_tasks.spawn(async move {
                            if let Err(e) = handler.run().await {
                                warn!(peer = %addr, error = %e, "request worker failed");
                            }
                        });
                    }
                    Err(e) => {
                        drop(permit);
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            Some(res) = client_tasks.join_next() => {
                drop(permit);
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!(error = %e, "a request worker panicked");
                }
            }
        }
    }

    // --- Graceful shutdown sequence ---
    info!("acceptor stopped; shutting down primary role");
    let _ = ctx.shutdown_tx.send(());

    // Let in-flight workers finish their single request/reply exchange;
    // a handler runs to completion, so only a hung peer can hold this up.
    if tokio::time::timeout(Duration::from_secs(10), async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("request workers did not drain in time; aborting the stragglers");
        client_tasks.shutdown().await;
    }
    info!("all request workers finished");

    // The background loop drains, checks the lock snapshot, saves state
    // and exits; give the whole set a bounded wait.
    if tokio::time::timeout(TASK_DRAIN_TIMEOUT, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly");
    }
    ctx.state.relinquish_control();
    info!("primary role shutdown complete");
}
