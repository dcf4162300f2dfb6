// src/core/lifecycle/signals.rs

//! The signal task.
//!
//! One task owns every process signal for the life of the daemon and
//! translates it into controller actions: INT/TERM request an orderly
//! shutdown, HUP re-reads the configuration, ABRT shuts down with a core
//! dump at exit, USR2 re-applies the logging configuration (the
//! close-and-reopen moment for log files). Other components never install
//! handlers; they observe `shutdown_time`. A second INT/TERM while a
//! shutdown is already in progress exits immediately.

use crate::core::rpc::admin;
use crate::core::state::ControllerState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, Registry>>;

/// Runs for the life of the process; the main loop decides when roles end.
pub async fn run_signal_task(state: Arc<ControllerState>, log_reload: Option<LogReloadHandle>) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return;
        }
    };
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("SIGHUP handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("SIGUSR2 handler");
    let mut sigabrt = signal(SignalKind::from_raw(libc::SIGABRT)).expect("SIGABRT handler");

    info!("signal task started");
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                if state.is_shutdown() {
                    warn!("second SIGINT during shutdown; exiting immediately");
                    std::process::exit(1);
                }
                info!("SIGINT received; initiating orderly shutdown");
                state.request_shutdown();
                state.shutdown_notify.notify_waiters();
            }
            _ = sigterm.recv() => {
                if state.is_shutdown() {
                    warn!("second SIGTERM during shutdown; exiting immediately");
                    std::process::exit(1);
                }
                info!("SIGTERM received; initiating orderly shutdown");
                state.request_shutdown();
                state.shutdown_notify.notify_waiters();
            }
            _ = sigabrt.recv() => {
                info!("SIGABRT received; shutdown with core dump at exit");
                state.dump_core.store(true, Ordering::SeqCst);
                state.request_shutdown();
                state.shutdown_notify.notify_waiters();
            }
            _ = sighup.recv() => {
                info!("SIGHUP received; re-reading configuration");
                if let Err(e) = admin::run_reconfigure(&state, 0).await {
                    error!(error = %e, "reconfigure on SIGHUP failed");
                }
                if let Some(handle) = &log_reload {
                    apply_log_level(&state, handle).await;
                }
            }
            _ = sigusr2.recv() => {
                info!("SIGUSR2 received; re-applying logging configuration");
                if let Some(handle) = &log_reload {
                    apply_log_level(&state, handle).await;
                }
            }
        }
    }
}

async fn apply_log_level(state: &Arc<ControllerState>, handle: &LogReloadHandle) {
    let level = {
        let guard = state
            .locks
            .acquire(crate::core::locks::LockRequest {
                config: crate::core::locks::LockMode::Read,
                ..crate::core::locks::LockRequest::none()
            })
            .await;
        guard.config.get().config.log_level.clone()
    };
    match handle.reload(EnvFilter::new(&level)) {
        Ok(()) => info!(%level, "log filter reloaded"),
        Err(e) => error!(error = %e, "log filter reload failed"),
    }
}
