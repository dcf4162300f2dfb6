// src/core/failover/mod.rs

//! Primary/standby failover: the standby watch loop, the whitelist RPC
//! listener, and the peer client used for liveness pings and handover.

pub mod client;
pub mod listener;
pub mod standby;

use std::sync::atomic::AtomicBool;

/// Set by the `takeover` RPC: promote as soon as the primary stops
/// answering, skipping the heartbeat dwell.
pub static TAKEOVER_NOW: AtomicBool = AtomicBool::new(false);

/// Why the standby loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyOutcome {
    /// Promote: re-read state with full recovery and become primary.
    TakeOver,
    /// Orderly exit requested.
    Shutdown,
}
