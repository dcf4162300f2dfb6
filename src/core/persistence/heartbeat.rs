// src/core/persistence/heartbeat.rs

//! The shared-filesystem heartbeat file.
//!
//! Only the acting primary writes it (on every state save); every standby
//! reads it. It is the tiebreaker when the network is partitioned but the
//! shared state-save directory is still reachable: a heartbeat that keeps
//! advancing means some controller is alive and saving state.

use crate::core::ControllerError;
use crate::core::persistence::statefile;
use crate::core::protocol::pack::{Packer, Unpacker};
use std::path::Path;

pub const HEARTBEAT_FILE: &str = "heartbeat";

/// A decoded heartbeat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub timestamp: i64,
    pub server_inx: u16,
}

/// Writes a fresh heartbeat stamped `now`.
pub fn write_heartbeat(dir: &Path, server_inx: u16, now: i64) -> Result<(), ControllerError> {
    let mut p = Packer::new();
    p.u16(server_inx);
    statefile::write_state_file(dir, HEARTBEAT_FILE, now, &p.into_bytes())
}

/// Reads the heartbeat, if one exists and is intact.
pub fn read_heartbeat(dir: &Path) -> Option<Heartbeat> {
    let (timestamp, payload) = statefile::read_state_file(dir, HEARTBEAT_FILE)?;
    let mut u = Unpacker::new(payload);
    let server_inx = u.u16().ok()?;
    Some(Heartbeat {
        timestamp,
        server_inx,
    })
}
