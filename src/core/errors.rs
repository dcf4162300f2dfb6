// src/core/errors.rs

//! Defines the primary error type for the entire controller.
//!
//! Every RPC reply carries one numeric code; the mapping between
//! `ControllerError` variants and wire codes is stable and lives here
//! (`wire_code` / `from_wire`).

use std::sync::Arc;
use thiserror::Error;

/// Wire code for a successful RPC.
pub const WIRE_SUCCESS: u32 = 0;

/// The main error enum, representing all possible failures within the controller.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait
/// implementations.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol version mismatch")]
    ProtocolVersionMismatch,

    #[error("Invalid job id {0}")]
    InvalidJobId(u32),

    #[error("Invalid node name '{0}'")]
    InvalidNodeName(String),

    #[error("Invalid partition name '{0}'")]
    InvalidPartitionName(String),

    #[error("Job state transition not permitted: {0}")]
    InvalidJobState(String),

    #[error("Invalid node state change: {0} -> {1}")]
    InvalidNodeStateChange(String, String),

    #[error("Access denied")]
    AccessDenied,

    #[error("Controller is in standby mode")]
    InStandbyMode,

    #[error("Controller is in standby mode, use the acting primary")]
    InStandbyUseBackup,

    #[error("Duplicate job id {0}")]
    DuplicateJobId(u32),

    #[error("Job is held")]
    JobHeld,

    #[error("Job is still pending")]
    JobPending,

    #[error("Operation already completed")]
    AlreadyDone,

    #[error("Requested nodes are busy")]
    RequestedNodesBusy,

    #[error("Partition is not available for use")]
    PartitionConfigUnavailable,

    #[error("Reservation is not usable")]
    ReservationUnusable,

    #[error("Requested node configuration is not available")]
    NodesUnavailable,

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Changing the authentication backend requires a restart")]
    InvalidAuthTypeChange,

    #[error("Changing the scheduler backend requires a restart")]
    InvalidSchedulerChange,

    #[error("Changing the node-select backend requires a restart")]
    InvalidSelectChange,

    #[error("Changing the switch backend requires a restart")]
    InvalidSwitchChange,

    #[error("Changing the checkpoint backend requires a restart")]
    InvalidCheckpointChange,

    #[error("Operation is disabled in the current role")]
    Disabled,

    #[error("Data has not changed since the requested time")]
    NoChangeInData,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Returns the stable numeric code placed in RPC replies.
    pub fn wire_code(&self) -> u32 {
        match self {
            ControllerError::InvalidJobId(_) => 1001,
            ControllerError::InvalidNodeName(_) => 1002,
            ControllerError::InvalidPartitionName(_) => 1003,
            ControllerError::InvalidJobState(_) => 1004,
            ControllerError::InvalidNodeStateChange(_, _) => 1005,
            ControllerError::AccessDenied => 1101,
            ControllerError::InStandbyMode => 1201,
            ControllerError::InStandbyUseBackup => 1202,
            ControllerError::DuplicateJobId(_) => 1301,
            ControllerError::JobHeld => 1302,
            ControllerError::JobPending => 1303,
            ControllerError::AlreadyDone => 1304,
            ControllerError::RequestedNodesBusy => 1401,
            ControllerError::PartitionConfigUnavailable => 1402,
            ControllerError::ReservationUnusable => 1403,
            ControllerError::NodesUnavailable => 1404,
            ControllerError::InvalidCredential => 1501,
            ControllerError::ProtocolVersionMismatch => 1601,
            ControllerError::InvalidAuthTypeChange => 1701,
            ControllerError::InvalidSchedulerChange => 1702,
            ControllerError::InvalidSelectChange => 1703,
            ControllerError::InvalidSwitchChange => 1704,
            ControllerError::InvalidCheckpointChange => 1705,
            ControllerError::Disabled => 1801,
            ControllerError::NoChangeInData => 1901,
            ControllerError::Protocol(_) => 2001,
            ControllerError::Io(_) => 2002,
            ControllerError::Internal(_) => 2003,
        }
    }

    /// Reconstructs an error from a wire code received in a reply.
    /// Codes with a parameterised variant lose their detail; that detail
    /// only ever existed in the server-side log.
    pub fn from_wire(code: u32) -> Option<ControllerError> {
        match code {
            0 => None,
            1001 => Some(ControllerError::InvalidJobId(0)),
            1002 => Some(ControllerError::InvalidNodeName(String::new())),
            1003 => Some(ControllerError::InvalidPartitionName(String::new())),
            1004 => Some(ControllerError::InvalidJobState(String::new())),
            1005 => Some(ControllerError::InvalidNodeStateChange(
                String::new(),
                String::new(),
            )),
            1101 => Some(ControllerError::AccessDenied),
            1201 => Some(ControllerError::InStandbyMode),
            1202 => Some(ControllerError::InStandbyUseBackup),
            1301 => Some(ControllerError::DuplicateJobId(0)),
            1302 => Some(ControllerError::JobHeld),
            1303 => Some(ControllerError::JobPending),
            1304 => Some(ControllerError::AlreadyDone),
            1401 => Some(ControllerError::RequestedNodesBusy),
            1402 => Some(ControllerError::PartitionConfigUnavailable),
            1403 => Some(ControllerError::ReservationUnusable),
            1404 => Some(ControllerError::NodesUnavailable),
            1501 => Some(ControllerError::InvalidCredential),
            1601 => Some(ControllerError::ProtocolVersionMismatch),
            1701 => Some(ControllerError::InvalidAuthTypeChange),
            1702 => Some(ControllerError::InvalidSchedulerChange),
            1703 => Some(ControllerError::InvalidSelectChange),
            1704 => Some(ControllerError::InvalidSwitchChange),
            1705 => Some(ControllerError::InvalidCheckpointChange),
            1801 => Some(ControllerError::Disabled),
            1901 => Some(ControllerError::NoChangeInData),
            other => Some(ControllerError::Internal(format!(
                "unknown wire code {other}"
            ))),
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for ControllerError {
    fn clone(&self) -> Self {
        match self {
            ControllerError::Io(e) => ControllerError::Io(Arc::clone(e)),
            ControllerError::Protocol(s) => ControllerError::Protocol(s.clone()),
            ControllerError::ProtocolVersionMismatch => ControllerError::ProtocolVersionMismatch,
            ControllerError::InvalidJobId(id) => ControllerError::InvalidJobId(*id),
            ControllerError::InvalidNodeName(s) => ControllerError::InvalidNodeName(s.clone()),
            ControllerError::InvalidPartitionName(s) => {
                ControllerError::InvalidPartitionName(s.clone())
            }
            ControllerError::InvalidJobState(s) => ControllerError::InvalidJobState(s.clone()),
            ControllerError::InvalidNodeStateChange(a, b) => {
                ControllerError::InvalidNodeStateChange(a.clone(), b.clone())
            }
            ControllerError::AccessDenied => ControllerError::AccessDenied,
            ControllerError::InStandbyMode => ControllerError::InStandbyMode,
            ControllerError::InStandbyUseBackup => ControllerError::InStandbyUseBackup,
            ControllerError::DuplicateJobId(id) => ControllerError::DuplicateJobId(*id),
            ControllerError::JobHeld => ControllerError::JobHeld,
            ControllerError::JobPending => ControllerError::JobPending,
            ControllerError::AlreadyDone => ControllerError::AlreadyDone,
            ControllerError::RequestedNodesBusy => ControllerError::RequestedNodesBusy,
            ControllerError::PartitionConfigUnavailable => {
                ControllerError::PartitionConfigUnavailable
            }
            ControllerError::ReservationUnusable => ControllerError::ReservationUnusable,
            ControllerError::NodesUnavailable => ControllerError::NodesUnavailable,
            ControllerError::InvalidCredential => ControllerError::InvalidCredential,
            ControllerError::InvalidAuthTypeChange => ControllerError::InvalidAuthTypeChange,
            ControllerError::InvalidSchedulerChange => ControllerError::InvalidSchedulerChange,
            ControllerError::InvalidSelectChange => ControllerError::InvalidSelectChange,
            ControllerError::InvalidSwitchChange => ControllerError::InvalidSwitchChange,
            ControllerError::InvalidCheckpointChange => ControllerError::InvalidCheckpointChange,
            ControllerError::Disabled => ControllerError::Disabled,
            ControllerError::NoChangeInData => ControllerError::NoChangeInData,
            ControllerError::Internal(s) => ControllerError::Internal(s.clone()),
        }
    }
}

impl PartialEq for ControllerError {
    fn eq(&self, other: &Self) -> bool {
        self.wire_code() == other.wire_code()
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for ControllerError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        ControllerError::Protocol("invalid UTF-8 in packed string".to_string())
    }
}
