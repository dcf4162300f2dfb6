// src/core/metrics.rs

//! Process-wide Prometheus metrics.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGauge, histogram_opts, opts, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    pub static ref RPC_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beryld_rpc_requests_total", "RPC requests by message type"),
        &["msg_type"]
    )
    .unwrap();
    pub static ref RPC_ERRORS_TOTAL: IntCounter = register_int_counter!(opts!(
        "beryld_rpc_errors_total",
        "RPC requests that returned an error code"
    ))
    .unwrap();
    pub static ref RPC_STALE_DISCARDED_TOTAL: IntCounter = register_int_counter!(opts!(
        "beryld_rpc_stale_discarded_total",
        "Connections discarded unprocessed because they out-waited msg_timeout"
    ))
    .unwrap();
    pub static ref JOBS_SUBMITTED_TOTAL: IntCounter = register_int_counter!(opts!(
        "beryld_jobs_submitted_total",
        "Jobs accepted by submit/allocate RPCs"
    ))
    .unwrap();
    pub static ref JOBS_STARTED_TOTAL: IntCounter = register_int_counter!(opts!(
        "beryld_jobs_started_total",
        "Jobs started by the scheduler"
    ))
    .unwrap();
    pub static ref JOBS_COMPLETED_TOTAL: IntCounter = register_int_counter!(opts!(
        "beryld_jobs_completed_total",
        "Jobs that reached a terminal state"
    ))
    .unwrap();
    pub static ref AGENT_RETRIES_TOTAL: IntCounter = register_int_counter!(opts!(
        "beryld_agent_retries_total",
        "Outbound worker RPC deliveries that needed a retry"
    ))
    .unwrap();
    pub static ref SERVER_THREADS_ACTIVE: IntGauge = register_int_gauge!(opts!(
        "beryld_server_threads_active",
        "Per-request workers currently running"
    ))
    .unwrap();
    pub static ref STATE_SAVE_SECONDS: Histogram = register_histogram!(histogram_opts!(
        "beryld_state_save_seconds",
        "Wall time of full state checkpoints"
    ))
    .unwrap();
}
