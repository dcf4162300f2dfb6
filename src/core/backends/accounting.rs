// src/core/backends/accounting.rs

//! Accounting-storage backends.
//!
//! The real storage service is an external collaborator; the core only
//! calls through this capability set at job start, job completion, node
//! state changes and the periodic cluster heartbeat. The built-in `none`
//! backend counts events so operators can see the hooks firing without any
//! storage configured.

use crate::config::Config;
use crate::core::state::job::Job;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub trait AccountingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn job_start(&self, job: &Job);

    fn job_complete(&self, job: &Job);

    fn node_down(&self, node_name: &str, reason: &str);

    /// Periodic cluster-wide usage snapshot.
    fn cluster_heartbeat(&self, node_cnt: usize, alloc_cnt: usize);

    fn reconfigure(&self, _config: &Config) {}
}

pub fn create_accounting(
    config: &Config,
) -> Result<Box<dyn AccountingBackend>, crate::core::ControllerError> {
    match config.accounting_type.as_str() {
        "none" => Ok(Box::new(NoneAccounting::default())),
        other => Err(crate::core::ControllerError::Internal(format!(
            "unknown accounting backend '{other}'"
        ))),
    }
}

#[derive(Debug, Default)]
pub struct NoneAccounting {
    starts: AtomicU64,
    completions: AtomicU64,
    node_downs: AtomicU64,
    heartbeats: AtomicU64,
}

impl AccountingBackend for NoneAccounting {
    fn name(&self) -> &'static str {
        "none"
    }

    fn job_start(&self, job: &Job) {
        self.starts.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = job.job_id, "accounting: job start");
    }

    fn job_complete(&self, job: &Job) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = job.job_id, state = %job.state, "accounting: job complete");
    }

    fn node_down(&self, node_name: &str, reason: &str) {
        self.node_downs.fetch_add(1, Ordering::Relaxed);
        debug!(node = node_name, reason, "accounting: node down");
    }

    fn cluster_heartbeat(&self, node_cnt: usize, alloc_cnt: usize) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        debug!(node_cnt, alloc_cnt, "accounting: cluster heartbeat");
    }
}
