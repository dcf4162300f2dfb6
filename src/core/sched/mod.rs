// src/core/sched/mod.rs

//! Scheduling-policy backends.

pub mod fifo;
pub mod select;

use crate::config::Config;
use crate::core::ControllerError;
use crate::core::sched::select::SelectBackend;
use crate::core::state::job::JobTable;
use crate::core::state::node::NodeTable;
use crate::core::state::partition::PartTable;

/// Everything a scheduling pass may look at or mutate. Built by the caller
/// while it holds job/node write locks and partition read locks.
pub struct SchedContext<'a> {
    pub jobs: &'a mut JobTable,
    pub nodes: &'a mut NodeTable,
    pub parts: &'a PartTable,
    pub fast_schedule: bool,
    pub now: i64,
}

/// Capability set for a scheduling-policy backend.
pub trait SchedulerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one scheduling pass; returns how many jobs were started.
    fn schedule(&mut self, ctx: &mut SchedContext<'_>, select: &dyn SelectBackend) -> usize;

    fn reconfigure(&mut self, _config: &Config) {}
}

pub fn create_scheduler(config: &Config) -> Result<Box<dyn SchedulerBackend>, ControllerError> {
    match config.sched_type.as_str() {
        "fifo" => Ok(Box::new(fifo::FifoScheduler)),
        other => Err(ControllerError::Internal(format!(
            "unknown scheduler backend '{other}'"
        ))),
    }
}
