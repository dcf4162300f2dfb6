// src/core/sched/select.rs

//! Node-selection backends.
//!
//! Given a pending job and a partition, a select backend picks the concrete
//! set of nodes for the allocation, or reports that none exists right now.
//! The built-in `linear` backend does weight-ordered first-fit over whole
//! nodes.

use crate::config::{Config, SharedPolicy};
use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use crate::core::protocol::message::SharedPref;
use crate::core::state::job::Job;
use crate::core::state::node::NodeTable;
use crate::core::state::partition::Partition;

pub trait SelectBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks nodes for `job` inside `part`, or `None` when the job cannot
    /// start right now. Does not mutate anything.
    fn pick(
        &self,
        nodes: &NodeTable,
        part: &Partition,
        job: &Job,
        fast_schedule: bool,
    ) -> Option<Bitmap>;

    fn reconfigure(&self, _config: &Config) {}
}

pub fn create_select(config: &Config) -> Result<Box<dyn SelectBackend>, ControllerError> {
    match config.select_type.as_str() {
        "linear" => Ok(Box::new(LinearSelect)),
        other => Err(ControllerError::Internal(format!(
            "unknown node-select backend '{other}'"
        ))),
    }
}

/// Whole-node first-fit in ascending weight order.
pub struct LinearSelect;

impl LinearSelect {
    /// True when the job may coexist with work already on the node.
    fn sharing_allowed(part: &Partition, job: &Job) -> bool {
        match part.shared {
            SharedPolicy::Force => true,
            SharedPolicy::Yes => job.shared == SharedPref::Shared,
            SharedPolicy::No => false,
        }
    }
}

impl SelectBackend for LinearSelect {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn pick(
        &self,
        nodes: &NodeTable,
        part: &Partition,
        job: &Job,
        fast_schedule: bool,
    ) -> Option<Bitmap> {
        let share = Self::sharing_allowed(part, job);

        // Start from the partition's members that may take new work.
        let mut candidates = part.node_bitmap.clone();
        candidates.and(&nodes.avail_bitmap);
        if !share {
            // One job per node: only genuinely idle members qualify.
            candidates.and(&nodes.idle_bitmap);
        } else {
            // Sharing still excludes nodes pinned by an exclusive job.
            candidates.and(&nodes.share_bitmap);
        }

        // Explicitly requested hosts are mandatory; a requested host that
        // is not currently a candidate sinks the whole pick.
        let mut required: Vec<usize> = Vec::new();
        if let Some(expr) = job.details.as_ref().and_then(|d| d.req_nodes.as_deref()) {
            let names = crate::core::hostlist::expand(expr).ok()?;
            for name in names {
                let idx = nodes.lookup(&name)?;
                if !candidates.test(idx) {
                    return None;
                }
                required.push(idx);
            }
        }

        let mut order: Vec<usize> = candidates.iter_set().collect();
        order.sort_by_key(|&i| {
            let n = nodes.node(i).expect("candidate index in table");
            (n.weight, i)
        });

        let mut picked = Bitmap::with_size(nodes.len());
        let mut picked_cnt = 0u32;
        let mut cpu_total = 0u32;
        for idx in required.iter().copied().chain(order.into_iter()) {
            if picked.test(idx) {
                continue;
            }
            let node = nodes.node(idx)?;
            if job.min_memory > 0 && node.config_memory < job.min_memory {
                continue;
            }
            picked.set(idx);
            picked_cnt += 1;
            cpu_total += node.avail_cpus(fast_schedule);
            if picked_cnt >= job.min_nodes && cpu_total >= job.num_cpus {
                return Some(picked);
            }
        }
        None
    }
}
