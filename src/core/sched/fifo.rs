// src/core/sched/fifo.rs

//! The built-in FIFO scheduler backend.
//!
//! One pass per invocation: pending jobs in priority-then-id order, each
//! offered to the select backend. Held jobs (priority zero), jobs with
//! unmet dependencies and jobs in down partitions are skipped. The pass
//! stops refusing a partition once a larger job failed in it, so a
//! strict-FIFO queue cannot be starved by later small jobs.

use crate::core::sched::select::SelectBackend;
use crate::core::sched::{SchedContext, SchedulerBackend};
use crate::core::state::job::JobState;
use crate::core::state::ops;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Default)]
pub struct FifoScheduler;

impl SchedulerBackend for FifoScheduler {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn schedule(&mut self, ctx: &mut SchedContext<'_>, select: &dyn SelectBackend) -> usize {
        let mut started = 0usize;
        let mut blocked_parts: HashSet<String> = HashSet::new();

        let mut queue: Vec<(u32, u32)> = ctx
            .jobs
            .iter()
            .filter(|j| j.is_pending() && !j.is_held() && !j.is_completing())
            .map(|j| (j.priority, j.job_id))
            .collect();
        // Highest priority first; FIFO within a priority level.
        queue.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, job_id) in queue {
            let Some(job) = ctx.jobs.lookup(job_id) else {
                continue;
            };
            if blocked_parts.contains(&job.partition) {
                continue;
            }
            let deps_met = job
                .details
                .as_ref()
                .map(|d| {
                    d.dependency.iter().all(|dep| {
                        ctx.jobs
                            .lookup(*dep)
                            .is_none_or(|j| j.state == JobState::Complete)
                    })
                })
                .unwrap_or(true);
            if !deps_met {
                debug!(job_id, "dependencies not satisfied");
                continue;
            }
            let Some(part) = ctx.parts.lookup(&job.partition) else {
                continue;
            };
            if !part.state_up {
                continue;
            }
            match select.pick(ctx.nodes, part, job, ctx.fast_schedule) {
                Some(bitmap) => {
                    let job = ctx
                        .jobs
                        .lookup_mut(job_id)
                        .expect("job id came from the table");
                    ops::allocate_nodes_to_job(ctx.nodes, job, bitmap, ctx.now);
                    info!(
                        job_id,
                        nodes = %ctx.nodes.bitmap_to_names(job.node_bitmap.as_ref().unwrap()),
                        "scheduler started job"
                    );
                    ctx.jobs.last_update = ctx.now;
                    started += 1;
                }
                None => {
                    // Strict FIFO within a partition: nothing behind this
                    // job may overtake it.
                    blocked_parts.insert(job.partition.clone());
                }
            }
        }
        started
    }
}
