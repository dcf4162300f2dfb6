// src/core/persistence/saver.rs

//! Serialises the node, partition, job and trigger tables into the
//! state-save directory, then refreshes the heartbeat.

use crate::config::SharedPolicy;
use crate::core::ControllerError;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::persistence::{heartbeat, statefile};
use crate::core::protocol::pack::Packer;
use crate::core::state::job::JobTable;
use crate::core::state::node::NodeTable;
use crate::core::state::ops::epoch_now;
use crate::core::state::partition::PartTable;
use crate::core::state::trigger::TriggerTable;
use crate::core::state::ControllerState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const NODE_STATE_FILE: &str = "node_state";
pub const PART_STATE_FILE: &str = "part_state";
pub const JOB_STATE_FILE: &str = "job_state";
pub const TRIGGER_STATE_FILE: &str = "trigger_state";

pub(crate) fn shared_policy_to_u8(p: SharedPolicy) -> u8 {
    match p {
        SharedPolicy::No => 0,
        SharedPolicy::Yes => 1,
        SharedPolicy::Force => 2,
    }
}

/// Saves the entire controller state for later recovery. Takes read locks
/// on all four entities; failures are returned for logging but must never
/// block scheduling — the next checkpoint cycle retries.
pub async fn save_all(state: &Arc<ControllerState>) -> Result<(), ControllerError> {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Read,
            node: LockMode::Read,
            part: LockMode::Read,
        })
        .await;

    let dir = PathBuf::from(&guard.config.get().config.state_save_location);
    let now = epoch_now();

    save_nodes(&dir, now, guard.nodes.get())?;
    save_partitions(&dir, now, guard.parts.get())?;
    save_jobs(&dir, now, guard.jobs.get(), guard.nodes.get())?;
    save_triggers(&dir, now, &state.triggers.lock())?;
    drop(guard);

    heartbeat::write_heartbeat(&dir, state.backup_inx as u16, now)?;
    info!("controller state saved");
    Ok(())
}

pub fn save_nodes(dir: &Path, now: i64, nodes: &NodeTable) -> Result<(), ControllerError> {
    let mut p = Packer::new();
    p.count(nodes.len());
    for node in &nodes.nodes {
        p.str(&node.name);
        p.str(&node.comm_name);
        p.u16(node.port);
        p.u16(node.state as u16);
        p.u16(node.flags.bits());
        p.u32(node.config_cpus);
        p.u64(node.config_memory);
        p.u64(node.config_tmp_disk);
        p.u32(node.reported_cpus);
        p.u64(node.reported_memory);
        p.u64(node.reported_tmp_disk);
        p.u32(node.weight);
        p.opt_str(node.features.as_deref());
        p.opt_str(node.reason.as_deref());
        p.time(node.last_response);
    }
    statefile::write_state_file(dir, NODE_STATE_FILE, now, &p.into_bytes())?;
    debug!(count = nodes.len(), "node state written");
    Ok(())
}

pub fn save_partitions(dir: &Path, now: i64, parts: &PartTable) -> Result<(), ControllerError> {
    let mut p = Packer::new();
    p.count(parts.len());
    for part in parts.parts.values() {
        p.str(&part.name);
        p.str(&part.node_list);
        p.u32(part.min_nodes);
        p.u32(part.max_nodes);
        p.u32(part.max_time);
        p.bool(part.root_only);
        p.bool(part.hidden);
        p.u8(shared_policy_to_u8(part.shared));
        p.bool(part.state_up);
        p.bool(part.default_part);
        p.opt_str(part.allow_groups.as_ref().map(|g| g.join(",")).as_deref());
    }
    statefile::write_state_file(dir, PART_STATE_FILE, now, &p.into_bytes())?;
    debug!(count = parts.len(), "partition state written");
    Ok(())
}

/// Job node sets are saved as folded name strings, not index bitmaps:
/// node indices are not stable across a reconfigure, names are.
pub fn save_jobs(
    dir: &Path,
    now: i64,
    jobs: &JobTable,
    nodes: &NodeTable,
) -> Result<(), ControllerError> {
    let mut p = Packer::new();
    p.u32(jobs.next_job_id);
    let ids = jobs.sorted_ids();
    p.count(ids.len());
    for id in ids {
        let job = jobs.lookup(id).expect("id from table");
        p.u32(job.job_id);
        p.u32(job.user_id);
        p.u32(job.group_id);
        p.opt_str(job.name.as_deref());
        p.u16(job.state as u16);
        p.u16(job.flags.bits());
        p.str(&job.partition);
        p.opt_str(
            job.node_bitmap
                .as_ref()
                .map(|bm| nodes.bitmap_to_names(bm))
                .as_deref(),
        );
        p.opt_str(
            job.completing_bitmap
                .as_ref()
                .map(|bm| nodes.bitmap_to_names(bm))
                .as_deref(),
        );
        p.u32(job.node_cnt);
        p.u32(job.num_cpus);
        p.u32(job.min_nodes);
        p.u64(job.min_memory);
        p.u32(job.time_limit);
        p.u32(job.priority);
        p.u8(job.shared as u8);
        p.bool(job.batch_flag);
        p.time(job.submit_time);
        p.time(job.start_time);
        p.time(job.end_time);
        p.time(job.last_active);
        p.u32(job.suspend_cnt);
        p.u16(job.restart_cnt);
        match &job.details {
            None => p.bool(false),
            Some(d) => {
                p.bool(true);
                p.opt_str(d.req_nodes.as_deref());
                p.opt_str(d.script.as_deref());
                p.count(d.argv.len());
                for a in &d.argv {
                    p.str(a);
                }
                p.count(d.environment.len());
                for e in &d.environment {
                    p.str(e);
                }
                p.opt_str(d.work_dir.as_deref());
                p.opt_str(d.std_in.as_deref());
                p.opt_str(d.std_out.as_deref());
                p.opt_str(d.std_err.as_deref());
                p.count(d.dependency.len());
                for dep in &d.dependency {
                    p.u32(*dep);
                }
            }
        }
        p.count(job.steps.len());
        for step in &job.steps {
            p.u32(step.step_id);
            p.str(&nodes.bitmap_to_names(&step.node_bitmap));
            p.u32(step.cpu_count);
            p.u64(step.mem_per_task);
            p.count(step.tasks_per_node.len());
            for t in &step.tasks_per_node {
                p.u32(*t);
            }
            p.bitmap(&step.core_bitmap);
        }
        p.u32(job.next_step_id);
    }
    statefile::write_state_file(dir, JOB_STATE_FILE, now, &p.into_bytes())?;
    debug!("job state written");
    Ok(())
}

pub fn save_triggers(dir: &Path, now: i64, triggers: &TriggerTable) -> Result<(), ControllerError> {
    let mut p = Packer::new();
    p.u32(triggers.next_id);
    p.count(triggers.triggers.len());
    for t in &triggers.triggers {
        p.u32(t.trig_id);
        p.u16(t.kind as u16);
        p.str(&t.target);
    }
    statefile::write_state_file(dir, TRIGGER_STATE_FILE, now, &p.into_bytes())
}
