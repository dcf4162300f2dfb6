// src/core/persistence/loader.rs

//! Restores persisted state into freshly built tables.
//!
//! Recovery levels: 0 discards saved job/node state (cold start), 1
//! recovers jobs plus node down/drain states and reasons only, 2 recovers
//! everything. Node and partition records are merged by name into the
//! tables the config loader just built; saved entries for names that no
//! longer exist in the configuration are dropped with a log line. A *job*
//! that claims a nonexistent node is different: that is state corruption,
//! and the load fails so the daemon aborts loudly.

use crate::config::SharedPolicy;
use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use crate::core::hostlist;
use crate::core::persistence::saver::{
    JOB_STATE_FILE, NODE_STATE_FILE, PART_STATE_FILE, TRIGGER_STATE_FILE,
};
use crate::core::persistence::statefile;
use crate::core::protocol::message::SharedPref;
use crate::core::protocol::pack::Unpacker;
use crate::core::state::job::{Job, JobDetails, JobFlags, JobState, JobStep, JobTable};
use crate::core::state::node::{BaseState, NodeFlags, NodeTable};
use crate::core::state::partition::PartTable;
use crate::core::state::trigger::{Trigger, TriggerKind, TriggerTable};
use std::path::Path;
use tracing::{info, warn};

fn shared_policy_from_u8(v: u8) -> Result<SharedPolicy, ControllerError> {
    match v {
        0 => Ok(SharedPolicy::No),
        1 => Ok(SharedPolicy::Yes),
        2 => Ok(SharedPolicy::Force),
        other => Err(ControllerError::Protocol(format!(
            "bad shared policy {other}"
        ))),
    }
}

/// Loads persisted state at the requested recovery level.
pub fn load_all(
    dir: &Path,
    recovery: u8,
    nodes: &mut NodeTable,
    jobs: &mut JobTable,
    parts: &mut PartTable,
    triggers: &mut TriggerTable,
) -> Result<(), ControllerError> {
    if recovery == 0 {
        info!("cold start: discarding any saved state");
        return Ok(());
    }
    load_nodes(dir, recovery, nodes);
    if recovery >= 2 {
        load_partitions(dir, parts);
    }
    load_jobs(dir, nodes, jobs)?;
    load_triggers(dir, triggers);
    Ok(())
}

fn load_nodes(dir: &Path, recovery: u8, nodes: &mut NodeTable) {
    let Some((timestamp, payload)) = statefile::read_state_file(dir, NODE_STATE_FILE) else {
        info!("no usable node state file");
        return;
    };
    let mut u = Unpacker::new(payload);
    let count = match u.count() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "node state file malformed; skipping");
            return;
        }
    };
    let mut merged = 0usize;
    for _ in 0..count {
        let rec = (|| -> Result<_, ControllerError> {
            let name = u.str()?;
            let _comm_name = u.str()?;
            let _port = u.u16()?;
            let state = BaseState::from_u16(u.u16()?)?;
            let flags = NodeFlags::from_bits_truncate(u.u16()?);
            let _config_cpus = u.u32()?;
            let _config_memory = u.u64()?;
            let _config_tmp_disk = u.u64()?;
            let reported_cpus = u.u32()?;
            let reported_memory = u.u64()?;
            let reported_tmp_disk = u.u64()?;
            let _weight = u.u32()?;
            let _features = u.opt_str()?;
            let reason = u.opt_str()?;
            let last_response = u.time()?;
            Ok((
                name,
                state,
                flags,
                reported_cpus,
                reported_memory,
                reported_tmp_disk,
                reason,
                last_response,
            ))
        })();
        let (name, state, flags, rep_cpus, rep_mem, rep_disk, reason, last_response) = match rec {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "node state record malformed; stopping node merge");
                break;
            }
        };
        let Some(idx) = nodes.lookup(&name) else {
            warn!(node = %name, "saved state for node no longer configured; dropped");
            continue;
        };
        let node = nodes.node_mut(idx).expect("index from lookup");
        if recovery >= 2 {
            node.state = state;
            node.flags = flags;
            node.reported_cpus = rep_cpus;
            node.reported_memory = rep_mem;
            node.reported_tmp_disk = rep_disk;
            node.reason = reason;
            node.last_response = last_response;
        } else {
            // Level 1 keeps only the administrative record: what was down
            // or draining, and why.
            if state == BaseState::Down {
                node.state = BaseState::Down;
            }
            if flags.contains(NodeFlags::DRAIN) {
                node.flags.insert(NodeFlags::DRAIN);
            }
            if flags.contains(NodeFlags::FAIL) {
                node.flags.insert(NodeFlags::FAIL);
            }
            if reason.is_some() {
                node.reason = reason;
            }
        }
        merged += 1;
    }
    nodes.sync_bitmaps();
    info!(merged, saved_at = timestamp, "node state recovered");
}

fn load_partitions(dir: &Path, parts: &mut PartTable) {
    let Some((_, payload)) = statefile::read_state_file(dir, PART_STATE_FILE) else {
        info!("no usable partition state file");
        return;
    };
    let mut u = Unpacker::new(payload);
    let count = match u.count() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "partition state file malformed; skipping");
            return;
        }
    };
    for _ in 0..count {
        let rec = (|| -> Result<_, ControllerError> {
            let name = u.str()?;
            let _node_list = u.str()?;
            let min_nodes = u.u32()?;
            let max_nodes = u.u32()?;
            let max_time = u.u32()?;
            let root_only = u.bool()?;
            let hidden = u.bool()?;
            let shared = shared_policy_from_u8(u.u8()?)?;
            let state_up = u.bool()?;
            let default_part = u.bool()?;
            let allow_groups = u.opt_str()?;
            Ok((
                name,
                min_nodes,
                max_nodes,
                max_time,
                root_only,
                hidden,
                shared,
                state_up,
                default_part,
                allow_groups,
            ))
        })();
        let Ok((name, min_nodes, max_nodes, max_time, root_only, hidden, shared, state_up, default_part, allow_groups)) =
            rec
        else {
            warn!("partition state record malformed; stopping partition merge");
            break;
        };
        let Some(part) = parts.lookup_mut(&name) else {
            warn!(partition = %name, "saved state for unconfigured partition; dropped");
            continue;
        };
        // The node membership always follows the current configuration;
        // only the mutable policy fields are restored.
        part.min_nodes = min_nodes;
        part.max_nodes = max_nodes;
        part.max_time = max_time;
        part.root_only = root_only;
        part.hidden = hidden;
        part.shared = shared;
        part.state_up = state_up;
        part.default_part = default_part;
        part.allow_groups =
            allow_groups.map(|g| g.split(',').map(|s| s.to_string()).collect());
    }
    info!("partition state recovered");
}

fn load_jobs(dir: &Path, nodes: &NodeTable, jobs: &mut JobTable) -> Result<(), ControllerError> {
    let Some((timestamp, payload)) = statefile::read_state_file(dir, JOB_STATE_FILE) else {
        info!("no usable job state file");
        return Ok(());
    };
    let mut u = Unpacker::new(payload);
    let next_job_id = u.u32()?;
    let count = u.count()?;
    for _ in 0..count {
        let job = unpack_job(&mut u, nodes)?;
        jobs.insert(job)?;
    }
    if next_job_id >= jobs.first_job_id && next_job_id <= jobs.max_job_id {
        jobs.next_job_id = next_job_id;
    }
    info!(
        count,
        saved_at = timestamp,
        "job state recovered"
    );
    Ok(())
}

fn names_to_bitmap(
    expr: &str,
    nodes: &NodeTable,
    job_id: u32,
) -> Result<Bitmap, ControllerError> {
    let mut bm = Bitmap::with_size(nodes.len());
    for name in hostlist::expand(expr)? {
        // A job referencing an unconfigured node is unrecoverable state
        // corruption; continuing would silently lose the allocation.
        let idx = nodes.lookup(&name).ok_or_else(|| {
            ControllerError::Internal(format!(
                "job {job_id} claims node '{name}' which is not configured"
            ))
        })?;
        bm.set(idx);
    }
    Ok(bm)
}

fn unpack_job(u: &mut Unpacker, nodes: &NodeTable) -> Result<Job, ControllerError> {
    let job_id = u.u32()?;
    let user_id = u.u32()?;
    let group_id = u.u32()?;
    let name = u.opt_str()?;
    let state = JobState::from_u16(u.u16()?)?;
    let flags = JobFlags::from_bits_truncate(u.u16()?);
    let partition = u.str()?;
    let node_names = u.opt_str()?;
    let completing_names = u.opt_str()?;
    let node_cnt = u.u32()?;
    let num_cpus = u.u32()?;
    let min_nodes = u.u32()?;
    let min_memory = u.u64()?;
    let time_limit = u.u32()?;
    let priority = u.u32()?;
    let shared = SharedPref::from_u8(u.u8()?)?;
    let batch_flag = u.bool()?;
    let submit_time = u.time()?;
    let start_time = u.time()?;
    let end_time = u.time()?;
    let last_active = u.time()?;
    let suspend_cnt = u.u32()?;
    let restart_cnt = u.u16()?;
    let details = if u.bool()? {
        let req_nodes = u.opt_str()?;
        let script = u.opt_str()?;
        let mut argv = Vec::new();
        for _ in 0..u.count()? {
            argv.push(u.str()?);
        }
        let mut environment = Vec::new();
        for _ in 0..u.count()? {
            environment.push(u.str()?);
        }
        let work_dir = u.opt_str()?;
        let std_in = u.opt_str()?;
        let std_out = u.opt_str()?;
        let std_err = u.opt_str()?;
        let mut dependency = Vec::new();
        for _ in 0..u.count()? {
            dependency.push(u.u32()?);
        }
        Some(JobDetails {
            req_nodes,
            script,
            argv,
            environment,
            work_dir,
            std_in,
            std_out,
            std_err,
            dependency,
        })
    } else {
        None
    };
    let mut steps = Vec::new();
    for _ in 0..u.count()? {
        let step_id = u.u32()?;
        let step_nodes = u.str()?;
        let cpu_count = u.u32()?;
        let mem_per_task = u.u64()?;
        let mut tasks_per_node = Vec::new();
        for _ in 0..u.count()? {
            tasks_per_node.push(u.u32()?);
        }
        let core_bitmap = u.bitmap()?;
        steps.push(JobStep {
            step_id,
            node_bitmap: names_to_bitmap(&step_nodes, nodes, job_id)?,
            cpu_count,
            mem_per_task,
            tasks_per_node,
            core_bitmap,
        });
    }
    let next_step_id = u.u32()?;

    let node_bitmap = node_names
        .map(|n| names_to_bitmap(&n, nodes, job_id))
        .transpose()?;
    let completing_bitmap = completing_names
        .map(|n| names_to_bitmap(&n, nodes, job_id))
        .transpose()?;

    Ok(Job {
        job_id,
        user_id,
        group_id,
        name,
        state,
        flags,
        partition,
        node_bitmap,
        completing_bitmap,
        node_cnt,
        num_cpus,
        min_nodes,
        min_memory,
        time_limit,
        priority,
        shared,
        batch_flag,
        submit_time,
        start_time,
        end_time,
        last_active,
        suspend_cnt,
        restart_cnt,
        details,
        steps,
        next_step_id,
    })
}

fn load_triggers(dir: &Path, triggers: &mut TriggerTable) {
    let Some((_, payload)) = statefile::read_state_file(dir, TRIGGER_STATE_FILE) else {
        return;
    };
    let mut u = Unpacker::new(payload);
    let parsed = (|| -> Result<TriggerTable, ControllerError> {
        let next_id = u.u32()?;
        let mut table = TriggerTable {
            triggers: Vec::new(),
            next_id,
        };
        for _ in 0..u.count()? {
            table.triggers.push(Trigger {
                trig_id: u.u32()?,
                kind: TriggerKind::from_u16(u.u16()?)?,
                target: u.str()?,
            });
        }
        Ok(table)
    })();
    match parsed {
        Ok(table) => {
            info!(count = table.triggers.len(), "trigger state recovered");
            *triggers = table;
        }
        Err(e) => warn!(error = %e, "trigger state file malformed; skipping"),
    }
}
