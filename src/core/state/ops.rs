// src/core/state/ops.rs

//! Cross-entity state transitions.
//!
//! Everything that touches a job and its nodes together lives here, so the
//! node-count bookkeeping and the derived bitmaps can never drift apart:
//! callers mutate through these functions while holding the relevant write
//! locks, and each function resyncs the bitmaps before returning.

use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use crate::core::protocol::message::SharedPref;
use crate::core::state::job::{Job, JobFlags, JobState, JobTable};
use crate::core::state::node::{BaseState, NodeFlags, NodeTable, RequestedNodeState};
use tracing::{debug, info, warn};

/// Seconds since the epoch; the one clock the state machine uses.
pub fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Binds an allocation to a pending job and moves it to `running`.
pub fn allocate_nodes_to_job(nodes: &mut NodeTable, job: &mut Job, bitmap: Bitmap, now: i64) {
    let exclusive = job.shared == SharedPref::Exclusive;
    let mut cpu_total = 0u32;
    for idx in bitmap.iter_set() {
        if let Some(node) = nodes.node_mut(idx) {
            node.run_job_cnt += 1;
            if exclusive {
                node.no_share_job_cnt += 1;
            }
            if matches!(node.state, BaseState::Idle | BaseState::Unknown) {
                node.state = BaseState::Allocated;
            }
            cpu_total += node.config_cpus;
        }
    }
    job.node_cnt = bitmap.count() as u32;
    job.num_cpus = job.num_cpus.max(cpu_total);
    job.node_bitmap = Some(bitmap);
    job.state = JobState::Running;
    job.start_time = now;
    job.last_active = now;
    nodes.last_update = now;
    nodes.sync_bitmaps();
}

/// Moves a running or suspended job into a terminal state with the
/// `completing` overlay, releasing its run counts and charging epilog
/// completion to every node that can still answer.
pub fn begin_job_completion(
    nodes: &mut NodeTable,
    job: &mut Job,
    new_state: JobState,
    now: i64,
) {
    debug_assert!(new_state.is_terminal());
    let exclusive = job.shared == SharedPref::Exclusive;
    let bitmap = job.node_bitmap.clone().unwrap_or_default();
    let mut completing = Bitmap::with_size(nodes.len());
    for idx in bitmap.iter_set() {
        let Some(node) = nodes.node_mut(idx) else {
            continue;
        };
        node.run_job_cnt = node.run_job_cnt.saturating_sub(1);
        if exclusive {
            node.no_share_job_cnt = node.no_share_job_cnt.saturating_sub(1);
        }
        if node.state == BaseState::Down {
            // A dead node will never report its epilog; don't wait for it.
            continue;
        }
        node.comp_job_cnt += 1;
        completing.set(idx);
        if node.run_job_cnt == 0 && node.state == BaseState::Allocated {
            node.state = BaseState::Completing;
        }
    }
    job.state = new_state;
    job.end_time = now;
    job.steps.clear();
    if completing.count() > 0 {
        job.flags.insert(JobFlags::COMPLETING);
        job.completing_bitmap = Some(completing);
    } else {
        job.flags.remove(JobFlags::COMPLETING);
        job.completing_bitmap = None;
    }
    nodes.last_update = now;
    nodes.sync_bitmaps();
}

/// Returns a failed batch job to the pending queue. The allocation is
/// released exactly like a completion (epilog still owed on live nodes)
/// but the base state goes back to `pending` with the restart counter
/// bumped; the scheduler will not touch it until the completing overlay
/// clears.
pub fn requeue_job(nodes: &mut NodeTable, job: &mut Job, now: i64) {
    begin_job_completion(nodes, job, JobState::Failed, now);
    job.state = JobState::Pending;
    job.restart_cnt += 1;
    job.start_time = 0;
    job.end_time = 0;
    info!(
        job_id = job.job_id,
        restart_cnt = job.restart_cnt,
        "batch job requeued"
    );
}

/// Records epilog completion for one node of a completing job. Returns
/// true when that was the last outstanding node and the overlay cleared.
pub fn epilog_complete(
    nodes: &mut NodeTable,
    job: &mut Job,
    node_idx: usize,
    now: i64,
) -> Result<bool, ControllerError> {
    let Some(completing) = job.completing_bitmap.as_mut() else {
        // Idempotent: a re-driven deallocation may race a finished epilog.
        return Ok(!job.is_completing());
    };
    if !completing.test(node_idx) {
        return Ok(false);
    }
    completing.clear(node_idx);
    if let Some(node) = nodes.node_mut(node_idx) {
        node.comp_job_cnt = node.comp_job_cnt.saturating_sub(1);
        if node.comp_job_cnt == 0
            && node.run_job_cnt == 0
            && matches!(node.state, BaseState::Completing | BaseState::Allocated)
        {
            node.state = BaseState::Idle;
        }
    }
    let done = completing.count() == 0;
    if done {
        job.flags.remove(JobFlags::COMPLETING);
        job.completing_bitmap = None;
        info!(job_id = job.job_id, "job completion finished on all nodes");
    }
    nodes.last_update = now;
    nodes.sync_bitmaps();
    Ok(done)
}

/// Applies an administrative node state change to one node. Returns the
/// ids of jobs killed as a consequence (only `down` kills).
pub fn set_node_state(
    nodes: &mut NodeTable,
    jobs: &mut JobTable,
    node_idx: usize,
    requested: RequestedNodeState,
    reason: Option<String>,
    now: i64,
) -> Result<Vec<u32>, ControllerError> {
    {
        let node = nodes
            .node(node_idx)
            .ok_or_else(|| ControllerError::InvalidNodeName(format!("index {node_idx}")))?;
        NodeTable::validate_state_change(node, requested)?;
    }
    let mut killed = Vec::new();
    match requested {
        RequestedNodeState::Down => {
            killed = kill_jobs_on_node(nodes, jobs, node_idx, now);
            let node = nodes.node_mut(node_idx).unwrap();
            node.state = BaseState::Down;
            node.run_job_cnt = 0;
            node.comp_job_cnt = 0;
            if reason.is_some() {
                node.reason = reason;
            }
            warn!(
                node = %node.name,
                reason = node.reason.as_deref().unwrap_or("none"),
                "node set down"
            );
        }
        RequestedNodeState::Drain => {
            let node = nodes.node_mut(node_idx).unwrap();
            node.flags.insert(NodeFlags::DRAIN);
            if reason.is_some() {
                node.reason = reason;
            }
            info!(node = %node.name, draining = node.is_draining(), "node drain set");
        }
        RequestedNodeState::Idle => {
            let node = nodes.node_mut(node_idx).unwrap();
            node.flags.remove(NodeFlags::DRAIN | NodeFlags::FAIL);
            node.state = BaseState::Idle;
            node.reason = None;
        }
        RequestedNodeState::Resume => {
            let node = nodes.node_mut(node_idx).unwrap();
            node.flags.remove(NodeFlags::DRAIN | NodeFlags::FAIL);
            node.reason = None;
            if node.state == BaseState::Down {
                node.state = if node.run_job_cnt > 0 {
                    BaseState::Allocated
                } else {
                    BaseState::Idle
                };
            }
        }
    }
    nodes.last_update = now;
    jobs.last_update = now;
    nodes.sync_bitmaps();
    Ok(killed)
}

/// Converts every running job on a failing node to `node-fail|completing`.
/// No job is silently lost: jobs that also span healthy nodes keep their
/// epilog obligations there.
fn kill_jobs_on_node(
    nodes: &mut NodeTable,
    jobs: &mut JobTable,
    node_idx: usize,
    now: i64,
) -> Vec<u32> {
    let mut killed = Vec::new();
    let ids: Vec<u32> = jobs
        .iter()
        .filter(|j| {
            j.is_running()
                && j.node_bitmap
                    .as_ref()
                    .is_some_and(|bm| bm.test(node_idx))
        })
        .map(|j| j.job_id)
        .collect();
    for id in ids {
        // Mark the node down before releasing the job so completion
        // accounting skips it.
        if let Some(node) = nodes.node_mut(node_idx) {
            node.state = BaseState::Down;
        }
        if let Some(job) = jobs.lookup_mut(id) {
            warn!(job_id = id, "killing job: allocated node failed");
            begin_job_completion(nodes, job, JobState::NodeFail, now);
            killed.push(id);
        }
    }
    // Jobs already completing on this node will never hear its epilog.
    let completing_ids: Vec<u32> = jobs
        .iter()
        .filter(|j| {
            j.is_completing()
                && j.completing_bitmap
                    .as_ref()
                    .is_some_and(|bm| bm.test(node_idx))
        })
        .map(|j| j.job_id)
        .collect();
    for id in completing_ids {
        if let Some(job) = jobs.lookup_mut(id) {
            let _ = epilog_complete(nodes, job, node_idx, now);
        }
    }
    killed
}

/// Folds a worker registration into the node table.
#[allow(clippy::too_many_arguments)]
pub fn register_node(
    nodes: &mut NodeTable,
    jobs: &JobTable,
    node_idx: usize,
    cpus: u32,
    real_memory: u64,
    tmp_disk: u64,
    fast_schedule: bool,
    now: i64,
) {
    let has_jobs = jobs.iter().any(|j| {
        j.is_running()
            && j.node_bitmap
                .as_ref()
                .is_some_and(|bm| bm.test(node_idx))
    });
    let Some(node) = nodes.node_mut(node_idx) else {
        return;
    };
    node.reported_cpus = cpus;
    node.reported_memory = real_memory;
    node.reported_tmp_disk = tmp_disk;
    node.last_response = now;
    node.flags.remove(NodeFlags::NO_RESPOND);

    if fast_schedule && cpus < node.config_cpus {
        warn!(
            node = %node.name,
            reported = cpus,
            configured = node.config_cpus,
            "node reports fewer cpus than configured; setting down"
        );
        node.state = BaseState::Down;
        node.reason = Some("low cpus".to_string());
    } else if node.state == BaseState::Unknown {
        node.state = if has_jobs {
            BaseState::Allocated
        } else {
            BaseState::Idle
        };
        debug!(node = %node.name, state = %node.state, "node registered");
    }
    nodes.last_update = now;
    nodes.sync_bitmaps();
}

/// Re-synchronises jobs against nodes after a reload or reconfigure
/// (spec step: every surviving running/completing job re-asserts its node
/// counts; a job bound to a dead node converts to `node-fail|completing`).
pub fn sync_jobs_with_nodes(nodes: &mut NodeTable, jobs: &mut JobTable, now: i64) {
    // Start from a clean slate; the job walk below rebuilds every count.
    for node in &mut nodes.nodes {
        node.run_job_cnt = 0;
        node.comp_job_cnt = 0;
        node.no_share_job_cnt = 0;
    }
    let mut failed_jobs = Vec::new();
    for job in jobs.iter_mut() {
        if !job.is_running() && !job.is_completing() {
            continue;
        }
        let Some(bitmap) = job.node_bitmap.clone() else {
            continue;
        };
        let mut on_down_node = false;
        for idx in bitmap.iter_set() {
            let Some(node) = nodes.node_mut(idx) else {
                continue;
            };
            if node.state == BaseState::Down {
                on_down_node = true;
                continue;
            }
            if job.is_running() {
                node.run_job_cnt += 1;
                if job.shared == SharedPref::Exclusive {
                    node.no_share_job_cnt += 1;
                }
                if matches!(node.state, BaseState::Unknown | BaseState::Idle) {
                    node.state = BaseState::Allocated;
                }
            } else if job
                .completing_bitmap
                .as_ref()
                .is_some_and(|bm| bm.test(idx))
            {
                node.comp_job_cnt += 1;
                if node.state == BaseState::Unknown {
                    node.state = BaseState::Completing;
                }
            }
        }
        if on_down_node && job.is_running() {
            failed_jobs.push(job.job_id);
        }
    }
    for id in failed_jobs {
        if let Some(job) = jobs.lookup_mut(id) {
            warn!(job_id = id, "job was running on a down node; failing it");
            begin_job_completion(nodes, job, JobState::NodeFail, now);
        }
    }
    nodes.last_update = now;
    jobs.last_update = now;
    nodes.sync_bitmaps();
}

/// Debug/testing helper: checks the cross-table invariants and returns a
/// description of the first violation found.
pub fn check_invariants(nodes: &NodeTable, jobs: &JobTable) -> Result<(), String> {
    for (i, node) in nodes.nodes.iter().enumerate() {
        let idle_ok = node.is_idle() && !node.flags.intersects(NodeFlags::DRAIN | NodeFlags::FAIL);
        if nodes.idle_bitmap.test(i) != idle_ok {
            return Err(format!("idle bitmap out of sync for node {}", node.name));
        }
        if nodes.avail_bitmap.test(i) && !node.is_available() {
            return Err(format!("avail bitmap out of sync for node {}", node.name));
        }
        if node.state == BaseState::Idle && (node.run_job_cnt > 0 || node.comp_job_cnt > 0) {
            return Err(format!("idle node {} has job counts", node.name));
        }
        if node.state == BaseState::Allocated && node.run_job_cnt == 0 {
            return Err(format!("allocated node {} has no running jobs", node.name));
        }
        if node.state == BaseState::Completing && node.comp_job_cnt == 0 {
            return Err(format!("completing node {} has no completing jobs", node.name));
        }
    }
    let node_run_total: u32 = nodes.nodes.iter().map(|n| n.run_job_cnt).sum();
    let job_run_total: u32 = jobs
        .iter()
        .filter(|j| j.is_running())
        .filter_map(|j| j.node_bitmap.as_ref())
        .map(|bm| {
            bm.iter_set()
                .filter(|&i| nodes.node(i).is_some_and(|n| n.state != BaseState::Down))
                .count() as u32
        })
        .sum();
    if node_run_total != job_run_total {
        return Err(format!(
            "run count mismatch: nodes say {node_run_total}, jobs say {job_run_total}"
        ));
    }
    Ok(())
}
