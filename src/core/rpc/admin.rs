// src/core/rpc/admin.rs

//! Administrative RPCs: entity updates, reconfigure, shutdown and the
//! primary/standby control verbs.

use crate::core::ControllerError;
use crate::core::agent::AgentRequest;
use crate::core::backends::auth::AuthInfo;
use crate::core::bitmap::Bitmap;
use crate::core::hostlist;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::protocol::message::{
    Body, ControlStatus, JobUpdateOp, NO_VAL, NO_VAL16, RegisterNode, ReturnCode, Shutdown,
    UpdateJob, UpdateNode, UpdatePartition,
};
use crate::core::readconfig;
use crate::core::state::ControllerState;
use crate::core::state::job::JobState;
use crate::core::state::node::RequestedNodeState;
use crate::core::state::ops::{self, epoch_now};
use crate::core::state::trigger::TriggerKind;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// Priority restored by a `release`.
const RELEASE_PRIORITY: u32 = 100;

fn require_admin(auth: AuthInfo) -> Result<(), ControllerError> {
    if auth.is_privileged() {
        Ok(())
    } else {
        Err(ControllerError::AccessDenied)
    }
}

pub async fn update_job(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: UpdateJob,
) -> Result<Body, ControllerError> {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let jobs = guard.jobs.get_mut();
    let job = jobs
        .lookup_mut(req.job_id)
        .ok_or(ControllerError::InvalidJobId(req.job_id))?;

    let owner = job.user_id == auth.uid;
    match req.op {
        JobUpdateOp::None => {}
        JobUpdateOp::Hold => {
            if !owner && !auth.is_privileged() {
                return Err(ControllerError::AccessDenied);
            }
            if !job.is_pending() {
                return Err(ControllerError::InvalidJobState(job.state.to_string()));
            }
            job.priority = 0;
            info!(job_id = job.job_id, "job held");
        }
        JobUpdateOp::Release => {
            if !owner && !auth.is_privileged() {
                return Err(ControllerError::AccessDenied);
            }
            if !job.is_held() {
                return Err(ControllerError::InvalidJobState(job.state.to_string()));
            }
            job.priority = RELEASE_PRIORITY;
            state.sched_kick.notify_one();
            info!(job_id = job.job_id, "job released");
        }
        JobUpdateOp::Suspend => {
            require_admin(auth)?;
            if job.state != JobState::Running {
                return Err(ControllerError::InvalidJobState(job.state.to_string()));
            }
            job.state = JobState::Suspended;
            job.suspend_cnt += 1;
            info!(job_id = job.job_id, "job suspended");
        }
        JobUpdateOp::Resume => {
            require_admin(auth)?;
            if job.state != JobState::Suspended {
                return Err(ControllerError::InvalidJobState(job.state.to_string()));
            }
            job.state = JobState::Running;
            job.suspend_cnt = job.suspend_cnt.saturating_sub(1);
            info!(job_id = job.job_id, "job resumed");
        }
    }
    if req.priority != NO_VAL {
        require_admin(auth)?;
        job.priority = req.priority;
        if req.priority > 0 {
            state.sched_kick.notify_one();
        }
    }
    if req.time_limit != NO_VAL {
        require_admin(auth)?;
        job.time_limit = req.time_limit;
    }
    jobs.last_update = now;
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn update_node(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: UpdateNode,
) -> Result<Body, ControllerError> {
    require_admin(auth)?;
    let mut guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let names = hostlist::expand(&req.node_names)?;
    let requested = if req.state == NO_VAL16 {
        None
    } else {
        Some(RequestedNodeState::from_u16(req.state)?)
    };

    let mut all_killed = Vec::new();
    for name in &names {
        let idx = guard
            .nodes
            .get()
            .lookup(name)
            .ok_or_else(|| ControllerError::InvalidNodeName(name.clone()))?;
        match requested {
            Some(target) => {
                let killed = ops::set_node_state(
                    guard.nodes.get_mut(),
                    guard.jobs.get_mut(),
                    idx,
                    target,
                    req.reason.clone(),
                    now,
                )?;
                if target == RequestedNodeState::Down {
                    state.backends.accounting.node_down(
                        name,
                        req.reason.as_deref().unwrap_or("unspecified"),
                    );
                }
                all_killed.extend(killed);
            }
            None => {
                // Reason-only update.
                if let Some(node) = guard.nodes.get_mut().node_mut(idx) {
                    node.reason = req.reason.clone();
                    guard.nodes.get_mut().last_update = now;
                }
            }
        }
    }

    // Jobs killed by a down transition still owe epilogs on their healthy
    // nodes; re-drive the deallocation there.
    for job_id in all_killed {
        let nodes = guard.nodes.get();
        if let Some(job) = guard.jobs.get().lookup(job_id)
            && let Some(bm) = job.completing_bitmap.as_ref()
        {
            for idx in bm.iter_set() {
                if let Some(node) = nodes.node(idx) {
                    state.agent.enqueue(AgentRequest::new(
                        node.name.clone(),
                        format!("{}:{}", node.comm_name, node.port),
                        Body::TerminateJob(crate::core::protocol::message::TerminateJob {
                            job_id,
                            timelimit: false,
                        }),
                    ));
                }
            }
        }
    }
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn update_partition(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: UpdatePartition,
) -> Result<Body, ControllerError> {
    require_admin(auth)?;
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            node: LockMode::Write,
            part: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let part_idx = guard
        .parts
        .get()
        .index_of(&req.name)
        .ok_or_else(|| ControllerError::InvalidPartitionName(req.name.clone()))?;

    // Node membership change: rebuild the bitmap and both directions of
    // the back-references before touching the scalar fields.
    if let Some(expr) = &req.nodes {
        let fast = guard.config.get().config.fast_schedule;
        let nodes = guard.nodes.get_mut();
        let mut bitmap = Bitmap::with_size(nodes.len());
        let mut total_cpus = 0u32;
        for name in hostlist::expand(expr)? {
            let idx = nodes
                .lookup(&name)
                .ok_or_else(|| ControllerError::InvalidNodeName(name.clone()))?;
            bitmap.set(idx);
            total_cpus += nodes.node(idx).expect("index from lookup").avail_cpus(fast);
        }
        for (idx, node) in nodes.nodes.iter_mut().enumerate() {
            let member = bitmap.test(idx);
            let referenced = node.partitions.contains(&part_idx);
            if member && !referenced {
                node.partitions.push(part_idx);
            } else if !member && referenced {
                node.partitions.retain(|&p| p != part_idx);
            }
        }
        nodes.last_update = now;
        let part = guard.parts.get_mut().lookup_mut(&req.name).expect("index checked");
        part.total_nodes = bitmap.count() as u32;
        part.total_cpus = total_cpus;
        part.node_bitmap = bitmap;
        part.node_list = expr.clone();
    }

    let parts = guard.parts.get_mut();
    if req.default_part == 1 {
        for other in parts.parts.values_mut() {
            other.default_part = false;
        }
    }
    let part = parts.lookup_mut(&req.name).expect("index checked");
    if req.state_up != NO_VAL16 {
        part.state_up = req.state_up != 0;
        if part.state_up {
            state.sched_kick.notify_one();
        }
    }
    if req.max_time != NO_VAL {
        part.max_time = req.max_time;
    }
    if req.min_nodes != NO_VAL {
        part.min_nodes = req.min_nodes;
    }
    if req.max_nodes != NO_VAL {
        part.max_nodes = req.max_nodes;
    }
    if let Some(groups) = &req.allow_groups {
        part.allow_groups = Some(groups.split(',').map(|s| s.to_string()).collect());
    }
    if req.default_part == 1 {
        part.default_part = true;
    } else if req.default_part == 0 {
        part.default_part = false;
    }
    if req.allow_groups.is_some() {
        readconfig::refresh_group_uids(parts);
    }
    parts.last_update = now;
    info!(partition = %req.name, "partition updated");
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn register_node(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: RegisterNode,
) -> Result<Body, ControllerError> {
    if !auth.is_privileged() {
        return Err(ControllerError::AccessDenied);
    }
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Read,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let idx = guard
        .nodes
        .get()
        .lookup(&req.node_name)
        .ok_or_else(|| ControllerError::InvalidNodeName(req.node_name.clone()))?;
    let fast = guard.config.get().config.fast_schedule;
    ops::register_node(
        guard.nodes.get_mut(),
        guard.jobs.get(),
        idx,
        req.cpus,
        req.real_memory,
        req.tmp_disk,
        fast,
        now,
    );
    state.sched_kick.notify_one();
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

/// The reconfigure RPC: same path as SIGHUP with recovery level 0.
pub async fn reconfigure(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
) -> Result<Body, ControllerError> {
    require_admin(auth)?;
    run_reconfigure(state, 0).await?;
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

/// Shared reconfigure driver for the RPC and SIGHUP paths. Soft backend
/// errors are logged; a hard failure here means the in-memory state can no
/// longer be trusted against the configuration, and the daemon aborts so
/// the operator notices.
pub async fn run_reconfigure(
    state: &Arc<ControllerState>,
    recovery: u8,
) -> Result<(), ControllerError> {
    match readconfig::reconfigure(state, recovery, None).await {
        Ok(_soft_errors) => {}
        Err(e) => {
            error!(error = %e, "reconfigure failed; aborting rather than running with suspect state");
            std::process::abort();
        }
    }

    let new_config = {
        let guard = state
            .locks
            .acquire(LockRequest {
                config: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        guard.config.get().config.clone()
    };
    if let Err(e) = state.backends.reconfigure(&new_config) {
        warn!(error = %e, "backend refresh after reconfigure failed");
    }

    // Fire armed reconfigure triggers.
    let fired = state
        .triggers
        .lock()
        .pull(|t| t.kind == TriggerKind::Reconfigure);
    for t in fired {
        info!(trig_id = t.trig_id, "trigger fired: reconfigure");
    }

    // Fan the reconfigure out to every worker daemon.
    let guard = state
        .locks
        .acquire(LockRequest {
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    for node in &guard.nodes.get().nodes {
        state.agent.enqueue(AgentRequest::new(
            node.name.clone(),
            format!("{}:{}", node.comm_name, node.port),
            Body::ReconfigureWorker,
        ));
    }
    Ok(())
}

pub async fn shutdown(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: Shutdown,
) -> Result<Body, ControllerError> {
    require_admin(auth)?;
    info!(mode = req.mode, "shutdown requested via RPC");
    state.request_shutdown();
    state.shutdown_notify.notify_waiters();
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

/// `control`: the acting primary is told to give up control and fall back
/// to standby after its shutdown sequence completes.
pub async fn relinquish_control(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
) -> Result<Body, ControllerError> {
    require_admin(auth)?;
    if !state.is_primary() {
        // A standby has no control to relinquish.
        return Err(ControllerError::Disabled);
    }
    info!("relinquishing control; will resume in standby mode");
    state.resume_backup.store(true, Ordering::SeqCst);
    state.request_shutdown();
    state.shutdown_notify.notify_waiters();
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

/// `takeover`: a standby demands control; the primary shuts down in its
/// favour. Identical to `control` from the primary's point of view.
pub async fn takeover(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
) -> Result<Body, ControllerError> {
    require_admin(auth)?;
    if !state.is_primary() {
        return Err(ControllerError::Disabled);
    }
    warn!("takeover demanded by a standby; shutting down");
    state.resume_backup.store(true, Ordering::SeqCst);
    state.request_shutdown();
    state.shutdown_notify.notify_waiters();
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn control_status(state: &Arc<ControllerState>) -> Result<Body, ControllerError> {
    Ok(Body::ControlStatusResponse(ControlStatus {
        control_time: state.control_time.load(Ordering::SeqCst),
        backup_inx: state.backup_inx as u16,
    }))
}
