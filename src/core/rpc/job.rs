// src/core/rpc/job.rs

//! Job and step lifecycle RPCs: submission, allocation, cancellation,
//! completion, steps and epilogs.

use crate::core::ControllerError;
use crate::core::agent::AgentRequest;
use crate::core::backends::auth::AuthInfo;
use crate::core::backends::cred::StepCredential;
use crate::core::bitmap::Bitmap;
use crate::core::hostlist;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::metrics;
use crate::core::protocol::message::{
    AllocationResponse, BATCH_SCRIPT_STEP_ID, Body, CancelJobStep, CompleteBatchScript,
    CompleteJobAllocation, EpilogComplete, JobDescriptor, JobStepCreate, NO_VAL, ReturnCode,
    StepComplete, StepCreateResponse, SubmitResponse, TerminateJob, WillRunResponse,
};
use crate::core::state::job::{INFINITE_TIME, Job, JobDetails, JobFlags, JobState, JobStep};
use crate::core::state::node::{NodeTable, RequestedNodeState};
use crate::core::state::partition::{PartTable, Partition};
use crate::core::state::ControllerState;
use crate::core::state::ops::{self, epoch_now};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Priority given to jobs that do not (or may not) set their own.
const DEFAULT_PRIORITY: u32 = 100;

/// Requeue budget for failing batch scripts.
const MAX_BATCH_REQUEUE: u16 = 3;

fn resolve_partition<'a>(
    parts: &'a PartTable,
    requested: Option<&str>,
) -> Result<&'a Partition, ControllerError> {
    match requested {
        Some(name) => parts
            .lookup(name)
            .ok_or_else(|| ControllerError::InvalidPartitionName(name.to_string())),
        None => parts
            .default_partition()
            .ok_or(ControllerError::PartitionConfigUnavailable),
    }
}

/// Shared submission-time validation, identical for submit/allocate/will-run.
fn validate_request(
    desc: &JobDescriptor,
    part: &Partition,
    auth: AuthInfo,
) -> Result<(), ControllerError> {
    if !auth.is_privileged() && desc.user_id != auth.uid {
        return Err(ControllerError::AccessDenied);
    }
    if !part.permits_user(desc.user_id) {
        return Err(ControllerError::AccessDenied);
    }
    if desc.min_nodes == 0 {
        return Err(ControllerError::Protocol(
            "min_nodes must be at least 1".to_string(),
        ));
    }
    if desc.min_nodes > part.total_nodes {
        return Err(ControllerError::NodesUnavailable);
    }
    if desc.min_nodes > part.max_nodes {
        return Err(ControllerError::PartitionConfigUnavailable);
    }
    if desc.time_limit != INFINITE_TIME && desc.time_limit > part.max_time {
        return Err(ControllerError::PartitionConfigUnavailable);
    }
    Ok(())
}

/// Turns a validated descriptor into a pending job record.
fn build_job(desc: &JobDescriptor, part: &Partition, auth: AuthInfo, job_id: u32, now: i64) -> Job {
    let priority = if desc.priority != 0 && auth.is_privileged() {
        desc.priority
    } else {
        DEFAULT_PRIORITY
    };
    Job {
        job_id,
        user_id: desc.user_id,
        group_id: desc.group_id,
        name: desc.name.clone(),
        state: JobState::Pending,
        flags: JobFlags::empty(),
        partition: part.name.clone(),
        node_bitmap: None,
        completing_bitmap: None,
        node_cnt: 0,
        num_cpus: desc.min_cpus.max(1),
        min_nodes: desc.min_nodes,
        min_memory: desc.min_memory,
        time_limit: if desc.time_limit == 0 {
            part.max_time
        } else {
            desc.time_limit.min(part.max_time)
        },
        priority,
        shared: desc.shared,
        batch_flag: desc.script.is_some(),
        submit_time: now,
        start_time: 0,
        end_time: 0,
        last_active: now,
        suspend_cnt: 0,
        restart_cnt: 0,
        details: Some(JobDetails {
            req_nodes: desc.req_nodes.clone(),
            script: desc.script.clone(),
            argv: desc.argv.clone(),
            environment: desc.environment.clone(),
            work_dir: desc.work_dir.clone(),
            std_in: desc.std_in.clone(),
            std_out: desc.std_out.clone(),
            std_err: desc.std_err.clone(),
            dependency: desc.dependency.clone(),
        }),
        steps: Vec::new(),
        next_step_id: 0,
    }
}

pub async fn submit_batch_job(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    desc: JobDescriptor,
) -> Result<Body, ControllerError> {
    if desc.script.is_none() {
        return Err(ControllerError::Protocol(
            "batch submission without a script".to_string(),
        ));
    }
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Write,
            node: LockMode::Read,
            part: LockMode::Read,
        })
        .await;
    let now = epoch_now();
    let part = resolve_partition(guard.parts.get(), desc.partition.as_deref())?;
    validate_request(&desc, part, auth)?;

    let job_id = guard.jobs.get_mut().mint_job_id()?;
    let job = build_job(&desc, part, auth, job_id, now);

    if desc.immediate {
        // An immediate request that cannot start right now must leave no
        // trace behind.
        let fast = guard.config.get().config.fast_schedule;
        let pick = state
            .backends
            .select
            .pick(guard.nodes.get(), part, &job, fast);
        if pick.is_none() {
            return Err(ControllerError::NodesUnavailable);
        }
    }

    guard.jobs.get_mut().insert(job)?;
    guard.jobs.get_mut().last_update = now;
    drop(guard);

    metrics::JOBS_SUBMITTED_TOTAL.inc();
    state.sched_kick.notify_one();
    info!(job_id, uid = auth.uid, "batch job submitted");
    Ok(Body::SubmitResponse(SubmitResponse {
        job_id,
        step_id: BATCH_SCRIPT_STEP_ID,
        rc: 0,
    }))
}

pub async fn allocate_resources(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    desc: JobDescriptor,
) -> Result<Body, ControllerError> {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Write,
            node: LockMode::Write,
            part: LockMode::Read,
        })
        .await;
    let now = epoch_now();
    let part = resolve_partition(guard.parts.get(), desc.partition.as_deref())?.clone();
    validate_request(&desc, &part, auth)?;

    let job_id = guard.jobs.get_mut().mint_job_id()?;
    let mut job = build_job(&desc, &part, auth, job_id, now);

    let fast = guard.config.get().config.fast_schedule;
    let pick = if part.state_up {
        state.backends.select.pick(guard.nodes.get(), &part, &job, fast)
    } else {
        None
    };
    match pick {
        Some(bitmap) => {
            ops::allocate_nodes_to_job(guard.nodes.get_mut(), &mut job, bitmap, now);
            let node_list = guard
                .nodes
                .get()
                .bitmap_to_names(job.node_bitmap.as_ref().expect("just allocated"));
            let node_cnt = job.node_cnt;
            state.backends.accounting.job_start(&job);
            guard.jobs.get_mut().insert(job)?;
            guard.jobs.get_mut().last_update = now;
            metrics::JOBS_SUBMITTED_TOTAL.inc();
            metrics::JOBS_STARTED_TOTAL.inc();
            info!(job_id, %node_list, "allocation granted immediately");
            Ok(Body::AllocationResponse(AllocationResponse {
                job_id,
                node_list: Some(node_list),
                node_cnt,
                rc: 0,
            }))
        }
        None if desc.immediate => Err(ControllerError::NodesUnavailable),
        None => {
            guard.jobs.get_mut().insert(job)?;
            guard.jobs.get_mut().last_update = now;
            metrics::JOBS_SUBMITTED_TOTAL.inc();
            state.sched_kick.notify_one();
            debug!(job_id, "allocation queued pending resources");
            Ok(Body::AllocationResponse(AllocationResponse {
                job_id,
                node_list: None,
                node_cnt: 0,
                rc: 0,
            }))
        }
    }
}

pub async fn job_will_run(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    desc: JobDescriptor,
) -> Result<Body, ControllerError> {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Write,
            node: LockMode::Read,
            part: LockMode::Read,
        })
        .await;
    let part = resolve_partition(guard.parts.get(), desc.partition.as_deref())?;
    validate_request(&desc, part, auth)?;
    let probe = build_job(&desc, part, auth, 0, epoch_now());
    let fast = guard.config.get().config.fast_schedule;
    let pick = if part.state_up {
        state
            .backends
            .select
            .pick(guard.nodes.get(), part, &probe, fast)
    } else {
        None
    };
    Ok(Body::WillRunResponse(WillRunResponse {
        runnable: pick.is_some(),
        node_list: pick.map(|bm| guard.nodes.get().bitmap_to_names(&bm)),
    }))
}

/// Queues terminate RPCs to every node of a job's allocation.
fn enqueue_kill(state: &Arc<ControllerState>, nodes: &NodeTable, job: &Job, timelimit: bool) {
    let Some(bm) = job.node_bitmap.as_ref() else {
        return;
    };
    for idx in bm.iter_set() {
        if let Some(node) = nodes.node(idx) {
            let body = if timelimit {
                Body::KillTimelimit(TerminateJob {
                    job_id: job.job_id,
                    timelimit: true,
                })
            } else {
                Body::TerminateJob(TerminateJob {
                    job_id: job.job_id,
                    timelimit: false,
                })
            };
            state.agent.enqueue(AgentRequest::new(
                node.name.clone(),
                format!("{}:{}", node.comm_name, node.port),
                body,
            ));
        }
    }
}

pub async fn cancel_job_step(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: CancelJobStep,
) -> Result<Body, ControllerError> {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Write,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let job = guard
        .jobs
        .get()
        .lookup(req.job_id)
        .ok_or(ControllerError::InvalidJobId(req.job_id))?;
    if !auth.is_privileged() && job.user_id != auth.uid {
        return Err(ControllerError::AccessDenied);
    }

    if req.step_id != NO_VAL {
        // Single-step signal/kill.
        let job = guard.jobs.get_mut().lookup_mut(req.job_id).expect("looked up");
        if job.remove_step(req.step_id) {
            debug!(job_id = req.job_id, step_id = req.step_id, "step cancelled");
        }
        guard.jobs.get_mut().last_update = now;
        return Ok(Body::ReturnCode(ReturnCode { rc: 0 }));
    }

    match job.state {
        JobState::Pending => {
            let job = guard.jobs.get_mut().lookup_mut(req.job_id).expect("looked up");
            job.state = JobState::Cancelled;
            job.end_time = now;
            info!(job_id = req.job_id, "pending job cancelled");
        }
        JobState::Running | JobState::Suspended => {
            let jobs = guard.jobs.get_mut();
            let job = jobs.lookup_mut(req.job_id).expect("looked up");
            ops::begin_job_completion(guard.nodes.get_mut(), job, JobState::Cancelled, now);
            enqueue_kill(state, guard.nodes.get(), job, false);
            state.backends.accounting.job_complete(job);
            metrics::JOBS_COMPLETED_TOTAL.inc();
            info!(job_id = req.job_id, "running job cancelled");
        }
        // Cancelling an already-terminal job is success, not an error.
        _ => debug!(job_id = req.job_id, "cancel of terminal job; no-op"),
    }
    guard.jobs.get_mut().last_update = now;
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn complete_job_allocation(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: CompleteJobAllocation,
) -> Result<Body, ControllerError> {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let jobs = guard.jobs.get_mut();
    let job = jobs
        .lookup_mut(req.job_id)
        .ok_or(ControllerError::InvalidJobId(req.job_id))?;
    if !auth.is_privileged() && job.user_id != auth.uid {
        return Err(ControllerError::AccessDenied);
    }
    if job.state.is_terminal() {
        return Ok(Body::ReturnCode(ReturnCode { rc: 0 }));
    }
    if job.is_pending() {
        return Err(ControllerError::JobPending);
    }
    let new_state = if req.job_rc == 0 {
        JobState::Complete
    } else {
        JobState::Failed
    };
    ops::begin_job_completion(guard.nodes.get_mut(), job, new_state, now);
    state.backends.accounting.job_complete(job);
    metrics::JOBS_COMPLETED_TOTAL.inc();
    jobs.last_update = now;
    info!(job_id = req.job_id, state = %new_state, "job allocation completed");
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn complete_batch_script(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: CompleteBatchScript,
) -> Result<Body, ControllerError> {
    if !auth.is_privileged() {
        // Only worker daemons report batch completion.
        return Err(ControllerError::AccessDenied);
    }
    let mut guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let node_idx = guard
        .nodes
        .get()
        .lookup(&req.node_name)
        .ok_or_else(|| ControllerError::InvalidNodeName(req.node_name.clone()))?;
    let job = guard
        .jobs
        .get()
        .lookup(req.job_id)
        .ok_or(ControllerError::InvalidJobId(req.job_id))?;
    if job.state.is_terminal() {
        return Ok(Body::ReturnCode(ReturnCode { rc: 0 }));
    }
    if !job.batch_flag {
        return Err(ControllerError::InvalidJobState(
            "not a batch job".to_string(),
        ));
    }

    if req.worker_rc != 0 {
        // The node failed to run the script: drain it, and give the job
        // another chance elsewhere while it has requeues left.
        warn!(
            job_id = req.job_id,
            node = %req.node_name,
            worker_rc = req.worker_rc,
            "batch script failed on node"
        );
        let requeue = {
            let job = guard.jobs.get().lookup(req.job_id).expect("looked up");
            job.batch_flag && job.restart_cnt < MAX_BATCH_REQUEUE
        };
        ops::set_node_state(
            guard.nodes.get_mut(),
            guard.jobs.get_mut(),
            node_idx,
            RequestedNodeState::Drain,
            Some("batch failure".to_string()),
            now,
        )?;
        let jobs = guard.jobs.get_mut();
        let job = jobs.lookup_mut(req.job_id).expect("looked up");
        if requeue {
            ops::requeue_job(guard.nodes.get_mut(), job, now);
            state.sched_kick.notify_one();
        } else {
            ops::begin_job_completion(guard.nodes.get_mut(), job, JobState::Failed, now);
            state.backends.accounting.job_complete(job);
            metrics::JOBS_COMPLETED_TOTAL.inc();
        }
        jobs.last_update = now;
        return Ok(Body::ReturnCode(ReturnCode { rc: 0 }));
    }

    let new_state = if req.job_rc == 0 {
        JobState::Complete
    } else {
        JobState::Failed
    };
    let jobs = guard.jobs.get_mut();
    let job = jobs.lookup_mut(req.job_id).expect("looked up");
    ops::begin_job_completion(guard.nodes.get_mut(), job, new_state, now);
    state.backends.accounting.job_complete(job);
    metrics::JOBS_COMPLETED_TOTAL.inc();
    jobs.last_update = now;
    info!(job_id = req.job_id, state = %new_state, "batch script completed");
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn job_step_create(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: JobStepCreate,
) -> Result<Body, ControllerError> {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let nodes = guard.nodes.get();
    let jobs = guard.jobs.get_mut();
    let job = jobs
        .lookup_mut(req.job_id)
        .ok_or(ControllerError::InvalidJobId(req.job_id))?;
    if !auth.is_privileged() && job.user_id != auth.uid {
        return Err(ControllerError::AccessDenied);
    }
    if job.is_held() {
        return Err(ControllerError::JobHeld);
    }
    if job.is_pending() {
        return Err(ControllerError::JobPending);
    }
    if job.state != JobState::Running {
        return Err(ControllerError::InvalidJobState(job.state.to_string()));
    }
    let alloc = job
        .node_bitmap
        .clone()
        .ok_or_else(|| ControllerError::Internal("running job without allocation".to_string()))?;

    // Step membership defaults to the whole allocation and may be any
    // subset of it.
    let step_bitmap = match req.node_list.as_deref() {
        None => alloc.clone(),
        Some(expr) => {
            let mut bm = Bitmap::with_size(nodes.len());
            for name in hostlist::expand(expr)? {
                let idx = nodes
                    .lookup(&name)
                    .ok_or_else(|| ControllerError::InvalidNodeName(name.clone()))?;
                bm.set(idx);
            }
            if !bm.is_subset_of(&alloc) {
                return Err(ControllerError::RequestedNodesBusy);
            }
            bm
        }
    };

    let step_id = job.next_step_id;
    job.next_step_id += 1;

    // Per-node task layout: round-robin of the requested task count.
    let node_cnt = step_bitmap.count();
    let task_count = req.task_count.max(1);
    let mut tasks_per_node = vec![task_count / node_cnt as u32; node_cnt];
    for slot in tasks_per_node
        .iter_mut()
        .take((task_count as usize) % node_cnt)
    {
        *slot += 1;
    }

    // Core bitmap indexed by the job's allocation: one run of bits per
    // allocated node, in allocation order.
    let alloc_cpu_total: u32 = alloc
        .iter_set()
        .filter_map(|i| nodes.node(i))
        .map(|n| n.config_cpus)
        .sum();
    let mut core_bitmap = Bitmap::with_size(alloc_cpu_total as usize);
    let mut cursor = 0usize;
    for idx in alloc.iter_set() {
        let cpus = nodes.node(idx).map(|n| n.config_cpus).unwrap_or(0) as usize;
        if step_bitmap.test(idx) {
            let claim = cpus.min(req.cpu_count.max(1) as usize);
            for bit in cursor..cursor + claim {
                core_bitmap.set(bit);
            }
        }
        cursor += cpus;
    }

    let node_list = nodes.bitmap_to_names(&step_bitmap);
    let job_user_id = job.user_id;
    job.steps.push(JobStep {
        step_id,
        node_bitmap: step_bitmap,
        cpu_count: req.cpu_count,
        mem_per_task: req.mem_per_task,
        tasks_per_node,
        core_bitmap: core_bitmap.clone(),
    });
    job.last_active = now;
    jobs.last_update = now;

    let credential = state.backends.cred.sign_step(&StepCredential {
        job_id: req.job_id,
        step_id,
        user_id: job_user_id,
        mem_per_task: req.mem_per_task,
        node_list: node_list.clone(),
        core_bitmap,
    });
    info!(job_id = req.job_id, step_id, %node_list, "step created");
    Ok(Body::StepCreateResponse(StepCreateResponse {
        job_id: req.job_id,
        step_id,
        node_list,
        credential,
    }))
}

pub async fn step_complete(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: StepComplete,
) -> Result<Body, ControllerError> {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let jobs = guard.jobs.get_mut();
    let job = jobs
        .lookup_mut(req.job_id)
        .ok_or(ControllerError::InvalidJobId(req.job_id))?;
    if !auth.is_privileged() && job.user_id != auth.uid {
        return Err(ControllerError::AccessDenied);
    }
    let Some(step) = job.step(req.step_id) else {
        // Partial completions can arrive after the final one removed the
        // step; that is not an error.
        return Ok(Body::ReturnCode(ReturnCode { rc: 0 }));
    };
    let final_range = req.range_last as usize + 1 >= step.node_bitmap.count();
    if final_range {
        job.remove_step(req.step_id);
        debug!(job_id = req.job_id, step_id = req.step_id, "step completed");
    }
    job.last_active = now;
    jobs.last_update = now;
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}

pub async fn epilog_complete(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: EpilogComplete,
) -> Result<Body, ControllerError> {
    if !auth.is_privileged() {
        return Err(ControllerError::AccessDenied);
    }
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Write,
            node: LockMode::Write,
            ..LockRequest::none()
        })
        .await;
    let now = epoch_now();
    let node_idx = guard
        .nodes
        .get()
        .lookup(&req.node_name)
        .ok_or_else(|| ControllerError::InvalidNodeName(req.node_name.clone()))?;
    if let Some(node) = guard.nodes.get_mut().node_mut(node_idx) {
        node.last_response = now;
    }
    let jobs = guard.jobs.get_mut();
    let Some(job) = jobs.lookup_mut(req.job_id) else {
        // The job may already have been purged; the epilog is still good news.
        return Ok(Body::ReturnCode(ReturnCode { rc: 0 }));
    };
    if req.epilog_rc != 0 {
        warn!(
            job_id = req.job_id,
            node = %req.node_name,
            epilog_rc = req.epilog_rc,
            "epilog failed"
        );
    }
    let done = ops::epilog_complete(guard.nodes.get_mut(), job, node_idx, now)?;
    if done {
        state.sched_kick.notify_one();
    }
    jobs.last_update = now;
    Ok(Body::ReturnCode(ReturnCode { rc: 0 }))
}
