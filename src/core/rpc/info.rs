// src/core/rpc/info.rs

//! Read-only information RPCs: build-info, job-info, node-info,
//! partition-info.
//!
//! Conditional serving: a request carrying `last_update = T` gets
//! `no-change-in-data` when the entity table has not advanced past `T`.
//! Privacy: when a category is listed in `private_data`, non-privileged
//! callers see only entries they own (jobs) or nothing hidden (partitions).

use crate::config::PrivateData;
use crate::core::ControllerError;
use crate::core::backends::auth::AuthInfo;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::protocol::message::{
    Body, BuildInfo, InfoRequest, JobInfoRecord, JobInfoResponse, NodeInfoRecord,
    NodeInfoResponse, PartInfoRecord, PartInfoResponse,
};
use crate::core::state::ControllerState;
use crate::core::state::job::Job;
use crate::core::state::node::NodeTable;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn build_info(
    state: &Arc<ControllerState>,
    _auth: AuthInfo,
    req: InfoRequest,
) -> Result<Body, ControllerError> {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            part: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let config_table = guard.config.get();
    if req.last_update > 0 && config_table.last_update <= req.last_update {
        return Err(ControllerError::NoChangeInData);
    }
    let c = &config_table.config;
    Ok(Body::BuildInfoResponse(Box::new(BuildInfo {
        version: VERSION.to_string(),
        control_hosts: c.control_hosts.clone(),
        port: c.port,
        state_save_location: c.state_save_location.clone(),
        auth_type: c.auth_type.clone(),
        sched_type: c.sched_type.clone(),
        select_type: c.select_type.clone(),
        heartbeat_interval: c.heartbeat_interval.as_secs() as u32,
        controller_timeout: c.controller_timeout.as_secs() as u32,
        worker_timeout: c.worker_timeout.as_secs() as u32,
        batch_start_timeout: c.batch_start_timeout.as_secs() as u32,
        msg_timeout: c.msg_timeout.as_secs() as u32,
        tree_width: c.tree_width,
        first_job_id: c.first_job_id,
        fast_schedule: c.fast_schedule,
        partitions: guard.parts.get().parts.keys().cloned().collect(),
    })))
}

fn job_record(job: &Job, nodes: &NodeTable) -> JobInfoRecord {
    JobInfoRecord {
        job_id: job.job_id,
        user_id: job.user_id,
        group_id: job.group_id,
        name: job.name.clone(),
        state: job.state as u16,
        state_flags: job.flags.bits(),
        partition: job.partition.clone(),
        nodes: job.node_bitmap.as_ref().map(|bm| nodes.bitmap_to_names(bm)),
        node_cnt: job.node_cnt,
        num_cpus: job.num_cpus,
        time_limit: job.time_limit,
        priority: job.priority,
        submit_time: job.submit_time,
        start_time: job.start_time,
        end_time: job.end_time,
        batch_flag: job.batch_flag,
    }
}

pub async fn job_info(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: InfoRequest,
    single: Option<u32>,
) -> Result<Body, ControllerError> {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Read,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let jobs = guard.jobs.get();
    let nodes = guard.nodes.get();
    let private = guard
        .config
        .get()
        .config
        .private_data
        .contains(PrivateData::JOBS);

    if single.is_none() && req.last_update > 0 && jobs.last_update <= req.last_update {
        return Err(ControllerError::NoChangeInData);
    }

    let visible = |job: &Job| !private || auth.is_privileged() || job.user_id == auth.uid;

    let records: Vec<JobInfoRecord> = match single {
        Some(job_id) => {
            let job = jobs
                .lookup(job_id)
                .ok_or(ControllerError::InvalidJobId(job_id))?;
            if !visible(job) {
                // Filtered reads surface as access-denied, not not-found.
                return Err(ControllerError::AccessDenied);
            }
            vec![job_record(job, nodes)]
        }
        None => jobs
            .sorted_ids()
            .into_iter()
            .filter_map(|id| jobs.lookup(id))
            .filter(|j| visible(j))
            .map(|j| job_record(j, nodes))
            .collect(),
    };
    Ok(Body::JobInfoResponse(JobInfoResponse {
        last_update: jobs.last_update,
        jobs: records,
    }))
}

pub async fn node_info(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: InfoRequest,
) -> Result<Body, ControllerError> {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let nodes = guard.nodes.get();
    let private = guard
        .config
        .get()
        .config
        .private_data
        .contains(PrivateData::NODES);
    if private && !auth.is_privileged() {
        return Err(ControllerError::AccessDenied);
    }
    if req.last_update > 0 && nodes.last_update <= req.last_update {
        return Err(ControllerError::NoChangeInData);
    }
    let records = nodes
        .nodes
        .iter()
        .map(|n| NodeInfoRecord {
            name: n.name.clone(),
            state: n.state as u16,
            flags: n.flags.bits(),
            cpus: n.config_cpus,
            real_memory: n.config_memory,
            tmp_disk: n.config_tmp_disk,
            weight: n.weight,
            features: n.features.clone(),
            reason: n.reason.clone(),
        })
        .collect();
    Ok(Body::NodeInfoResponse(NodeInfoResponse {
        last_update: nodes.last_update,
        nodes: records,
    }))
}

pub async fn partition_info(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    req: InfoRequest,
) -> Result<Body, ControllerError> {
    let guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            part: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let parts = guard.parts.get();
    let private = guard
        .config
        .get()
        .config
        .private_data
        .contains(PrivateData::PARTITIONS);
    if req.last_update > 0 && parts.last_update <= req.last_update {
        return Err(ControllerError::NoChangeInData);
    }
    let records = parts
        .parts
        .values()
        .filter(|p| {
            if p.hidden && !auth.is_privileged() {
                return false;
            }
            !private || auth.is_privileged() || p.permits_user(auth.uid)
        })
        .map(|p| PartInfoRecord {
            name: p.name.clone(),
            nodes: p.node_list.clone(),
            state_up: p.state_up,
            default_part: p.default_part,
            hidden: p.hidden,
            root_only: p.root_only,
            shared: crate::core::persistence::saver::shared_policy_to_u8(p.shared) as u16,
            max_time: p.max_time,
            min_nodes: p.min_nodes,
            max_nodes: p.max_nodes,
            total_nodes: p.total_nodes,
            total_cpus: p.total_cpus,
            allow_groups: p.allow_groups.as_ref().map(|g| g.join(",")),
        })
        .collect();
    Ok(Body::PartInfoResponse(PartInfoResponse {
        last_update: parts.last_update,
        partitions: records,
    }))
}
