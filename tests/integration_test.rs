//! End-to-end scenarios driven through the RPC handlers against a real
//! state store, including save/restore and the standby listener.

use beryld::config::Config;
use beryld::core::backends::auth::AuthInfo;
use beryld::core::failover::client::PeerClient;
use beryld::core::failover::listener::run_listener;
use beryld::core::locks::{LockMode, LockRequest};
use beryld::core::persistence::saver;
use beryld::core::protocol::message::{
    Body, CancelJobStep, CompleteBatchScript, EpilogComplete, InfoRequest, JobDescriptor, Message,
    NO_VAL, SharedPref, UpdateNode,
};
use beryld::core::readconfig;
use beryld::core::rpc;
use beryld::core::sched::SchedContext;
use beryld::core::state::ControllerState;
use beryld::core::state::job::JobState;
use beryld::core::state::node::BaseState;
use beryld::core::state::ops;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ROOT: AuthInfo = AuthInfo { uid: 0, gid: 0 };

fn cluster_toml(dir: &Path, nodes: &str, partition_extra: &str) -> String {
    let key = dir.join("beryl.key");
    std::fs::write(&key, b"0123456789abcdef0123456789abcdef").unwrap();
    let save = dir.join("state");
    format!(
        r#"
control_hosts = ["ctl0", "ctl1"]
auth_type = "none"
cred_key_path = '{key}'
state_save_location = '{save}'

[[node]]
names = "{nodes}"
cpus = 4

[[partition]]
name = "p1"
nodes = "{nodes}"
default = true
{partition_extra}
"#,
        key = key.display(),
        save = save.display()
    )
}

async fn make_state(dir: &Path, nodes: &str, partition_extra: &str) -> Arc<ControllerState> {
    let toml = cluster_toml(dir, nodes, partition_extra);
    let config = Config::from_str(&toml).unwrap();
    let state =
        ControllerState::initialize(config.clone(), "beryl.toml".to_string(), 0, "ctl0".to_string())
            .unwrap();
    readconfig::reconfigure(&state, 0, Some(config)).await.unwrap();
    state
}

fn batch_descriptor(min_nodes: u32, immediate: bool) -> JobDescriptor {
    JobDescriptor {
        user_id: 1000,
        group_id: 1000,
        name: Some("test".to_string()),
        partition: Some("p1".to_string()),
        min_nodes,
        min_cpus: 1,
        min_memory: 0,
        time_limit: 0,
        priority: 0,
        shared: SharedPref::PartitionDefault,
        immediate,
        req_nodes: None,
        script: Some("#!/bin/sh\nsleep 0\n".to_string()),
        argv: Vec::new(),
        environment: Vec::new(),
        work_dir: None,
        std_in: None,
        std_out: None,
        std_err: None,
        dependency: Vec::new(),
    }
}

async fn schedule_pass(state: &Arc<ControllerState>) -> usize {
    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Read,
            job: LockMode::Write,
            node: LockMode::Write,
            part: LockMode::Read,
        })
        .await;
    let fast = guard.config.get().config.fast_schedule;
    let mut ctx = SchedContext {
        jobs: guard.jobs.get_mut(),
        nodes: guard.nodes.get_mut(),
        parts: guard.parts.get(),
        fast_schedule: fast,
        now: ops::epoch_now(),
    };
    state
        .backends
        .sched
        .lock()
        .schedule(&mut ctx, state.backends.select.as_ref())
}

async fn submit(state: &Arc<ControllerState>, desc: JobDescriptor) -> Result<u32, u32> {
    match rpc::job::submit_batch_job(state, ROOT, desc).await {
        Ok(Body::SubmitResponse(resp)) => Ok(resp.job_id),
        Ok(other) => panic!("unexpected reply {:?}", other.msg_type()),
        Err(e) => Err(e.wire_code()),
    }
}

#[tokio::test]
async fn test_submit_allocate_complete_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "").await;

    let job_id = submit(&state, batch_descriptor(1, false)).await.unwrap();
    assert_eq!(job_id, 1);
    assert_eq!(schedule_pass(&state).await, 1);

    let node_name = {
        let guard = state
            .locks
            .acquire(LockRequest {
                job: LockMode::Read,
                node: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        let job = guard.jobs.get().lookup(1).unwrap();
        assert_eq!(job.state, JobState::Running);
        let bm = job.node_bitmap.as_ref().unwrap();
        assert_eq!(bm.count(), 1);
        guard.nodes.get().bitmap_to_names(bm)
    };

    rpc::job::complete_batch_script(
        &state,
        ROOT,
        CompleteBatchScript {
            job_id: 1,
            worker_rc: 0,
            job_rc: 0,
            node_name: node_name.clone(),
        },
    )
    .await
    .unwrap();

    rpc::job::epilog_complete(
        &state,
        ROOT,
        EpilogComplete {
            job_id: 1,
            node_name: node_name.clone(),
            epilog_rc: 0,
        },
    )
    .await
    .unwrap();

    let guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Read,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let job = guard.jobs.get().lookup(1).unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert!(!job.is_completing());
    let nodes = guard.nodes.get();
    let idx = nodes.lookup(&node_name).unwrap();
    assert_eq!(nodes.node(idx).unwrap().state, BaseState::Idle);
    assert_eq!(nodes.node(idx).unwrap().run_job_cnt, 0);
    assert_eq!(nodes.idle_bitmap.count(), 2);
    ops::check_invariants(nodes, guard.jobs.get()).unwrap();
}

#[tokio::test]
async fn test_cancel_pending_job_in_down_partition() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "state_up = false").await;

    let job_id = submit(&state, batch_descriptor(1, false)).await.unwrap();
    assert_eq!(schedule_pass(&state).await, 0);

    rpc::job::cancel_job_step(
        &state,
        ROOT,
        CancelJobStep {
            job_id,
            step_id: NO_VAL,
            signal: 9,
        },
    )
    .await
    .unwrap();

    let guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Read,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let job = guard.jobs.get().lookup(job_id).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.node_bitmap.is_none());
    assert_eq!(guard.nodes.get().idle_bitmap.count(), 2);

    // Cancelling a terminal job is idempotent success.
    drop(guard);
    rpc::job::cancel_job_step(
        &state,
        ROOT,
        CancelJobStep {
            job_id,
            step_id: NO_VAL,
            signal: 9,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_drained_node_blocks_immediate_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "").await;

    rpc::admin::update_node(
        &state,
        ROOT,
        UpdateNode {
            node_names: "n1".to_string(),
            state: 100,
            reason: Some("maintenance".to_string()),
        },
    )
    .await
    .unwrap();

    // Two nodes cannot be had immediately; no job record may remain.
    let err = submit(&state, batch_descriptor(2, true)).await.unwrap_err();
    assert_eq!(err, 1404);
    {
        let guard = state
            .locks
            .acquire(LockRequest {
                job: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        assert_eq!(guard.jobs.get().len(), 0);
    }

    // A one-node request lands on the remaining node.
    let job_id = submit(&state, batch_descriptor(1, false)).await.unwrap();
    assert_eq!(schedule_pass(&state).await, 1);
    let guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Read,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let job = guard.jobs.get().lookup(job_id).unwrap();
    let nodes = guard.nodes.get();
    let n2 = nodes.lookup("n2").unwrap();
    assert!(job.node_bitmap.as_ref().unwrap().test(n2));
    let n1 = nodes.lookup("n1").unwrap();
    assert!(!job.node_bitmap.as_ref().unwrap().test(n1));
}

#[tokio::test]
async fn test_reconfigure_preserves_running_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "").await;

    let job_id = submit(&state, batch_descriptor(1, false)).await.unwrap();
    assert_eq!(schedule_pass(&state).await, 1);

    // Grow the cluster to three nodes and reconfigure in place.
    let new_toml = cluster_toml(dir.path(), "n[1-3]", "");
    let new_config = Config::from_str(&new_toml).unwrap();
    readconfig::reconfigure(&state, 0, Some(new_config)).await.unwrap();

    let guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Read,
            node: LockMode::Read,
            part: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let job = guard.jobs.get().lookup(job_id).unwrap();
    assert_eq!(job.state, JobState::Running);

    let nodes = guard.nodes.get();
    assert_eq!(nodes.len(), 3);
    let n1 = nodes.lookup("n1").unwrap();
    assert_eq!(nodes.node(n1).unwrap().run_job_cnt, 1);
    let n3 = nodes.lookup("n3").unwrap();
    assert_eq!(nodes.node(n3).unwrap().state, BaseState::Idle);

    let part = guard.parts.get().lookup("p1").unwrap();
    assert!(part.node_bitmap.test(n3));
    assert_eq!(part.total_nodes, 3);
    ops::check_invariants(nodes, guard.jobs.get()).unwrap();
}

#[tokio::test]
async fn test_save_and_full_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "").await;

    let job_id = submit(&state, batch_descriptor(1, false)).await.unwrap();
    assert_eq!(schedule_pass(&state).await, 1);
    saver::save_all(&state).await.unwrap();

    // A second controller instance recovers everything from the shared
    // state directory.
    let toml = cluster_toml(dir.path(), "n[1-2]", "");
    let config = Config::from_str(&toml).unwrap();
    let standby = ControllerState::initialize(
        config.clone(),
        "beryl.toml".to_string(),
        1,
        "ctl1".to_string(),
    )
    .unwrap();
    readconfig::reconfigure(&standby, 2, Some(config)).await.unwrap();

    let guard = standby
        .locks
        .acquire(LockRequest {
            job: LockMode::Read,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let job = guard.jobs.get().lookup(job_id).unwrap();
    assert_eq!(job.state, JobState::Running);
    let nodes = guard.nodes.get();
    let n1 = nodes.lookup("n1").unwrap();
    assert_eq!(nodes.node(n1).unwrap().run_job_cnt, 1);
    assert_eq!(nodes.node(n1).unwrap().state, BaseState::Allocated);
    ops::check_invariants(nodes, guard.jobs.get()).unwrap();
}

#[tokio::test]
async fn test_dispatch_ping_and_unknown_job() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "").await;

    let reply = rpc::dispatch(&state, Message::new(Body::Ping)).await;
    match reply.body {
        Body::ReturnCode(rc) => assert_eq!(rc.rc, 0),
        other => panic!("unexpected reply {:?}", other.msg_type()),
    }

    let reply = rpc::dispatch(&state, Message::new(Body::JobInfoSingleRequest(404))).await;
    match reply.body {
        Body::ReturnCode(rc) => assert_eq!(rc.rc, 1001),
        other => panic!("unexpected reply {:?}", other.msg_type()),
    }
}

#[tokio::test]
async fn test_lock_snapshot_detects_held_locks() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path(), "n[1-2]", "").await;

    assert!(state.locks.snapshot().is_clear());
    let guard = state
        .locks
        .acquire(LockRequest {
            job: LockMode::Write,
            node: LockMode::Read,
            ..LockRequest::none()
        })
        .await;
    let snapshot = state.locks.snapshot();
    assert!(!snapshot.is_clear());
    assert_eq!(snapshot.job.writers, 1);
    assert_eq!(snapshot.node.readers, 1);
    drop(guard);
    assert!(state.locks.snapshot().is_clear());
}

#[tokio::test]
async fn test_standby_listener_whitelist() {
    let dir = tempfile::tempdir().unwrap();
    let toml = cluster_toml(dir.path(), "n[1-2]", "");
    let config = Config::from_str(&toml).unwrap();
    let state = ControllerState::initialize(
        config.clone(),
        "beryl.toml".to_string(),
        1,
        "ctl1".to_string(),
    )
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(run_listener(state.clone(), listener));

    let timeout = Duration::from_secs(2);

    // Whitelisted: control-status answers with our standby identity.
    let mut client = PeerClient::connect(&addr, Bytes::new(), timeout).await.unwrap();
    let status = client.control_status(timeout).await.unwrap();
    assert_eq!(status.control_time, 0);
    assert_eq!(status.backup_inx, 1);

    // Not whitelisted: job info is refused with in-standby-mode.
    let mut client = PeerClient::connect(&addr, Bytes::new(), timeout).await.unwrap();
    let rc = client
        .send_simple(Body::JobInfoRequest(InfoRequest::default()), timeout)
        .await
        .unwrap();
    assert_eq!(rc, 1201);

    // `control` against a standby is refused as disabled.
    let mut client = PeerClient::connect(&addr, Bytes::new(), timeout).await.unwrap();
    let rc = client.send_simple(Body::Control, timeout).await.unwrap();
    assert_eq!(rc, 1801);

    state.request_shutdown();
    state.shutdown_notify.notify_waiters();
}
