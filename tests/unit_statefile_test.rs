use beryld::core::bitmap::Bitmap;
use beryld::core::persistence::{heartbeat, loader, saver, statefile};
use beryld::core::protocol::message::SharedPref;
use beryld::core::state::job::{Job, JobDetails, JobFlags, JobState, JobTable};
use beryld::core::state::node::{BaseState, Node, NodeFlags, NodeTable};
use beryld::core::state::partition::{PartTable, Partition};
use beryld::core::state::trigger::{TriggerKind, TriggerTable};
use beryld::config::SharedPolicy;
use std::fs;

fn make_node(name: &str) -> Node {
    Node {
        name: name.to_string(),
        comm_name: name.to_string(),
        port: 6818,
        state: BaseState::Idle,
        flags: NodeFlags::empty(),
        config_cpus: 4,
        config_memory: 16_000,
        config_tmp_disk: 0,
        reported_cpus: 0,
        reported_memory: 0,
        reported_tmp_disk: 0,
        weight: 1,
        features: None,
        run_job_cnt: 0,
        comp_job_cnt: 0,
        no_share_job_cnt: 0,
        last_response: 0,
        reason: None,
        config_idx: 0,
        partitions: vec![0],
    }
}

fn make_table(count: usize) -> NodeTable {
    let mut table = NodeTable::default();
    for i in 1..=count {
        table.nodes.push(make_node(&format!("n{i}")));
    }
    table.rebuild_hash();
    table.sync_bitmaps();
    table
}

#[test]
fn test_state_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    statefile::write_state_file(dir.path(), "test_state", 12345, b"payload bytes").unwrap();
    let (ts, payload) = statefile::read_state_file(dir.path(), "test_state").unwrap();
    assert_eq!(ts, 12345);
    assert_eq!(&payload[..], b"payload bytes");
}

#[test]
fn test_missing_file_reads_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(statefile::read_state_file(dir.path(), "absent").is_none());
}

#[test]
fn test_corrupt_file_reads_none() {
    let dir = tempfile::tempdir().unwrap();
    statefile::write_state_file(dir.path(), "test_state", 1, b"payload").unwrap();
    let path = dir.path().join("test_state");
    let mut bytes = fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&path, bytes).unwrap();
    assert!(statefile::read_state_file(dir.path(), "test_state").is_none());
}

#[test]
fn test_rewrite_keeps_previous_as_old() {
    let dir = tempfile::tempdir().unwrap();
    statefile::write_state_file(dir.path(), "test_state", 1, b"first").unwrap();
    statefile::write_state_file(dir.path(), "test_state", 2, b"second").unwrap();

    let (_, current) = statefile::read_state_file(dir.path(), "test_state").unwrap();
    assert_eq!(&current[..], b"second");
    let (_, old) = statefile::read_state_file(dir.path(), "test_state.old").unwrap();
    assert_eq!(&old[..], b"first");
    // No working file left behind.
    assert!(!dir.path().join("test_state.new").exists());
}

#[test]
fn test_heartbeat_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    assert!(heartbeat::read_heartbeat(dir.path()).is_none());
    heartbeat::write_heartbeat(dir.path(), 1, 999).unwrap();
    let hb = heartbeat::read_heartbeat(dir.path()).unwrap();
    assert_eq!(hb.timestamp, 999);
    assert_eq!(hb.server_inx, 1);
}

#[test]
fn test_save_load_restores_tables() {
    let dir = tempfile::tempdir().unwrap();

    // Source tables: one drained node, one running job with details, an
    // armed trigger, a tweaked partition.
    let mut nodes = make_table(2);
    nodes.nodes[0].flags.insert(NodeFlags::DRAIN);
    nodes.nodes[0].reason = Some("disk errors".to_string());
    nodes.nodes[1].state = BaseState::Allocated;
    nodes.nodes[1].run_job_cnt = 1;
    nodes.nodes[1].reported_cpus = 8;
    nodes.sync_bitmaps();

    let mut parts = PartTable::default();
    let mut bitmap = Bitmap::with_size(2);
    bitmap.set(0);
    bitmap.set(1);
    parts.parts.insert(
        "batch".to_string(),
        Partition {
            name: "batch".to_string(),
            node_list: "n[1-2]".to_string(),
            node_bitmap: bitmap,
            min_nodes: 1,
            max_nodes: u32::MAX,
            max_time: 120,
            root_only: false,
            hidden: false,
            shared: SharedPolicy::No,
            state_up: false,
            default_part: true,
            allow_groups: None,
            allow_uids: Vec::new(),
            total_nodes: 2,
            total_cpus: 8,
        },
    );

    let mut jobs = JobTable::new(1, 1000);
    let mut job_bitmap = Bitmap::with_size(2);
    job_bitmap.set(1);
    jobs.insert(Job {
        job_id: 7,
        user_id: 1000,
        group_id: 1000,
        name: Some("sim".to_string()),
        state: JobState::Running,
        flags: JobFlags::empty(),
        partition: "batch".to_string(),
        node_bitmap: Some(job_bitmap),
        completing_bitmap: None,
        node_cnt: 1,
        num_cpus: 4,
        min_nodes: 1,
        min_memory: 2048,
        time_limit: 60,
        priority: 100,
        shared: SharedPref::Exclusive,
        batch_flag: true,
        submit_time: 500,
        start_time: 600,
        end_time: 0,
        last_active: 600,
        suspend_cnt: 0,
        restart_cnt: 1,
        details: Some(JobDetails {
            req_nodes: None,
            script: Some("#!/bin/sh\nexit 0\n".to_string()),
            argv: vec!["job".to_string()],
            environment: vec!["HOME=/home/u".to_string()],
            work_dir: Some("/home/u".to_string()),
            std_in: None,
            std_out: Some("out".to_string()),
            std_err: None,
            dependency: vec![3],
        }),
        steps: Vec::new(),
        next_step_id: 2,
    })
    .unwrap();
    jobs.next_job_id = 8;

    let mut triggers = TriggerTable::default();
    triggers.arm(TriggerKind::NodeDown, "n1".to_string());

    saver::save_nodes(dir.path(), 1000, &nodes).unwrap();
    saver::save_partitions(dir.path(), 1000, &parts).unwrap();
    saver::save_jobs(dir.path(), 1000, &jobs, &nodes).unwrap();
    saver::save_triggers(dir.path(), 1000, &triggers).unwrap();

    // Fresh tables as the config loader would build them.
    let mut new_nodes = make_table(2);
    let mut new_parts = PartTable::default();
    let mut part_bitmap = Bitmap::with_size(2);
    part_bitmap.set(0);
    part_bitmap.set(1);
    new_parts.parts.insert(
        "batch".to_string(),
        Partition {
            name: "batch".to_string(),
            node_list: "n[1-2]".to_string(),
            node_bitmap: part_bitmap,
            min_nodes: 1,
            max_nodes: u32::MAX,
            max_time: u32::MAX,
            root_only: false,
            hidden: false,
            shared: SharedPolicy::No,
            state_up: true,
            default_part: true,
            allow_groups: None,
            allow_uids: Vec::new(),
            total_nodes: 2,
            total_cpus: 8,
        },
    );
    let mut new_jobs = JobTable::new(1, 1000);
    let mut new_triggers = TriggerTable::default();

    loader::load_all(
        dir.path(),
        2,
        &mut new_nodes,
        &mut new_jobs,
        &mut new_parts,
        &mut new_triggers,
    )
    .unwrap();

    assert!(new_nodes.nodes[0].flags.contains(NodeFlags::DRAIN));
    assert_eq!(new_nodes.nodes[0].reason.as_deref(), Some("disk errors"));
    assert_eq!(new_nodes.nodes[1].state, BaseState::Allocated);
    assert_eq!(new_nodes.nodes[1].reported_cpus, 8);

    let part = new_parts.lookup("batch").unwrap();
    assert!(!part.state_up);
    assert_eq!(part.max_time, 120);

    let job = new_jobs.lookup(7).unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.restart_cnt, 1);
    assert_eq!(job.min_memory, 2048);
    assert!(job.node_bitmap.as_ref().unwrap().test(1));
    assert_eq!(
        job.details.as_ref().unwrap().script.as_deref(),
        Some("#!/bin/sh\nexit 0\n")
    );
    assert_eq!(job.details.as_ref().unwrap().dependency, vec![3]);
    assert_eq!(new_jobs.next_job_id, 8);

    assert_eq!(new_triggers.triggers.len(), 1);
    assert_eq!(new_triggers.triggers[0].kind, TriggerKind::NodeDown);
}

#[test]
fn test_recovery_level_one_keeps_admin_state_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = make_table(2);
    nodes.nodes[0].state = BaseState::Down;
    nodes.nodes[0].reason = Some("bad dimm".to_string());
    nodes.nodes[1].state = BaseState::Allocated;
    nodes.nodes[1].run_job_cnt = 1;
    nodes.nodes[1].reported_cpus = 8;
    saver::save_nodes(dir.path(), 100, &nodes).unwrap();

    let mut fresh = make_table(2);
    let mut jobs = JobTable::new(1, 100);
    let mut parts = PartTable::default();
    let mut triggers = TriggerTable::default();
    loader::load_all(dir.path(), 1, &mut fresh, &mut jobs, &mut parts, &mut triggers).unwrap();

    // Down state and reason survive; dynamic detail does not.
    assert_eq!(fresh.nodes[0].state, BaseState::Down);
    assert_eq!(fresh.nodes[0].reason.as_deref(), Some("bad dimm"));
    assert_eq!(fresh.nodes[1].state, BaseState::Idle);
    assert_eq!(fresh.nodes[1].reported_cpus, 0);
}

#[test]
fn test_job_claiming_unknown_node_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = make_table(2);
    let mut jobs = JobTable::new(1, 100);
    let mut bm = Bitmap::with_size(2);
    bm.set(1);
    let mut job = Job {
        job_id: 9,
        user_id: 0,
        group_id: 0,
        name: None,
        state: JobState::Running,
        flags: JobFlags::empty(),
        partition: "batch".to_string(),
        node_bitmap: Some(bm),
        completing_bitmap: None,
        node_cnt: 1,
        num_cpus: 1,
        min_nodes: 1,
        min_memory: 0,
        time_limit: 60,
        priority: 1,
        shared: SharedPref::PartitionDefault,
        batch_flag: false,
        submit_time: 1,
        start_time: 2,
        end_time: 0,
        last_active: 2,
        suspend_cnt: 0,
        restart_cnt: 0,
        details: None,
        steps: Vec::new(),
        next_step_id: 0,
    };
    job.node_bitmap = Some({
        let mut bm = Bitmap::with_size(2);
        bm.set(1);
        bm
    });
    jobs.insert(job).unwrap();
    saver::save_jobs(dir.path(), 100, &jobs, &nodes).unwrap();

    // A one-node cluster cannot host a job that ran on "n2".
    let mut small = make_table(1);
    let mut new_jobs = JobTable::new(1, 100);
    let mut parts = PartTable::default();
    let mut triggers = TriggerTable::default();
    let result = loader::load_all(
        dir.path(),
        2,
        &mut small,
        &mut new_jobs,
        &mut parts,
        &mut triggers,
    );
    assert!(result.is_err());
}
