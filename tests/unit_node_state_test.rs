use beryld::core::bitmap::Bitmap;
use beryld::core::protocol::message::SharedPref;
use beryld::core::state::job::{Job, JobFlags, JobState, JobTable};
use beryld::core::state::node::{
    BaseState, Node, NodeFlags, NodeTable, RequestedNodeState,
};
use beryld::core::state::ops;

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

fn make_running_job(id: u32, table: &mut NodeTable, node_idx: usize) -> Job {
    let mut job = Job {
        job_id: id,
        user_id: 1000,
        group_id: 1000,
        name: None,
        state: JobState::Pending,
        flags: JobFlags::empty(),
        partition: "batch".to_string(),
        node_bitmap: None,
        completing_bitmap: None,
        node_cnt: 0,
        num_cpus: 1,
        min_nodes: 1,
        min_memory: 0,
        time_limit: 60,
        priority: 100,
        shared: SharedPref::PartitionDefault,
        batch_flag: true,
        submit_time: 100,
        start_time: 0,
        end_time: 0,
        last_active: 100,
        suspend_cnt: 0,
        restart_cnt: 0,
        details: None,
        steps: Vec::new(),
        next_step_id: 0,
    };
    let mut bm = Bitmap::with_size(table.len());
    bm.set(node_idx);
    ops::allocate_nodes_to_job(table, &mut job, bm, 200);
    job
}

#[test]
fn test_bitmaps_follow_node_state() {
    let mut table = make_table(3);
    assert_eq!(table.idle_bitmap.count(), 3);
    assert_eq!(table.avail_bitmap.count(), 3);

    table.nodes[0].flags.insert(NodeFlags::DRAIN);
    table.sync_bitmaps();
    assert!(!table.idle_bitmap.test(0));
    assert!(!table.avail_bitmap.test(0));
    assert!(table.avail_bitmap.test(1));
}

#[test]
fn test_lookup_by_name() {
    let table = make_table(3);
    assert_eq!(table.lookup("n2"), Some(1));
    assert_eq!(table.lookup("missing"), None);
}

#[test]
fn test_state_change_validation() {
    let mut node = make_node("n1");
    node.state = BaseState::Allocated;
    node.run_job_cnt = 1;
    // Allocated cannot jump straight to idle.
    assert!(NodeTable::validate_state_change(&node, RequestedNodeState::Idle).is_err());
    // Down and drain are always permitted.
    assert!(NodeTable::validate_state_change(&node, RequestedNodeState::Down).is_ok());
    assert!(NodeTable::validate_state_change(&node, RequestedNodeState::Drain).is_ok());

    let mut down = make_node("n2");
    down.state = BaseState::Down;
    assert!(NodeTable::validate_state_change(&down, RequestedNodeState::Idle).is_ok());
}

#[test]
fn test_down_kills_running_jobs() {
    let mut table = make_table(2);
    let mut jobs = JobTable::new(1, 1000);
    let job = make_running_job(1, &mut table, 0);
    jobs.insert(job).unwrap();
    assert_eq!(table.nodes[0].run_job_cnt, 1);

    let killed = ops::set_node_state(
        &mut table,
        &mut jobs,
        0,
        RequestedNodeState::Down,
        Some("dead switch".to_string()),
        300,
    )
    .unwrap();
    assert_eq!(killed, vec![1]);

    let job = jobs.lookup(1).unwrap();
    assert_eq!(job.state, JobState::NodeFail);
    // A single-node job on a dead node owes no epilog anywhere.
    assert!(!job.is_completing());
    assert_eq!(table.nodes[0].state, BaseState::Down);
    assert_eq!(table.nodes[0].reason.as_deref(), Some("dead switch"));
    assert!(!table.avail_bitmap.test(0));
    ops::check_invariants(&table, &jobs).unwrap();
}

#[test]
fn test_drain_leaves_jobs_running() {
    let mut table = make_table(2);
    let mut jobs = JobTable::new(1, 1000);
    let job = make_running_job(1, &mut table, 0);
    jobs.insert(job).unwrap();

    let killed = ops::set_node_state(
        &mut table,
        &mut jobs,
        0,
        RequestedNodeState::Drain,
        Some("maintenance".to_string()),
        300,
    )
    .unwrap();
    assert!(killed.is_empty());
    assert_eq!(jobs.lookup(1).unwrap().state, JobState::Running);
    assert!(table.nodes[0].is_draining());
    assert!(!table.avail_bitmap.test(0));
    ops::check_invariants(&table, &jobs).unwrap();
}

#[test]
fn test_down_then_resume_restores_service() {
    let mut table = make_table(1);
    let mut jobs = JobTable::new(1, 1000);
    ops::set_node_state(
        &mut table,
        &mut jobs,
        0,
        RequestedNodeState::Down,
        Some("flaky".to_string()),
        100,
    )
    .unwrap();
    assert_eq!(table.nodes[0].state, BaseState::Down);

    ops::set_node_state(&mut table, &mut jobs, 0, RequestedNodeState::Idle, None, 200).unwrap();
    assert_eq!(table.nodes[0].state, BaseState::Idle);
    assert_eq!(table.nodes[0].reason, None);
    assert!(table.avail_bitmap.test(0));
}

#[test]
fn test_registration_of_unknown_node() {
    let mut table = make_table(1);
    table.nodes[0].state = BaseState::Unknown;
    table.sync_bitmaps();
    let jobs = JobTable::new(1, 1000);

    ops::register_node(&mut table, &jobs, 0, 4, 16_000, 0, true, 500);
    assert_eq!(table.nodes[0].state, BaseState::Idle);
    assert_eq!(table.nodes[0].last_response, 500);
    assert!(table.avail_bitmap.test(0));
}

#[test]
fn test_registration_with_low_cpus_downs_node() {
    let mut table = make_table(1);
    let jobs = JobTable::new(1, 1000);
    ops::register_node(&mut table, &jobs, 0, 2, 16_000, 0, true, 500);
    assert_eq!(table.nodes[0].state, BaseState::Down);
    assert_eq!(table.nodes[0].reason.as_deref(), Some("low cpus"));
}

#[test]
fn test_fast_schedule_accessor() {
    let mut node = make_node("n1");
    node.reported_cpus = 8;
    assert_eq!(node.avail_cpus(true), 4);
    assert_eq!(node.avail_cpus(false), 8);
    node.reported_cpus = 0;
    assert_eq!(node.avail_cpus(false), 4);
}
