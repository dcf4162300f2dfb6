use beryld::config::SharedPolicy;
use beryld::core::bitmap::Bitmap;
use beryld::core::protocol::message::SharedPref;
use beryld::core::sched::select::{LinearSelect, SelectBackend};
use beryld::core::state::job::{Job, JobDetails, JobFlags, JobState};
use beryld::core::state::node::{BaseState, Node, NodeFlags, NodeTable};
use beryld::core::state::partition::Partition;

fn make_node(name: &str, weight: u32) -> Node {
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
        weight,
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

fn make_table(weights: &[u32]) -> NodeTable {
    let mut table = NodeTable::default();
    for (i, w) in weights.iter().enumerate() {
        table.nodes.push(make_node(&format!("n{}", i + 1), *w));
    }
    table.rebuild_hash();
    table.sync_bitmaps();
    table
}

fn make_partition(node_count: usize, shared: SharedPolicy) -> Partition {
    let mut bitmap = Bitmap::with_size(node_count);
    for i in 0..node_count {
        bitmap.set(i);
    }
    Partition {
        name: "batch".to_string(),
        node_list: String::new(),
        node_bitmap: bitmap,
        min_nodes: 1,
        max_nodes: u32::MAX,
        max_time: u32::MAX,
        root_only: false,
        hidden: false,
        shared,
        state_up: true,
        default_part: true,
        allow_groups: None,
        allow_uids: Vec::new(),
        total_nodes: node_count as u32,
        total_cpus: 4 * node_count as u32,
    }
}

fn make_job(min_nodes: u32) -> Job {
    Job {
        job_id: 1,
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
        min_nodes,
        min_memory: 0,
        time_limit: 60,
        priority: 100,
        shared: SharedPref::PartitionDefault,
        batch_flag: true,
        submit_time: 1,
        start_time: 0,
        end_time: 0,
        last_active: 1,
        suspend_cnt: 0,
        restart_cnt: 0,
        details: None,
        steps: Vec::new(),
        next_step_id: 0,
    }
}

#[test]
fn test_picks_requested_node_count() {
    let table = make_table(&[1, 1, 1]);
    let part = make_partition(3, SharedPolicy::No);
    let pick = LinearSelect
        .pick(&table, &part, &make_job(2), true)
        .unwrap();
    assert_eq!(pick.count(), 2);
}

#[test]
fn test_prefers_lighter_nodes() {
    let table = make_table(&[30, 10, 20]);
    let part = make_partition(3, SharedPolicy::No);
    let pick = LinearSelect
        .pick(&table, &part, &make_job(1), true)
        .unwrap();
    // n2 has the lowest weight.
    assert!(pick.test(1));
    assert_eq!(pick.count(), 1);
}

#[test]
fn test_skips_drained_nodes() {
    let mut table = make_table(&[1, 1]);
    table.nodes[0].flags.insert(NodeFlags::DRAIN);
    table.sync_bitmaps();
    let part = make_partition(2, SharedPolicy::No);

    let pick = LinearSelect
        .pick(&table, &part, &make_job(1), true)
        .unwrap();
    assert!(pick.test(1));
    assert!(!pick.test(0));

    // Two nodes cannot be had while one is draining.
    assert!(LinearSelect.pick(&table, &part, &make_job(2), true).is_none());
}

#[test]
fn test_no_sharing_excludes_busy_nodes() {
    let mut table = make_table(&[1, 1]);
    table.nodes[0].state = BaseState::Allocated;
    table.nodes[0].run_job_cnt = 1;
    table.sync_bitmaps();
    let part = make_partition(2, SharedPolicy::No);

    let pick = LinearSelect
        .pick(&table, &part, &make_job(1), true)
        .unwrap();
    assert!(pick.test(1));
    assert!(!pick.test(0));
}

#[test]
fn test_force_sharing_uses_busy_nodes() {
    let mut table = make_table(&[1, 2]);
    table.nodes[0].state = BaseState::Allocated;
    table.nodes[0].run_job_cnt = 1;
    table.sync_bitmaps();
    let part = make_partition(2, SharedPolicy::Force);

    let pick = LinearSelect
        .pick(&table, &part, &make_job(2), true)
        .unwrap();
    assert_eq!(pick.count(), 2);
}

#[test]
fn test_memory_requirement_filters_nodes() {
    let table = make_table(&[1, 1]);
    let part = make_partition(2, SharedPolicy::No);
    let mut job = make_job(1);
    job.min_memory = 999_999;
    assert!(LinearSelect.pick(&table, &part, &job, true).is_none());
}

#[test]
fn test_required_nodes_are_mandatory() {
    let table = make_table(&[1, 1, 1]);
    let part = make_partition(3, SharedPolicy::No);
    let mut job = make_job(1);
    job.details = Some(JobDetails {
        req_nodes: Some("n3".to_string()),
        script: None,
        argv: Vec::new(),
        environment: Vec::new(),
        work_dir: None,
        std_in: None,
        std_out: None,
        std_err: None,
        dependency: Vec::new(),
    });
    let pick = LinearSelect.pick(&table, &part, &job, true).unwrap();
    assert!(pick.test(2));

    // A required node that is not available sinks the pick.
    let mut table = make_table(&[1, 1, 1]);
    table.nodes[2].flags.insert(NodeFlags::DRAIN);
    table.sync_bitmaps();
    assert!(LinearSelect.pick(&table, &part, &job, true).is_none());
}
