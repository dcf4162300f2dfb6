use beryld::core::bitmap::Bitmap;
use beryld::core::protocol::message::SharedPref;
use beryld::core::state::job::{Job, JobFlags, JobState, JobTable};
use beryld::core::state::node::{BaseState, Node, NodeFlags, NodeTable};
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

fn make_job(id: u32) -> Job {
    Job {
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
    }
}

#[test]
fn test_job_id_minting_wraps_and_skips_in_use() {
    let mut jobs = JobTable::new(1, 3);
    for expected in 1..=3u32 {
        let id = jobs.mint_job_id().unwrap();
        assert_eq!(id, expected);
        jobs.insert(make_job(id)).unwrap();
    }
    // All ids occupied.
    assert!(jobs.mint_job_id().is_err());

    jobs.remove(2);
    assert_eq!(jobs.mint_job_id().unwrap(), 2);
}

#[test]
fn test_duplicate_insert_rejected() {
    let mut jobs = JobTable::new(1, 100);
    jobs.insert(make_job(1)).unwrap();
    assert!(jobs.insert(make_job(1)).is_err());
}

#[test]
fn test_purge_removes_only_old_terminal_jobs() {
    let mut jobs = JobTable::new(1, 100);

    let mut done = make_job(1);
    done.state = JobState::Complete;
    done.end_time = 100;
    jobs.insert(done).unwrap();

    let mut fresh = make_job(2);
    fresh.state = JobState::Complete;
    fresh.end_time = 950;
    jobs.insert(fresh).unwrap();

    let mut running = make_job(3);
    running.state = JobState::Running;
    jobs.insert(running).unwrap();

    let purged = jobs.purge_old(1000, 300);
    assert_eq!(purged, vec![1]);
    assert!(jobs.lookup(1).is_none());
    assert!(jobs.lookup(2).is_some());
    assert!(jobs.lookup(3).is_some());
}

#[test]
fn test_allocation_and_completion_lifecycle() {
    let mut table = make_table(2);
    let mut job = make_job(1);

    let mut bm = Bitmap::with_size(2);
    bm.set(0);
    bm.set(1);
    ops::allocate_nodes_to_job(&mut table, &mut job, bm, 200);
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.node_cnt, 2);
    assert_eq!(table.nodes[0].state, BaseState::Allocated);
    assert_eq!(table.nodes[1].run_job_cnt, 1);
    assert_eq!(table.idle_bitmap.count(), 0);

    ops::begin_job_completion(&mut table, &mut job, JobState::Complete, 300);
    assert_eq!(job.state, JobState::Complete);
    assert!(job.is_completing());
    assert_eq!(table.nodes[0].state, BaseState::Completing);
    assert_eq!(table.nodes[0].comp_job_cnt, 1);

    // First epilog: one node still owing.
    let done = ops::epilog_complete(&mut table, &mut job, 0, 310).unwrap();
    assert!(!done);
    assert_eq!(table.nodes[0].state, BaseState::Idle);
    assert!(job.is_completing());

    // Last epilog clears the overlay everywhere.
    let done = ops::epilog_complete(&mut table, &mut job, 1, 320).unwrap();
    assert!(done);
    assert!(!job.is_completing());
    assert_eq!(table.nodes[1].state, BaseState::Idle);
    assert_eq!(table.idle_bitmap.count(), 2);
}

#[test]
fn test_epilog_complete_is_idempotent() {
    let mut table = make_table(1);
    let mut job = make_job(1);
    let mut bm = Bitmap::with_size(1);
    bm.set(0);
    ops::allocate_nodes_to_job(&mut table, &mut job, bm, 200);
    ops::begin_job_completion(&mut table, &mut job, JobState::Complete, 300);

    assert!(ops::epilog_complete(&mut table, &mut job, 0, 310).unwrap());
    // Replayed epilog after the overlay cleared reports completion again
    // without disturbing the node counts.
    assert!(ops::epilog_complete(&mut table, &mut job, 0, 320).unwrap());
    assert_eq!(table.nodes[0].comp_job_cnt, 0);
}

#[test]
fn test_requeue_returns_job_to_pending() {
    let mut table = make_table(1);
    let mut job = make_job(1);
    let mut bm = Bitmap::with_size(1);
    bm.set(0);
    ops::allocate_nodes_to_job(&mut table, &mut job, bm, 200);

    ops::requeue_job(&mut table, &mut job, 300);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.restart_cnt, 1);
    assert_eq!(job.start_time, 0);
    // The epilog is still owed before the job can be re-scheduled.
    assert!(job.is_completing());

    ops::epilog_complete(&mut table, &mut job, 0, 310).unwrap();
    assert!(!job.is_completing());
    assert_eq!(table.nodes[0].state, BaseState::Idle);
}

#[test]
fn test_deadline_computation() {
    let mut job = make_job(1);
    job.state = JobState::Running;
    job.start_time = 1000;
    job.time_limit = 2;
    assert_eq!(job.deadline(), Some(1000 + 120));

    job.time_limit = beryld::core::state::job::INFINITE_TIME;
    assert_eq!(job.deadline(), None);

    job.time_limit = 2;
    job.state = JobState::Pending;
    assert_eq!(job.deadline(), None);
}

#[test]
fn test_sync_jobs_with_nodes_rebuilds_counts() {
    let mut table = make_table(2);
    let mut jobs = JobTable::new(1, 100);
    let mut job = make_job(1);
    let mut bm = Bitmap::with_size(2);
    bm.set(0);
    ops::allocate_nodes_to_job(&mut table, &mut job, bm, 200);
    jobs.insert(job).unwrap();

    // Zero the counts behind the table's back, then resync.
    table.nodes[0].run_job_cnt = 0;
    table.nodes[0].state = BaseState::Idle;
    ops::sync_jobs_with_nodes(&mut table, &mut jobs, 300);
    assert_eq!(table.nodes[0].run_job_cnt, 1);
    assert_eq!(table.nodes[0].state, BaseState::Allocated);
    ops::check_invariants(&table, &jobs).unwrap();
}

#[test]
fn test_sync_fails_job_on_down_node() {
    let mut table = make_table(2);
    let mut jobs = JobTable::new(1, 100);
    let mut job = make_job(1);
    let mut bm = Bitmap::with_size(2);
    bm.set(0);
    bm.set(1);
    ops::allocate_nodes_to_job(&mut table, &mut job, bm, 200);
    jobs.insert(job).unwrap();

    table.nodes[0].state = BaseState::Down;
    ops::sync_jobs_with_nodes(&mut table, &mut jobs, 300);

    let job = jobs.lookup(1).unwrap();
    assert_eq!(job.state, JobState::NodeFail);
    // Epilog still owed on the healthy node only.
    assert!(job.is_completing());
    assert!(job.completing_bitmap.as_ref().unwrap().test(1));
    assert!(!job.completing_bitmap.as_ref().unwrap().test(0));
    ops::check_invariants(&table, &jobs).unwrap();
}
