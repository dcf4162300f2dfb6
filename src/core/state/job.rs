// src/core/state/job.rs

//! The job table: allocation requests, their lifecycle state, and the
//! steps running inside them.

use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use crate::core::protocol::message::SharedPref;
use bitflags::bitflags;
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

/// Minutes value meaning "no limit".
pub const INFINITE_TIME: u32 = u32::MAX;

/// Base state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[repr(u16)]
pub enum JobState {
    #[default]
    Pending = 0,
    Running = 1,
    Suspended = 2,
    Complete = 3,
    Cancelled = 4,
    Failed = 5,
    Timeout = 6,
    NodeFail = 7,
}

impl JobState {
    pub fn from_u16(v: u16) -> Result<Self, ControllerError> {
        match v {
            0 => Ok(JobState::Pending),
            1 => Ok(JobState::Running),
            2 => Ok(JobState::Suspended),
            3 => Ok(JobState::Complete),
            4 => Ok(JobState::Cancelled),
            5 => Ok(JobState::Failed),
            6 => Ok(JobState::Timeout),
            7 => Ok(JobState::NodeFail),
            other => Err(ControllerError::Protocol(format!("bad job state {other}"))),
        }
    }

    /// True for states a job never leaves (modulo requeue).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete
                | JobState::Cancelled
                | JobState::Failed
                | JobState::Timeout
                | JobState::NodeFail
        )
    }
}

bitflags! {
    /// Transient overlays on the base state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobFlags: u16 {
        /// Nodes are still running post-termination cleanup.
        const COMPLETING = 1 << 0;
        /// Allocated but waiting for nodes to become ready.
        const CONFIGURING = 1 << 1;
    }
}

/// Batch-specific request detail that most RPCs never touch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetails {
    pub req_nodes: Option<String>,
    pub script: Option<String>,
    pub argv: Vec<String>,
    pub environment: Vec<String>,
    pub work_dir: Option<String>,
    pub std_in: Option<String>,
    pub std_out: Option<String>,
    pub std_err: Option<String>,
    pub dependency: Vec<u32>,
}

/// A sub-allocation within a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStep {
    pub step_id: u32,
    pub node_bitmap: Bitmap,
    pub cpu_count: u32,
    pub mem_per_task: u64,
    /// Task count per allocated node, allocation order.
    pub tasks_per_node: Vec<u32>,
    /// Cores in use, indexed by the job's allocation, not the cluster.
    pub core_bitmap: Bitmap,
}

/// One allocation request and everything the controller knows about it.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub name: Option<String>,
    pub state: JobState,
    pub flags: JobFlags,
    pub partition: String,
    pub node_bitmap: Option<Bitmap>,
    /// Nodes still owing epilog completion while `COMPLETING` is set.
    pub completing_bitmap: Option<Bitmap>,
    pub node_cnt: u32,
    pub num_cpus: u32,
    pub min_nodes: u32,
    pub min_memory: u64,
    /// Minutes, `INFINITE_TIME` for unlimited.
    pub time_limit: u32,
    /// Zero priority holds the job.
    pub priority: u32,
    pub shared: SharedPref,
    pub batch_flag: bool,
    pub submit_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub last_active: i64,
    pub suspend_cnt: u32,
    pub restart_cnt: u16,
    pub details: Option<JobDetails>,
    pub steps: Vec<JobStep>,
    pub next_step_id: u32,
}

impl Job {
    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, JobState::Running | JobState::Suspended)
    }

    pub fn is_completing(&self) -> bool {
        self.flags.contains(JobFlags::COMPLETING)
    }

    pub fn is_held(&self) -> bool {
        self.state == JobState::Pending && self.priority == 0
    }

    /// Wall-clock deadline, if the job has one.
    pub fn deadline(&self) -> Option<i64> {
        if self.state != JobState::Running || self.time_limit == INFINITE_TIME {
            return None;
        }
        Some(self.start_time + (self.time_limit as i64) * 60)
    }

    pub fn step(&self, step_id: u32) -> Option<&JobStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn remove_step(&mut self, step_id: u32) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.step_id != step_id);
        self.steps.len() != before
    }
}

/// In-memory table of all jobs with O(1) id lookup.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<u32, Job>,
    pub next_job_id: u32,
    pub first_job_id: u32,
    pub max_job_id: u32,
    pub last_update: i64,
}

impl JobTable {
    pub fn new(first_job_id: u32, max_job_id: u32) -> Self {
        Self {
            jobs: HashMap::new(),
            next_job_id: first_job_id,
            first_job_id,
            max_job_id,
            last_update: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn lookup(&self, job_id: u32) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn lookup_mut(&mut self, job_id: u32) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    /// Job ids in ascending order, for stable info dumps.
    pub fn sorted_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Mints the next job id, wrapping at the configured maximum and
    /// skipping ids still present in the table.
    pub fn mint_job_id(&mut self) -> Result<u32, ControllerError> {
        let span = (self.max_job_id - self.first_job_id) as usize + 1;
        for _ in 0..span {
            let id = self.next_job_id;
            self.next_job_id = if id >= self.max_job_id {
                self.first_job_id
            } else {
                id + 1
            };
            if !self.jobs.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ControllerError::Internal(
            "job id space exhausted".to_string(),
        ))
    }

    /// Inserts a job record; the id must be unused.
    pub fn insert(&mut self, job: Job) -> Result<(), ControllerError> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(ControllerError::DuplicateJobId(job.job_id));
        }
        self.jobs.insert(job.job_id, job);
        Ok(())
    }

    pub fn remove(&mut self, job_id: u32) -> Option<Job> {
        self.jobs.remove(&job_id)
    }

    /// Drops terminal jobs whose completion age exceeds `min_age_secs`.
    /// Returns the removed ids.
    pub fn purge_old(&mut self, now: i64, min_age_secs: i64) -> Vec<u32> {
        let purge: Vec<u32> = self
            .jobs
            .values()
            .filter(|j| {
                j.state.is_terminal()
                    && !j.is_completing()
                    && j.end_time > 0
                    && now - j.end_time >= min_age_secs
            })
            .map(|j| j.job_id)
            .collect();
        for id in &purge {
            self.jobs.remove(id);
        }
        purge
    }

    /// Clears every record; used when a promoted standby re-reads state
    /// from disk.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.next_job_id = self.first_job_id;
    }
}
