// src/core/state/core.rs

//! Defines the central `ControllerState` struct holding all shared state,
//! and the four-entity lock assembly that gatekeeps it.

use crate::config::Config;
use crate::core::ControllerError;
use crate::core::agent::AgentQueue;
use crate::core::backends::BackendSet;
use crate::core::locks::{EntityLock, Held, LockRequest, LockSnapshot};
use crate::core::state::job::JobTable;
use crate::core::state::node::NodeTable;
use crate::core::state::partition::PartTable;
use crate::core::state::trigger::TriggerTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{Notify, Semaphore};

/// Upper bound on concurrently executing per-request workers.
pub const MAX_SERVER_THREADS: usize = 256;

/// The configuration entity: the resolved config plus its update stamp.
#[derive(Debug)]
pub struct ConfigTable {
    pub config: Config,
    pub last_update: i64,
}

/// The four guarded entities. Acquisition is all-or-nothing and always in
/// the canonical order config -> job -> node -> partition.
pub struct StateLocks {
    config: EntityLock<ConfigTable>,
    jobs: EntityLock<JobTable>,
    nodes: EntityLock<NodeTable>,
    parts: EntityLock<PartTable>,
}

/// The holds produced by one `acquire` call, released as a group on drop.
#[derive(Default)]
pub struct StateGuard {
    pub config: Held<ConfigTable>,
    pub jobs: Held<JobTable>,
    pub nodes: Held<NodeTable>,
    pub parts: Held<PartTable>,
}

impl StateLocks {
    fn new(config: ConfigTable, jobs: JobTable) -> Self {
        Self {
            config: EntityLock::new(config),
            jobs: EntityLock::new(jobs),
            nodes: EntityLock::new(NodeTable::default()),
            parts: EntityLock::new(PartTable::default()),
        }
    }

    /// Blocks until every requested entity is available, then returns the
    /// whole vector of holds.
    pub async fn acquire(&self, req: LockRequest) -> StateGuard {
        StateGuard {
            config: self.config.acquire(req.config).await,
            jobs: self.jobs.acquire(req.job).await,
            nodes: self.nodes.acquire(req.node).await,
            parts: self.parts.acquire(req.part).await,
        }
    }

    /// The diagnostic snapshot: current reader/writer counts per entity.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            config: self.config.counts(),
            job: self.jobs.counts(),
            node: self.nodes.counts(),
            part: self.parts.counts(),
        }
    }
}

/// The central struct holding all shared controller state. Wrapped in an
/// `Arc` and passed to every task and request handler; handlers never
/// close over anything else.
pub struct ControllerState {
    /// The four-entity lock manager owning all authoritative tables.
    pub locks: StateLocks,
    /// Pluggable backends (auth, credential signing, scheduler, select,
    /// accounting).
    pub backends: BackendSet,
    /// Outbound worker RPC retry queue.
    pub agent: AgentQueue,
    /// Armed event triggers; own mutex, not part of the lock manager.
    pub triggers: parking_lot::Mutex<TriggerTable>,
    /// Epoch seconds at which shutdown was requested; zero while running.
    /// Only the signal task stores a non-zero value.
    shutdown_time: AtomicI64,
    /// Set by the `control` RPC: after shutdown, resume in standby mode
    /// rather than exiting.
    pub resume_backup: AtomicBool,
    /// Set by SIGABRT so the final exit aborts with a core.
    pub dump_core: AtomicBool,
    /// Epoch seconds at which this instance became the acting primary;
    /// zero in standby.
    pub control_time: AtomicI64,
    /// This controller's ordinal in the control-host list.
    pub backup_inx: usize,
    /// The local hostname matched against the control-host list.
    pub hostname: String,
    /// Path the configuration was loaded from; re-read on reconfigure.
    pub config_path: String,
    /// Bounds concurrently running per-request workers; the acceptor takes
    /// a permit before `accept`.
    pub server_threads: Arc<Semaphore>,
    /// Wakes the background loop for a prompt scheduling pass.
    pub sched_kick: Notify,
    /// Wakes the acceptor and the standby loop when shutdown is requested.
    pub shutdown_notify: Notify,
    /// Random identity for this incarnation, distinguishing restarts in
    /// logs gathered across the control hosts.
    pub run_id: String,
}

impl ControllerState {
    /// Builds the shared state from a resolved configuration. The node and
    /// partition tables start empty; the config loader populates them.
    pub fn initialize(
        config: Config,
        config_path: String,
        backup_inx: usize,
        hostname: String,
    ) -> Result<Arc<Self>, ControllerError> {
        let mut run_id_bytes = [0u8; 8];
        getrandom::fill(&mut run_id_bytes)
            .map_err(|e| ControllerError::Internal(e.to_string()))?;
        let run_id = hex::encode(run_id_bytes);

        let backends = BackendSet::create(&config)?;
        let jobs = JobTable::new(config.first_job_id, config.max_job_id);
        let config_table = ConfigTable {
            config,
            last_update: crate::core::state::ops::epoch_now(),
        };
        Ok(Arc::new(Self {
            locks: StateLocks::new(config_table, jobs),
            backends,
            agent: AgentQueue::new(),
            triggers: parking_lot::Mutex::new(TriggerTable::default()),
            shutdown_time: AtomicI64::new(0),
            resume_backup: AtomicBool::new(false),
            dump_core: AtomicBool::new(false),
            control_time: AtomicI64::new(0),
            backup_inx,
            hostname,
            config_path,
            server_threads: Arc::new(Semaphore::new(MAX_SERVER_THREADS)),
            sched_kick: Notify::new(),
            shutdown_notify: Notify::new(),
            run_id,
        }))
    }

    pub fn shutdown_time(&self) -> i64 {
        self.shutdown_time.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_time() != 0
    }

    /// Records the shutdown instant. Called only from the signal task and
    /// the shutdown/takeover RPC handlers acting on its behalf.
    pub fn request_shutdown(&self) {
        let now = crate::core::state::ops::epoch_now();
        let _ = self
            .shutdown_time
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Clears the flag when a promoted standby restarts the primary role.
    pub fn clear_shutdown(&self) {
        self.shutdown_time.store(0, Ordering::SeqCst);
    }

    pub fn is_primary(&self) -> bool {
        self.control_time.load(Ordering::SeqCst) != 0
    }

    /// Stamps this instance as the acting primary.
    pub fn assume_control(&self) {
        self.control_time
            .store(crate::core::state::ops::epoch_now(), Ordering::SeqCst);
    }

    pub fn relinquish_control(&self) {
        self.control_time.store(0, Ordering::SeqCst);
    }

    /// True when every per-request worker permit is back home.
    pub fn workers_drained(&self) -> bool {
        self.server_threads.available_permits() == MAX_SERVER_THREADS
    }
}
