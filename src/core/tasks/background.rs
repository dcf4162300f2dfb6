// src/core/tasks/background.rs

//! The controller's background loop.
//!
//! A single task that wakes every second, holds no lock while sleeping,
//! and performs each periodic activity when its interval has elapsed:
//! worker pings, job time-limit enforcement, the agent retry pump, group
//! refresh, old-job purge, scheduling, trigger firing, checkpoints, the
//! accounting heartbeat and the primary reassertion. On shutdown it drains
//! the in-flight workers, verifies the lock manager is clear, saves state
//! and exits.

use crate::core::agent::AgentRequest;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::metrics;
use crate::core::persistence::{heartbeat, saver};
use crate::core::protocol::message::Body;
use crate::core::readconfig;
use crate::core::state::ControllerState;
use crate::core::state::job::JobState;
use crate::core::state::node::{BaseState, NodeFlags, RequestedNodeState};
use crate::core::state::ops::{self, epoch_now};
use crate::core::state::trigger::TriggerKind;
use crate::core::sched::SchedContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Seconds the shutdown path waits for in-flight workers to drain.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

const PERIODIC_TIMEOUT: i64 = 30;
const PERIODIC_GROUP_CHECK: i64 = 600;
const PERIODIC_TRIGGER: i64 = 15;
const PERIODIC_PURGE: i64 = 60;

/// Scalars the loop needs each iteration, snapshot under one config read.
struct LoopConfig {
    worker_timeout: i64,
    inactive_limit: i64,
    min_job_age: i64,
    msg_timeout: Duration,
    schedule_interval: i64,
    checkpoint_interval: i64,
    health_check_interval: i64,
    heartbeat_interval: i64,
    controller_timeout: i64,
    state_save_location: String,
    no_resp_interval: i64,
}

pub struct BackgroundLoop {
    state: Arc<ControllerState>,
}

impl BackgroundLoop {
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("background loop started");
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let now = epoch_now();
        let mut last_no_resp = now;
        let mut last_timelimit = now;
        let mut last_ping = now;
        let mut last_health = now;
        let mut last_group = now;
        let mut last_purge = now;
        let mut last_sched = now;
        let mut last_trigger = now;
        let mut last_checkpoint = now;
        let mut last_acct = now;
        let mut last_assert = now;
        let mut sched_requested = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.state.sched_kick.notified() => { sched_requested = true; }
                _ = shutdown_rx.recv() => {}
            }
            if self.state.is_shutdown() {
                self.shutdown_sequence().await;
                return;
            }

            let now = epoch_now();
            let cfg = self.snapshot_config().await;

            if now - last_no_resp >= cfg.no_resp_interval {
                last_no_resp = now;
                self.log_non_responders().await;
            }
            if now - last_timelimit >= PERIODIC_TIMEOUT {
                last_timelimit = now;
                self.enforce_job_limits(now, &cfg).await;
            }
            if cfg.health_check_interval > 0 && now - last_health >= cfg.health_check_interval {
                last_health = now;
                self.fan_out_to_all_nodes(Body::PingWorker).await;
            }
            let ping_interval = if cfg.worker_timeout > 0 {
                (cfg.worker_timeout / 3).max(10)
            } else {
                100
            };
            if now - last_ping >= ping_interval {
                last_ping = now;
                self.ping_nodes(now, &cfg).await;
            }

            // The agent pump runs every iteration.
            self.pump_agent_queue(now, cfg.msg_timeout);

            if now - last_group >= PERIODIC_GROUP_CHECK {
                last_group = now;
                let mut guard = self
                    .state
                    .locks
                    .acquire(LockRequest {
                        part: LockMode::Write,
                        ..LockRequest::none()
                    })
                    .await;
                readconfig::refresh_group_uids(guard.parts.get_mut());
                debug!("partition group membership refreshed");
            }
            if now - last_purge >= PERIODIC_PURGE {
                last_purge = now;
                self.purge_old_jobs(now, cfg.min_job_age).await;
            }
            if sched_requested || now - last_sched >= cfg.schedule_interval {
                last_sched = now;
                sched_requested = false;
                if self.run_scheduler(now).await > 0 {
                    // Something started; make the next checkpoint immediate.
                    last_checkpoint = 0;
                }
            }
            if now - last_trigger >= PERIODIC_TRIGGER {
                last_trigger = now;
                self.fire_triggers().await;
            }
            if now - last_checkpoint >= cfg.checkpoint_interval {
                last_checkpoint = now;
                let timer = metrics::STATE_SAVE_SECONDS.start_timer();
                if let Err(e) = saver::save_all(&self.state).await {
                    // Never blocks scheduling; the next cycle retries.
                    error!(error = %e, "periodic state save failed");
                }
                timer.observe_duration();
            }
            if cfg.heartbeat_interval > 0 && now - last_acct >= cfg.heartbeat_interval {
                last_acct = now;
                self.accounting_heartbeat().await;
            }
            if now - last_assert >= cfg.controller_timeout {
                last_assert = now;
                self.reassert_primary(now, &cfg).await;
            }
        }
    }

    async fn snapshot_config(&self) -> LoopConfig {
        let guard = self
            .state
            .locks
            .acquire(LockRequest {
                config: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        let c = &guard.config.get().config;
        let debugish = matches!(c.log_level.as_str(), "debug" | "trace");
        LoopConfig {
            worker_timeout: c.worker_timeout.as_secs() as i64,
            inactive_limit: c.inactive_limit.as_secs() as i64,
            min_job_age: c.min_job_age.as_secs() as i64,
            msg_timeout: c.msg_timeout,
            schedule_interval: c.schedule_interval.as_secs().max(1) as i64,
            checkpoint_interval: c.checkpoint_interval.as_secs().max(1) as i64,
            health_check_interval: c.health_check_interval.as_secs() as i64,
            heartbeat_interval: c.heartbeat_interval.as_secs() as i64,
            controller_timeout: c.controller_timeout.as_secs().max(1) as i64,
            state_save_location: c.state_save_location.clone(),
            no_resp_interval: if debugish { 60 } else { 300 },
        }
    }

    async fn log_non_responders(&self) {
        let guard = self
            .state
            .locks
            .acquire(LockRequest {
                node: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        let names: Vec<String> = guard
            .nodes
            .get()
            .nodes
            .iter()
            .filter(|n| n.flags.contains(NodeFlags::NO_RESPOND))
            .map(|n| n.name.clone())
            .collect();
        if !names.is_empty() {
            warn!(nodes = %names.join(","), "nodes not responding");
        }
    }

    /// Time-limit enforcement plus inactivity enforcement for interactive
    /// allocations.
    async fn enforce_job_limits(&self, now: i64, cfg: &LoopConfig) {
        let mut guard = self
            .state
            .locks
            .acquire(LockRequest {
                config: LockMode::Read,
                job: LockMode::Write,
                node: LockMode::Write,
                part: LockMode::Read,
            })
            .await;
        let expired: Vec<u32> = guard
            .jobs
            .get()
            .iter()
            .filter(|j| j.deadline().is_some_and(|d| d <= now))
            .map(|j| j.job_id)
            .collect();
        for job_id in expired {
            warn!(job_id, "job exceeded its time limit");
            let jobs = guard.jobs.get_mut();
            let job = jobs.lookup_mut(job_id).expect("id from scan");
            // Kill fan-out first, while the allocation is still recorded.
            if let Some(bm) = job.node_bitmap.clone() {
                for idx in bm.iter_set() {
                    if let Some(node) = guard.nodes.get().node(idx) {
                        self.state.agent.enqueue(AgentRequest::new(
                            node.name.clone(),
                            format!("{}:{}", node.comm_name, node.port),
                            Body::KillTimelimit(crate::core::protocol::message::TerminateJob {
                                job_id,
                                timelimit: true,
                            }),
                        ));
                    }
                }
            }
            ops::begin_job_completion(guard.nodes.get_mut(), job, JobState::Timeout, now);
            self.state.backends.accounting.job_complete(job);
            metrics::JOBS_COMPLETED_TOTAL.inc();
            jobs.last_update = now;
        }

        if cfg.inactive_limit > 0 {
            let inactive: Vec<u32> = guard
                .jobs
                .get()
                .iter()
                .filter(|j| {
                    j.state == JobState::Running
                        && !j.batch_flag
                        && now - j.last_active >= cfg.inactive_limit
                })
                .map(|j| j.job_id)
                .collect();
            for job_id in inactive {
                warn!(job_id, "interactive allocation inactive too long; cancelling");
                let jobs = guard.jobs.get_mut();
                let job = jobs.lookup_mut(job_id).expect("id from scan");
                ops::begin_job_completion(guard.nodes.get_mut(), job, JobState::Cancelled, now);
                self.state.backends.accounting.job_complete(job);
                jobs.last_update = now;
            }
        }
    }

    /// Pings quiet workers and downgrades the ones that out-waited the
    /// worker timeout.
    async fn ping_nodes(&self, now: i64, cfg: &LoopConfig) {
        let mut guard = self
            .state
            .locks
            .acquire(LockRequest {
                job: LockMode::Write,
                node: LockMode::Write,
                ..LockRequest::none()
            })
            .await;
        let mut to_ping = Vec::new();
        let mut to_down = Vec::new();
        {
            let nodes = guard.nodes.get_mut();
            for idx in 0..nodes.len() {
                let node = nodes.node_mut(idx).expect("index in range");
                if matches!(node.state, BaseState::Down | BaseState::Future) {
                    continue;
                }
                let silent_for = now - node.last_response;
                if cfg.worker_timeout > 0 && silent_for >= 2 * cfg.worker_timeout {
                    to_down.push(idx);
                } else if cfg.worker_timeout > 0 && silent_for >= cfg.worker_timeout {
                    if !node.flags.contains(NodeFlags::NO_RESPOND) {
                        warn!(node = %node.name, "worker stopped responding");
                        node.flags.insert(NodeFlags::NO_RESPOND);
                        nodes.last_update = now;
                    }
                    to_ping.push(idx);
                } else {
                    to_ping.push(idx);
                }
            }
            nodes.sync_bitmaps();
        }
        for idx in to_down {
            let name = guard
                .nodes
                .get()
                .node(idx)
                .map(|n| n.name.clone())
                .unwrap_or_default();
            if let Err(e) = ops::set_node_state(
                guard.nodes.get_mut(),
                guard.jobs.get_mut(),
                idx,
                RequestedNodeState::Down,
                Some("not responding".to_string()),
                now,
            ) {
                error!(node = %name, error = %e, "failed to down unresponsive node");
            } else {
                self.state.backends.accounting.node_down(&name, "not responding");
            }
        }
        for idx in to_ping {
            if let Some(node) = guard.nodes.get().node(idx) {
                self.state.agent.enqueue(AgentRequest::new(
                    node.name.clone(),
                    format!("{}:{}", node.comm_name, node.port),
                    Body::PingWorker,
                ));
            }
        }
    }

    async fn fan_out_to_all_nodes(&self, body: Body) {
        let guard = self
            .state
            .locks
            .acquire(LockRequest {
                node: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        for node in &guard.nodes.get().nodes {
            if node.state == BaseState::Future {
                continue;
            }
            self.state.agent.enqueue(AgentRequest::new(
                node.name.clone(),
                format!("{}:{}", node.comm_name, node.port),
                body.clone(),
            ));
        }
    }

    /// Drains due agent requests; each delivery runs in its own task so a
    /// slow worker cannot stall the loop.
    fn pump_agent_queue(&self, now: i64, msg_timeout: Duration) {
        for req in self.state.agent.take_due(now) {
            let state = self.state.clone();
            tokio::spawn(async move {
                let cred = match state.backends.auth.sign(0, 0) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "cannot sign agent credential");
                        return;
                    }
                };
                match crate::core::agent::deliver(&req.addr, req.body.clone(), cred, msg_timeout)
                    .await
                {
                    Ok(_) => {
                        // Any reply is proof of life.
                        let mut guard = state
                            .locks
                            .acquire(LockRequest {
                                node: LockMode::Write,
                                ..LockRequest::none()
                            })
                            .await;
                        let nodes = guard.nodes.get_mut();
                        if let Some(idx) = nodes.lookup(&req.node_name)
                            && let Some(node) = nodes.node_mut(idx)
                        {
                            node.last_response = epoch_now();
                            if node.flags.contains(NodeFlags::NO_RESPOND) {
                                node.flags.remove(NodeFlags::NO_RESPOND);
                                nodes.last_update = epoch_now();
                                nodes.sync_bitmaps();
                            }
                        }
                    }
                    Err(e) => {
                        metrics::AGENT_RETRIES_TOTAL.inc();
                        debug!(node = %req.node_name, error = %e, "agent delivery failed");
                        let node_name = req.node_name.clone();
                        if state.agent.retry_later(req, epoch_now()).is_some() {
                            // Retry budget exhausted: drain the target.
                            let mut guard = state
                                .locks
                                .acquire(LockRequest {
                                    job: LockMode::Write,
                                    node: LockMode::Write,
                                    ..LockRequest::none()
                                })
                                .await;
                            if let Some(idx) = guard.nodes.get().lookup(&node_name) {
                                let _ = ops::set_node_state(
                                    guard.nodes.get_mut(),
                                    guard.jobs.get_mut(),
                                    idx,
                                    RequestedNodeState::Drain,
                                    Some("unreachable by controller".to_string()),
                                    epoch_now(),
                                );
                            }
                        }
                    }
                }
            });
        }
    }

    async fn purge_old_jobs(&self, now: i64, min_job_age: i64) {
        let mut guard = self
            .state
            .locks
            .acquire(LockRequest {
                job: LockMode::Write,
                ..LockRequest::none()
            })
            .await;
        let purged = guard.jobs.get_mut().purge_old(now, min_job_age);
        if !purged.is_empty() {
            guard.jobs.get_mut().last_update = now;
            info!(count = purged.len(), "purged completed jobs");
        }
    }

    async fn run_scheduler(&self, now: i64) -> usize {
        let mut guard = self
            .state
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
            now,
        };
        let started = self
            .state
            .backends
            .sched
            .lock()
            .schedule(&mut ctx, self.state.backends.select.as_ref());
        if started > 0 {
            metrics::JOBS_STARTED_TOTAL.inc_by(started as u64);
            debug!(started, "scheduling pass started jobs");
        }
        started
    }

    async fn fire_triggers(&self) {
        let guard = self
            .state
            .locks
            .acquire(LockRequest {
                job: LockMode::Read,
                node: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        let nodes = guard.nodes.get();
        let jobs = guard.jobs.get();
        let fired = self.state.triggers.lock().pull(|t| match t.kind {
            TriggerKind::NodeDown => nodes
                .lookup(&t.target)
                .and_then(|i| nodes.node(i))
                .is_some_and(|n| n.state == BaseState::Down),
            TriggerKind::NodeDrained => nodes
                .lookup(&t.target)
                .and_then(|i| nodes.node(i))
                .is_some_and(|n| n.is_drained()),
            TriggerKind::JobComplete => t
                .target
                .parse::<u32>()
                .ok()
                .and_then(|id| jobs.lookup(id))
                .is_none_or(|j| j.state.is_terminal()),
            TriggerKind::Reconfigure => false,
        });
        for t in fired {
            info!(trig_id = t.trig_id, kind = %t.kind, target = %t.target, "trigger fired");
        }
    }

    async fn accounting_heartbeat(&self) {
        let guard = self
            .state
            .locks
            .acquire(LockRequest {
                node: LockMode::Read,
                ..LockRequest::none()
            })
            .await;
        let nodes = guard.nodes.get();
        let alloc = nodes
            .nodes
            .iter()
            .filter(|n| n.state == BaseState::Allocated)
            .count();
        self.state
            .backends
            .accounting
            .cluster_heartbeat(nodes.len(), alloc);
    }

    /// Primary liveness reassertion: if a higher-priority controller is
    /// writing the heartbeat, yield; otherwise refresh it ourselves.
    async fn reassert_primary(&self, now: i64, cfg: &LoopConfig) {
        let dir = PathBuf::from(&cfg.state_save_location);
        if let Some(hb) = heartbeat::read_heartbeat(&dir)
            && (hb.server_inx as usize) < self.state.backup_inx
            && now - hb.timestamp < cfg.controller_timeout
        {
            error!(
                peer_inx = hb.server_inx,
                "higher-priority controller is alive; yielding control"
            );
            self.state.resume_backup.store(true, Ordering::SeqCst);
            self.state.request_shutdown();
            self.state.shutdown_notify.notify_waiters();
            return;
        }
        if let Err(e) = heartbeat::write_heartbeat(&dir, self.state.backup_inx as u16, now) {
            warn!(error = %e, "cannot refresh heartbeat");
        }
    }

    /// The orderly exit path: drain workers, verify the lock manager is
    /// clear, save state, stop.
    async fn shutdown_sequence(&self) {
        info!("background loop beginning shutdown sequence");
        let deadline = tokio::time::Instant::now() + CONTROL_TIMEOUT;
        while !self.state.workers_drained() {
            if tokio::time::Instant::now() >= deadline {
                warn!("timed out waiting for request workers to drain");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let snapshot = self.state.locks.snapshot();
        if !snapshot.is_clear() {
            error!(?snapshot, "cannot save state, locks held");
        } else if let Err(e) = saver::save_all(&self.state).await {
            error!(error = %e, "final state save failed");
        }
        info!("background loop exited");
    }
}
