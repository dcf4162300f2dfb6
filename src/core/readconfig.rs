// src/core/readconfig.rs

//! The config loader: rebuilds the node and partition tables from the
//! declarative configuration and merges the result with persisted state.
//!
//! Runs at startup and on every reconfigure (SIGHUP or RPC), always under
//! a full four-entity write lock. Running jobs survive: the fresh node
//! table is seeded from the old one by name, saved job state is loaded at
//! the requested recovery level, and jobs are re-synchronised against the
//! nodes before the lock drops.

use crate::config::Config;
use crate::core::ControllerError;
use crate::core::agent::AgentRequest;
use crate::core::bitmap::Bitmap;
use crate::core::hostlist;
use crate::core::locks::{LockMode, LockRequest};
use crate::core::persistence::loader;
use crate::core::protocol::message::{Body, TerminateJob};
use crate::core::state::ControllerState;
use crate::core::state::node::{BaseState, ConfigRecord, Node, NodeFlags, NodeTable};
use crate::core::state::ops;
use crate::core::state::partition::{PartTable, Partition};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Re-reads configuration and rebuilds the cluster tables.
///
/// `config_override` supplies a pre-parsed configuration (startup and
/// tests); `None` re-reads the file the daemon was started with. Returns
/// the list of *soft* errors (backend name changes that require a restart
/// to take effect); any hard error aborts the reconfigure with the old
/// tables untouched only where possible — table construction failures are
/// fatal by design, because continuing would mean silent state corruption.
pub async fn reconfigure(
    state: &Arc<ControllerState>,
    recovery: u8,
    config_override: Option<Config>,
) -> Result<Vec<ControllerError>, ControllerError> {
    let new_config = match config_override {
        Some(c) => c,
        None => Config::from_file(&state.config_path)
            .map_err(|e| ControllerError::Internal(format!("config reload failed: {e:#}")))?,
    };

    let soft_errors = state.backends.detect_backend_changes(&new_config);
    for err in &soft_errors {
        warn!(%err, "backend change ignored until restart");
    }

    let mut guard = state
        .locks
        .acquire(LockRequest {
            config: LockMode::Write,
            job: LockMode::Write,
            node: LockMode::Write,
            part: LockMode::Write,
        })
        .await;

    let now = ops::epoch_now();

    // Step 1: snapshot the old node table; seeding below consults it.
    let old_nodes = std::mem::take(guard.nodes.get_mut());

    // Steps 2-4: build fresh node and partition tables.
    let mut nodes = build_node_table(&new_config, &old_nodes)?;
    let mut parts = build_part_table(&new_config, &mut nodes)?;

    // Step 5: persisted state at the requested recovery level. The job
    // table is rebuilt from disk only when recovering; a plain SIGHUP
    // keeps the live jobs.
    if recovery > 0 {
        guard.jobs.get_mut().clear();
        let dir = Path::new(&new_config.state_save_location);
        let mut triggers = state.triggers.lock();
        loader::load_all(
            dir,
            recovery,
            &mut nodes,
            guard.jobs.get_mut(),
            &mut parts,
            &mut triggers,
        )?;
    }

    // Step 9 (checked before committing anything): a cluster without
    // nodes or without a default partition cannot operate.
    if nodes.is_empty() {
        return Err(ControllerError::Internal(
            "configuration declares zero nodes".to_string(),
        ));
    }
    if parts.default_partition().is_none() {
        return Err(ControllerError::Internal(
            "configuration declares no default partition".to_string(),
        ));
    }

    // Step 6: derived bitmaps from scratch.
    nodes.rebuild_hash();
    nodes.sync_bitmaps();

    // Live jobs kept across a plain reconfigure carry bitmaps indexed by
    // the *old* table; re-resolve them by node name before the swap. A
    // running job bound to a node that vanished from the configuration is
    // unrecoverable state corruption, and the reconfigure fails rather
    // than losing the allocation silently.
    if recovery == 0 {
        for job in guard.jobs.get_mut().iter_mut() {
            job.node_bitmap = job
                .node_bitmap
                .take()
                .map(|bm| remap_bitmap(&bm, &old_nodes, &nodes, job.job_id))
                .transpose()?;
            job.completing_bitmap = job
                .completing_bitmap
                .take()
                .map(|bm| remap_bitmap(&bm, &old_nodes, &nodes, job.job_id))
                .transpose()?;
            for step in &mut job.steps {
                step.node_bitmap =
                    remap_bitmap(&step.node_bitmap, &old_nodes, &nodes, job.job_id)?;
            }
        }
    }

    // Commit the new tables.
    *guard.nodes.get_mut() = nodes;
    *guard.parts.get_mut() = parts;

    // Step 7: re-synchronise jobs against the new node table.
    ops::sync_jobs_with_nodes(guard.nodes.get_mut(), guard.jobs.get_mut(), now);

    // Resolve partition group access against the new allow lists.
    refresh_group_uids(guard.parts.get_mut());

    // Step 8: re-drive deallocation for every completing job; the worker
    // side may have forgotten it across our restart.
    let nodes_ref = guard.nodes.get();
    for job in guard.jobs.get().iter().filter(|j| j.is_completing()) {
        if let Some(bm) = job.completing_bitmap.as_ref() {
            for idx in bm.iter_set() {
                if let Some(node) = nodes_ref.node(idx) {
                    state.agent.enqueue(AgentRequest::new(
                        node.name.clone(),
                        format!("{}:{}", node.comm_name, node.port),
                        Body::TerminateJob(TerminateJob {
                            job_id: job.job_id,
                            timelimit: false,
                        }),
                    ));
                }
            }
            info!(job_id = job.job_id, "re-driving deallocation after reconfigure");
        }
    }

    let config_table = guard.config.get_mut();
    config_table.config = new_config;
    config_table.last_update = now;
    guard.nodes.get_mut().last_update = now;
    guard.parts.get_mut().last_update = now;
    guard.jobs.get_mut().last_update = now;
    drop(guard);

    info!(recovery, "configuration (re)loaded");
    Ok(soft_errors)
}

/// Translates a node set from one table's index space into another's, by
/// name.
fn remap_bitmap(
    bm: &Bitmap,
    from: &NodeTable,
    to: &NodeTable,
    job_id: u32,
) -> Result<Bitmap, ControllerError> {
    let mut out = Bitmap::with_size(to.len());
    for idx in bm.iter_set() {
        let name = from
            .node(idx)
            .map(|n| n.name.clone())
            .ok_or_else(|| {
                ControllerError::Internal(format!(
                    "job {job_id} references node index {idx} outside the old table"
                ))
            })?;
        let new_idx = to.lookup(&name).ok_or_else(|| {
            ControllerError::Internal(format!(
                "job {job_id} is bound to node '{name}' which is no longer configured"
            ))
        })?;
        out.set(new_idx);
    }
    Ok(out)
}

/// Builds the node table from `[[node]]` lines, seeding dynamic state from
/// the previous incarnation where names match.
fn build_node_table(
    config: &Config,
    old_nodes: &NodeTable,
) -> Result<NodeTable, ControllerError> {
    let mut table = NodeTable::default();
    for line in &config.nodes {
        let names = hostlist::expand(&line.names)?;
        let comm_names = match &line.comm_names {
            Some(expr) => {
                let expanded = hostlist::expand(expr)?;
                if expanded.len() != names.len() {
                    // Mismatched positional lists would scramble routing.
                    error!(
                        names = %line.names,
                        comm = %expr,
                        "comm_names expansion does not match names expansion"
                    );
                    return Err(ControllerError::Internal(format!(
                        "node line '{}': comm_names count mismatch",
                        line.names
                    )));
                }
                Some(expanded)
            }
            None => None,
        };
        let future = matches!(line.state.as_deref(), Some("future"));
        let config_idx = table.config_records.len();
        let mut record_bitmap = Bitmap::default();

        for (pos, name) in names.iter().enumerate() {
            if table.lookup(name).is_some() {
                return Err(ControllerError::Internal(format!(
                    "node '{name}' defined more than once"
                )));
            }
            let old = old_nodes.lookup(name).and_then(|i| old_nodes.node(i));
            let node = Node {
                name: name.clone(),
                comm_name: comm_names
                    .as_ref()
                    .map(|c| c[pos].clone())
                    .unwrap_or_else(|| name.clone()),
                port: line.port,
                // A brand-new node enters service idle; `unknown` only
                // survives recovery of a node that never registered.
                state: match old {
                    Some(o) => o.state,
                    None if future => BaseState::Future,
                    None => BaseState::Idle,
                },
                flags: old.map(|o| o.flags).unwrap_or(NodeFlags::empty()),
                config_cpus: line.cpus,
                config_memory: line.real_memory,
                config_tmp_disk: line.tmp_disk,
                reported_cpus: old.map(|o| o.reported_cpus).unwrap_or(0),
                reported_memory: old.map(|o| o.reported_memory).unwrap_or(0),
                reported_tmp_disk: old.map(|o| o.reported_tmp_disk).unwrap_or(0),
                weight: line.weight,
                features: line.feature.clone(),
                run_job_cnt: 0,
                comp_job_cnt: 0,
                no_share_job_cnt: 0,
                last_response: old.map(|o| o.last_response).unwrap_or(0),
                reason: old.and_then(|o| o.reason.clone()),
                config_idx,
                partitions: Vec::new(),
            };
            table.nodes.push(node);
        }
        let total = table.nodes.len();
        record_bitmap.resize(total);
        for i in (total - names.len())..total {
            record_bitmap.set(i);
        }
        table.config_records.push(ConfigRecord {
            cpus: line.cpus,
            real_memory: line.real_memory,
            tmp_disk: line.tmp_disk,
            weight: line.weight,
            feature: line.feature.clone(),
            node_bitmap: record_bitmap,
        });
    }
    // Config records were built against a growing table; widen their
    // bitmaps to the final node count.
    let total = table.nodes.len();
    for record in &mut table.config_records {
        record.node_bitmap.resize(total);
    }
    table.rebuild_hash();
    Ok(table)
}

/// Builds the partition table from `[[partition]]` lines and wires up the
/// node back-references.
fn build_part_table(
    config: &Config,
    nodes: &mut NodeTable,
) -> Result<PartTable, ControllerError> {
    let mut table = PartTable::default();
    for (part_idx, line) in config.partitions.iter().enumerate() {
        if table.lookup(&line.name).is_some() {
            return Err(ControllerError::Internal(format!(
                "partition '{}' defined more than once",
                line.name
            )));
        }
        let mut bitmap = Bitmap::with_size(nodes.len());
        let mut total_cpus = 0u32;
        if !line.nodes.trim().is_empty() {
            for name in hostlist::expand(&line.nodes)? {
                // A partition naming an undefined node is a configuration
                // integrity failure; refusing to start beats scheduling
                // into a phantom.
                let idx = nodes.lookup(&name).ok_or_else(|| {
                    ControllerError::Internal(format!(
                        "partition '{}' references undefined node '{name}'",
                        line.name
                    ))
                })?;
                bitmap.set(idx);
                let node = nodes.node_mut(idx).expect("index from lookup");
                if !node.partitions.contains(&part_idx) {
                    node.partitions.push(part_idx);
                }
                total_cpus += node.avail_cpus(config.fast_schedule);
            }
        }
        let total_nodes = bitmap.count() as u32;
        table.parts.insert(
            line.name.clone(),
            Partition {
                name: line.name.clone(),
                node_list: line.nodes.clone(),
                node_bitmap: bitmap,
                min_nodes: line.min_nodes,
                max_nodes: line.max_nodes.unwrap_or(u32::MAX),
                max_time: line.max_time.unwrap_or(u32::MAX),
                root_only: line.root_only,
                hidden: line.hidden,
                shared: line.shared,
                state_up: line.state_up,
                default_part: line.default,
                allow_groups: line.allow_groups.clone(),
                allow_uids: Vec::new(),
                total_nodes,
                total_cpus,
            },
        );
    }
    Ok(table)
}

/// Re-resolves each partition's `allow_groups` into a uid list via the
/// system group database. Called from the config loader and periodically
/// by the background loop.
pub fn refresh_group_uids(parts: &mut PartTable) {
    for part in parts.parts.values_mut() {
        let Some(groups) = part.allow_groups.clone() else {
            part.allow_uids.clear();
            continue;
        };
        let mut uids: Vec<u32> = Vec::new();
        for group in &groups {
            for uid in resolve_group_members(group) {
                if !uids.contains(&uid) {
                    uids.push(uid);
                }
            }
        }
        uids.sort_unstable();
        part.allow_uids = uids;
    }
}

/// Member uids of one unix group, via the libc group/passwd databases.
fn resolve_group_members(group: &str) -> Vec<u32> {
    let mut uids = Vec::new();
    let Ok(gname) = std::ffi::CString::new(group.as_bytes()) else {
        return uids;
    };
    unsafe {
        let grp = libc::getgrnam(gname.as_ptr());
        if grp.is_null() {
            warn!(group, "allow_groups names an unknown group");
            return uids;
        }
        let mut member = (*grp).gr_mem;
        while !member.is_null() && !(*member).is_null() {
            let user = std::ffi::CStr::from_ptr(*member);
            let pwd = libc::getpwnam(user.as_ptr());
            if !pwd.is_null() {
                uids.push((*pwd).pw_uid);
            }
            member = member.add(1);
        }
        // Users whose *primary* group matches are not in gr_mem; pick
        // them up by gid when the passwd scan is cheap enough to matter.
        let gid = (*grp).gr_gid;
        libc::setpwent();
        loop {
            let pwd = libc::getpwent();
            if pwd.is_null() {
                break;
            }
            if (*pwd).pw_gid == gid {
                uids.push((*pwd).pw_uid);
            }
        }
        libc::endpwent();
    }
    uids
}
