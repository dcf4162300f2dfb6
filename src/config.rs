// src/config.rs

//! Manages controller configuration: loading, resolving dynamic values, and
//! validation.
//!
//! The declarative cluster description is one TOML file: scalar parameters,
//! `[[node]]` lines and `[[partition]]` lines. Node and partition node
//! strings are host-range expressions expanded by `core::hostlist`. The
//! file is re-read as a whole on reconfigure; the config loader decides
//! what survives from the previous incarnation.

use anyhow::{Context, Result, anyhow};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

bitflags! {
    /// Categories hidden from non-privileged callers when listed in
    /// `private_data`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrivateData: u16 {
        const JOBS = 1 << 0;
        const NODES = 1 << 1;
        const PARTITIONS = 1 << 2;
    }
}

/// One `[[node]]` line: a hardware description shared by every host the
/// range expression expands to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeLine {
    pub names: String,
    #[serde(default = "default_node_cpus")]
    pub cpus: u32,
    #[serde(default = "default_node_memory")]
    pub real_memory: u64,
    #[serde(default)]
    pub tmp_disk: u64,
    #[serde(default = "default_node_weight")]
    pub weight: u32,
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// Alternative communication names, expanded positionally against
    /// `names` when present.
    #[serde(default)]
    pub comm_names: Option<String>,
    /// `"future"` keeps the hosts out of service until re-declared.
    #[serde(default)]
    pub state: Option<String>,
}

fn default_node_cpus() -> u32 {
    1
}
fn default_node_memory() -> u64 {
    1
}
fn default_node_weight() -> u32 {
    1
}
fn default_worker_port() -> u16 {
    6818
}

/// One `[[partition]]` line.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartitionLine {
    pub name: String,
    #[serde(default)]
    pub nodes: String,
    #[serde(default)]
    pub default: bool,
    /// Maximum run time in minutes; absent means unlimited.
    #[serde(default)]
    pub max_time: Option<u32>,
    #[serde(default = "default_part_min_nodes")]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub root_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_shared")]
    pub shared: SharedPolicy,
    #[serde(default = "default_part_up")]
    pub state_up: bool,
    #[serde(default)]
    pub allow_groups: Option<Vec<String>>,
}

fn default_part_min_nodes() -> u32 {
    1
}
fn default_part_up() -> bool {
    true
}
fn default_shared() -> SharedPolicy {
    SharedPolicy::No
}

/// Whether jobs may share nodes in a partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SharedPolicy {
    #[default]
    No,
    Yes,
    Force,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    6827
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    control_hosts: Vec<String>,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_state_save_location")]
    state_save_location: String,
    #[serde(default = "default_auth_type")]
    auth_type: String,
    #[serde(default = "default_sched_type")]
    sched_type: String,
    #[serde(default = "default_select_type")]
    select_type: String,
    #[serde(default = "default_accounting_type")]
    accounting_type: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_key_path")]
    cred_key_path: String,
    #[serde(default = "default_worker_user")]
    worker_user: String,
    #[serde(default = "default_pidfile")]
    pidfile: String,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    heartbeat_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_controller_timeout")]
    controller_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_worker_timeout")]
    worker_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_batch_start_timeout")]
    batch_start_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_msg_timeout")]
    msg_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_min_job_age")]
    min_job_age: Duration,
    #[serde(with = "humantime_serde", default = "default_inactive_limit")]
    inactive_limit: Duration,
    #[serde(with = "humantime_serde", default = "default_schedule_interval")]
    schedule_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_checkpoint_interval")]
    checkpoint_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_group_refresh_interval")]
    group_refresh_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    health_check_interval: Duration,
    #[serde(default)]
    health_check_program: Option<String>,
    #[serde(default = "default_tree_width")]
    tree_width: u16,
    #[serde(default = "default_fast_schedule")]
    fast_schedule: bool,
    #[serde(default = "default_first_job_id")]
    first_job_id: u32,
    #[serde(default = "default_max_job_id")]
    max_job_id: u32,
    #[serde(default)]
    private_data: Vec<String>,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default, rename = "node")]
    nodes: Vec<NodeLine>,
    #[serde(default, rename = "partition")]
    partitions: Vec<PartitionLine>,
}

fn default_port() -> u16 {
    6817
}
fn default_state_save_location() -> String {
    "beryl_state".to_string()
}
fn default_auth_type() -> String {
    "shared-key".to_string()
}
fn default_sched_type() -> String {
    "fifo".to_string()
}
fn default_select_type() -> String {
    "linear".to_string()
}
fn default_accounting_type() -> String {
    "none".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_key_path() -> String {
    "beryl.key".to_string()
}
fn default_worker_user() -> String {
    "root".to_string()
}
fn default_pidfile() -> String {
    "/var/run/beryld.pid".to_string()
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_controller_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_worker_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_batch_start_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_msg_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_min_job_age() -> Duration {
    Duration::from_secs(300)
}
fn default_inactive_limit() -> Duration {
    Duration::ZERO
}
fn default_schedule_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_group_refresh_interval() -> Duration {
    Duration::from_secs(600)
}
fn default_health_check_interval() -> Duration {
    Duration::ZERO
}
fn default_tree_width() -> u16 {
    50
}
fn default_fast_schedule() -> bool {
    true
}
fn default_first_job_id() -> u32 {
    1
}
fn default_max_job_id() -> u32 {
    0x7FFF_FFFE
}

/// Represents the final, validated, and resolved controller configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub control_hosts: Vec<String>,
    pub port: u16,
    pub state_save_location: String,
    pub auth_type: String,
    pub sched_type: String,
    pub select_type: String,
    pub accounting_type: String,
    pub log_level: String,
    pub cred_key_path: String,
    pub worker_user: String,
    pub pidfile: String,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub controller_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub worker_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub batch_start_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub msg_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub min_job_age: Duration,
    #[serde(with = "humantime_serde")]
    pub inactive_limit: Duration,
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub group_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    pub health_check_program: Option<String>,
    pub tree_width: u16,
    pub fast_schedule: bool,
    pub first_job_id: u32,
    pub max_job_id: u32,
    #[serde(skip)]
    pub private_data: PrivateData,
    pub metrics: MetricsConfig,
    pub nodes: Vec<NodeLine>,
    pub partitions: Vec<PartitionLine>,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_str(&contents)
    }

    /// Parses a configuration from TOML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(contents).context("Failed to parse configuration TOML")?;

        let private_data = resolve_private_data(&raw.private_data)?;

        let config = Config {
            control_hosts: raw.control_hosts,
            port: raw.port,
            state_save_location: raw.state_save_location,
            auth_type: raw.auth_type,
            sched_type: raw.sched_type,
            select_type: raw.select_type,
            accounting_type: raw.accounting_type,
            log_level: raw.log_level,
            cred_key_path: raw.cred_key_path,
            worker_user: raw.worker_user,
            pidfile: raw.pidfile,
            heartbeat_interval: raw.heartbeat_interval,
            controller_timeout: raw.controller_timeout,
            worker_timeout: raw.worker_timeout,
            batch_start_timeout: raw.batch_start_timeout,
            msg_timeout: raw.msg_timeout,
            min_job_age: raw.min_job_age,
            inactive_limit: raw.inactive_limit,
            schedule_interval: raw.schedule_interval,
            checkpoint_interval: raw.checkpoint_interval,
            group_refresh_interval: raw.group_refresh_interval,
            health_check_interval: raw.health_check_interval,
            health_check_program: raw.health_check_program,
            tree_width: raw.tree_width,
            fast_schedule: raw.fast_schedule,
            first_job_id: raw.first_job_id,
            max_job_id: raw.max_job_id,
            private_data,
            metrics: raw.metrics,
            nodes: raw.nodes,
            partitions: raw.partitions,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    /// The default-partition and non-empty-node rules are enforced later by
    /// the config loader, because administrative updates can change them at
    /// runtime; this method checks only what must hold for any incarnation.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.control_hosts.is_empty() {
            return Err(anyhow!("control_hosts cannot be empty"));
        }
        for host in &self.control_hosts {
            if host.trim().is_empty() {
                return Err(anyhow!("control_hosts entries cannot be blank"));
            }
        }
        if self.controller_timeout.is_zero() {
            return Err(anyhow!("controller_timeout cannot be 0"));
        }
        if self.msg_timeout.is_zero() {
            return Err(anyhow!("msg_timeout cannot be 0"));
        }
        if self.tree_width == 0 {
            return Err(anyhow!("tree_width cannot be 0"));
        }
        if self.first_job_id == 0 || self.first_job_id >= self.max_job_id {
            return Err(anyhow!(
                "first_job_id must be non-zero and below max_job_id"
            ));
        }
        for line in &self.nodes {
            if line.names.trim().is_empty() {
                return Err(anyhow!("a [[node]] entry has an empty names expression"));
            }
            if line.cpus == 0 {
                return Err(anyhow!("node line '{}' declares 0 cpus", line.names));
            }
        }
        for line in &self.partitions {
            if line.name.trim().is_empty() {
                return Err(anyhow!("a [[partition]] entry has an empty name"));
            }
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main controller port"
                ));
            }
        }
        Ok(())
    }

    /// The ordinal of `host` in the control-host list, if it is one.
    pub fn backup_index_of(&self, host: &str) -> Option<usize> {
        self.control_hosts.iter().position(|h| h == host)
    }
}

fn resolve_private_data(names: &[String]) -> Result<PrivateData> {
    let mut flags = PrivateData::empty();
    for name in names {
        match name.to_ascii_lowercase().as_str() {
            "jobs" => flags |= PrivateData::JOBS,
            "nodes" => flags |= PrivateData::NODES,
            "partitions" => flags |= PrivateData::PARTITIONS,
            other => return Err(anyhow!("unknown private_data category '{other}'")),
        }
    }
    Ok(flags)
}
