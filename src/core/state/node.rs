// src/core/state/node.rs

//! The node table: one record per compute host, configuration records
//! grouping hosts with identical hardware, and the global scheduling
//! bitmaps derived from node state.

use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use bitflags::bitflags;
use strum_macros::{Display, EnumString};

/// Base state of a node. Exactly one at a time; orthogonal conditions live
/// in `NodeFlags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[repr(u16)]
pub enum BaseState {
    #[default]
    Unknown = 0,
    Idle = 1,
    Allocated = 2,
    Completing = 3,
    Down = 4,
    Future = 5,
}

impl BaseState {
    pub fn from_u16(v: u16) -> Result<Self, ControllerError> {
        match v {
            0 => Ok(BaseState::Unknown),
            1 => Ok(BaseState::Idle),
            2 => Ok(BaseState::Allocated),
            3 => Ok(BaseState::Completing),
            4 => Ok(BaseState::Down),
            5 => Ok(BaseState::Future),
            other => Err(ControllerError::Protocol(format!(
                "bad node base state {other}"
            ))),
        }
    }
}

bitflags! {
    /// Orthogonal node condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        const NO_RESPOND = 1 << 0;
        const DRAIN = 1 << 1;
        const FAIL = 1 << 2;
        const POWER_SAVE = 1 << 3;
        const MAINT = 1 << 4;
    }
}

/// Requested state in an `update-node` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestedNodeState {
    Idle = 1,
    Down = 4,
    Drain = 100,
    Resume = 101,
}

impl RequestedNodeState {
    pub fn from_u16(v: u16) -> Result<Self, ControllerError> {
        match v {
            1 => Ok(RequestedNodeState::Idle),
            4 => Ok(RequestedNodeState::Down),
            100 => Ok(RequestedNodeState::Drain),
            101 => Ok(RequestedNodeState::Resume),
            other => Err(ControllerError::Protocol(format!(
                "bad requested node state {other}"
            ))),
        }
    }
}

/// A group of nodes sharing one hardware specification (one `[[node]]`
/// config line). Carries a bitmap of the nodes it covers.
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    pub cpus: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub weight: u32,
    pub feature: Option<String>,
    pub node_bitmap: Bitmap,
}

/// One compute host.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub comm_name: String,
    pub port: u16,
    pub state: BaseState,
    pub flags: NodeFlags,
    /// Capacities as declared in the configuration.
    pub config_cpus: u32,
    pub config_memory: u64,
    pub config_tmp_disk: u64,
    /// Capacities as last reported by the worker; zero until registration.
    pub reported_cpus: u32,
    pub reported_memory: u64,
    pub reported_tmp_disk: u64,
    pub weight: u32,
    pub features: Option<String>,
    pub run_job_cnt: u32,
    pub comp_job_cnt: u32,
    pub no_share_job_cnt: u32,
    pub last_response: i64,
    pub reason: Option<String>,
    /// Index into the configuration-record table.
    pub config_idx: usize,
    /// Indices into the partition table, maintained by the config loader.
    pub partitions: Vec<usize>,
}

impl Node {
    /// The cpu count scheduling math should use. The `fast_schedule` flag
    /// selects configured versus reported capacities; every consumer goes
    /// through this accessor so the choice is made in exactly one place.
    pub fn avail_cpus(&self, fast_schedule: bool) -> u32 {
        if fast_schedule || self.reported_cpus == 0 {
            self.config_cpus
        } else {
            self.reported_cpus
        }
    }

    /// Drain flag with work still in flight.
    pub fn is_draining(&self) -> bool {
        self.flags.contains(NodeFlags::DRAIN) && (self.run_job_cnt + self.comp_job_cnt) > 0
    }

    /// Drain flag with nothing left running or completing.
    pub fn is_drained(&self) -> bool {
        self.flags.contains(NodeFlags::DRAIN) && self.run_job_cnt == 0 && self.comp_job_cnt == 0
    }

    /// True when the node may receive new work.
    pub fn is_available(&self) -> bool {
        !matches!(self.state, BaseState::Down | BaseState::Future | BaseState::Unknown)
            && !self.flags.contains(NodeFlags::DRAIN)
            && !self.flags.contains(NodeFlags::FAIL)
            && !self.flags.contains(NodeFlags::NO_RESPOND)
    }

    /// True when the node is idle with no residual work.
    pub fn is_idle(&self) -> bool {
        self.state == BaseState::Idle && self.run_job_cnt == 0 && self.comp_job_cnt == 0
    }

    /// Human-readable compound state for logs: `idle`, `idle+drain`, ...
    pub fn state_string(&self) -> String {
        let mut s = self.state.to_string();
        if self.flags.contains(NodeFlags::DRAIN) {
            s.push_str("+drain");
        }
        if self.flags.contains(NodeFlags::NO_RESPOND) {
            s.push('*');
        }
        s
    }
}

/// In-memory table of all nodes plus the derived bitmaps.
#[derive(Debug, Default)]
pub struct NodeTable {
    pub nodes: Vec<Node>,
    by_name: std::collections::HashMap<String, usize>,
    pub config_records: Vec<ConfigRecord>,
    pub idle_bitmap: Bitmap,
    pub avail_bitmap: Bitmap,
    pub share_bitmap: Bitmap,
    pub last_update: i64,
}

impl NodeTable {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// O(1) name lookup through the internal hash.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    pub fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx)
    }

    /// Rebuilds the name hash; required after any bulk reconfigure.
    pub fn rebuild_hash(&mut self) {
        self.by_name = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
    }

    /// Recomputes the three global bitmaps from scratch. Every mutation
    /// that could affect them must call this inside the same write lock.
    pub fn sync_bitmaps(&mut self) {
        let n = self.nodes.len();
        let mut idle = Bitmap::with_size(n);
        let mut avail = Bitmap::with_size(n);
        let mut share = Bitmap::with_size(n);
        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_idle() && !node.flags.intersects(NodeFlags::DRAIN | NodeFlags::FAIL) {
                idle.set(i);
            }
            if node.is_available() {
                avail.set(i);
            }
            if node.no_share_job_cnt == 0 {
                share.set(i);
            }
        }
        self.idle_bitmap = idle;
        self.avail_bitmap = avail;
        self.share_bitmap = share;
    }

    /// Folds a node bitmap back into a compact host-range string.
    pub fn bitmap_to_names(&self, bm: &Bitmap) -> String {
        let names: Vec<String> = bm
            .iter_set()
            .filter_map(|i| self.nodes.get(i).map(|n| n.name.clone()))
            .collect();
        crate::core::hostlist::fold(&names)
    }

    /// Validates an administrative state change. Permitted:
    /// any -> down, any -> drain, down|drained -> idle,
    /// draining -> allocated (drain cleared with work in flight),
    /// resume from down/drain.
    pub fn validate_state_change(
        node: &Node,
        requested: RequestedNodeState,
    ) -> Result<(), ControllerError> {
        match requested {
            RequestedNodeState::Down | RequestedNodeState::Drain => Ok(()),
            RequestedNodeState::Resume => Ok(()),
            RequestedNodeState::Idle => {
                if node.state == BaseState::Down || node.is_drained() {
                    Ok(())
                } else {
                    Err(ControllerError::InvalidNodeStateChange(
                        node.state_string(),
                        "idle".to_string(),
                    ))
                }
            }
        }
    }
}
