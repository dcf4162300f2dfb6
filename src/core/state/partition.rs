// src/core/state/partition.rs

//! The partition table: named scheduling queues over subsets of the node
//! table.

use crate::core::bitmap::Bitmap;
use crate::config::SharedPolicy;
use indexmap::IndexMap;

/// A named scheduling queue.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    /// The configured node-list expression; the bitmap is derived from it.
    pub node_list: String,
    pub node_bitmap: Bitmap,
    pub min_nodes: u32,
    /// `u32::MAX` means unlimited.
    pub max_nodes: u32,
    /// Minutes; `u32::MAX` means unlimited.
    pub max_time: u32,
    pub root_only: bool,
    pub hidden: bool,
    pub shared: SharedPolicy,
    pub state_up: bool,
    pub default_part: bool,
    pub allow_groups: Option<Vec<String>>,
    /// Uids resolved from `allow_groups`, refreshed periodically by the
    /// background loop. Empty with `allow_groups = None` means everyone.
    pub allow_uids: Vec<u32>,
    pub total_nodes: u32,
    pub total_cpus: u32,
}

impl Partition {
    /// Whether `uid` may submit into this partition. Root always may.
    pub fn permits_user(&self, uid: u32) -> bool {
        if uid == 0 {
            return true;
        }
        if self.root_only {
            return false;
        }
        match &self.allow_groups {
            None => true,
            Some(_) => self.allow_uids.contains(&uid),
        }
    }
}

/// In-memory table of all partitions, in configuration-file order.
#[derive(Debug, Default)]
pub struct PartTable {
    pub parts: IndexMap<String, Partition>,
    pub last_update: i64,
}

impl PartTable {
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<&Partition> {
        self.parts.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.parts.get_mut(name)
    }

    /// The partition used when a request names none.
    pub fn default_partition(&self) -> Option<&Partition> {
        self.parts.values().find(|p| p.default_part)
    }

    /// Index of a partition in table order; node records back-reference
    /// partitions by this index.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.parts.get_index_of(name)
    }
}
